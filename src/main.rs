mod catalog;
mod cli;
mod config;
mod detect;
mod error;
mod feed;
mod model;
mod orchestrator;
mod s3_upload;
mod schedule;
mod time;
mod tripstate;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use catalog::AgencyCatalog;
use cli::{Cli, Command};
use config::AppConfig;
use feed::gtfs_rt::{GtfsRtSource, GtfsRtSourceConfig};
use feed::sse::{SseSource, SseSourceConfig};
use feed::FeedSource;
use orchestrator::{plan_assignments, spawn_workers, Worker};
use schedule::watcher::{self, CurrentArchive, WatcherConfig};
use time::CurrentServiceDate;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_FATAL_RUNTIME: i32 = 2;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match &cli.command {
        Command::Gobble => run_with_exit_code(|rt| rt.block_on(gobble(&cli.config))),
        Command::S3Upload { start_date } => {
            run_with_exit_code(|rt| rt.block_on(s3_upload_command(&cli.config, *start_date)))
        }
    };

    std::process::exit(exit_code);
}

fn run_with_exit_code(f: impl FnOnce(&tokio::runtime::Runtime) -> anyhow::Result<()>) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return EXIT_FATAL_RUNTIME;
        }
    };

    match f(&runtime) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "run failed");
            let is_config_error = e.chain().any(|cause| cause.downcast_ref::<config::AppConfigLoadError>().is_some());
            if is_config_error {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FATAL_RUNTIME
            }
        }
    }
}

async fn gobble(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)
        .map_err(config::AppConfigLoadError)
        .context("loading configuration")?;

    let catalog = Arc::new(AgencyCatalog::mbta());
    let tz = catalog.tz();
    let current_service_date = Arc::new(CurrentServiceDate::new(tz));

    let watcher_config = WatcherConfig {
        registry_url: format!("{}/{}", config.gtfs.archives_prefix, config.gtfs.archives_filename),
        cache_root: config.data_root.clone(),
        archives_filename: config.gtfs.archives_filename.clone(),
        refresh_interval_days: config.gtfs.refresh_interval_days,
        route_filter: Some(catalog.all_routes()),
    };

    info!("loading initial schedule archive");
    let initial_archive = watcher::load_initial(&watcher_config, current_service_date.get())
        .context("loading initial schedule archive")?;
    let current_archive = CurrentArchive::new(initial_archive);

    let service_date_for_watcher = current_service_date.clone();
    let _watcher_handle = watcher::spawn(current_archive.clone(), watcher_config, move || {
        service_date_for_watcher.get()
    });

    let writer = Arc::new(writer::PartitionedWriter::new(config.data_root.clone()));
    let assignments = plan_assignments(&catalog, &config.modes);

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();
    for assignment in assignments {
        let feed_source = build_feed_source(&config, &assignment.routes)?;
        workers.push(Worker::new(
            assignment.mode,
            feed_source,
            catalog.clone(),
            current_archive.clone(),
            writer.clone(),
            config.data_root.clone(),
            current_service_date.clone(),
            tz,
        ));
    }

    info!(worker_count = workers.len(), "starting ingest workers");
    let handles = spawn_workers(workers, cancel.clone());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining workers");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn build_feed_source(
    config: &AppConfig,
    routes: &std::collections::HashSet<String>,
) -> anyhow::Result<Box<dyn FeedSource>> {
    if config.use_gtfs_rt {
        let gtfs_rt = config.gtfs_rt.as_ref().context("gtfs_rt config missing despite use_gtfs_rt=true")?;
        let source = GtfsRtSource::new(GtfsRtSourceConfig {
            feed_url: gtfs_rt.feed_url.clone(),
            api_key: gtfs_rt.api_key.clone(),
            api_key_method: gtfs_rt.api_key_method,
            api_key_param_name: gtfs_rt.api_key_param_name.clone(),
            polling_interval: std::time::Duration::from_secs(gtfs_rt.polling_interval),
        });
        Ok(Box::new(source))
    } else {
        let sse = config.sse.as_ref().context("sse config missing despite use_gtfs_rt=false")?;
        let source = SseSource::new(SseSourceConfig {
            url: sse.url.clone(),
            route_ids: routes.iter().cloned().collect(),
            api_key: sse.api_key.clone(),
            api_key_header: sse.api_key_header.clone(),
        });
        Ok(Box::new(source))
    }
}

async fn s3_upload_command(config_path: &PathBuf, start_date: Option<chrono::NaiveDate>) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)
        .map_err(config::AppConfigLoadError)
        .context("loading configuration")?;

    let tz = AgencyCatalog::mbta().tz();
    let today = CurrentServiceDate::new(tz).get();
    let start = start_date.unwrap_or(today);

    let client = s3_upload::S3ObjectStoreClient::new(format!("https://events-live.{}.example.com", config.agency));
    let shards = s3_upload::find_shards(&config.data_root, start, today);
    info!(shard_count = shards.len(), "uploading shards");
    s3_upload::upload_shards(&config.data_root, &shards, &client);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
