//! Current-archive singleton and background refresh loop (§4.B, §9).
//!
//! Grounded on the teacher's `GTFSManager`/`start_updater` (`static_data.rs`):
//! same `Arc<RwLock<..>>` shared-snapshot shape and "load once synchronously,
//! then refresh in the background" lifecycle, adapted to `tokio::spawn` +
//! `tokio::time::interval` instead of a raw OS thread, and to an RCU swap of
//! a whole `Arc<ScheduleArchive>` rather than locking for the read path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use gtfs_structures::Gtfs;
use tracing::{error, info, warn};

use crate::error::ScheduleError;
use crate::schedule::archive::{
    download_registry_text, ensure_extracted, newest_cached_archive, parse_registry, read_cached_registry,
    select_archive_for_date, should_refresh_registry, write_cached_registry, ArchiveRegistryRow, ScheduleArchive,
};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Shared, swappable pointer to the currently-active archive. Readers clone
/// the inner `Arc` under a brief read lock and then work against the clone
/// with no lock held — the watcher never blocks an in-flight enrichment.
#[derive(Clone)]
pub struct CurrentArchive {
    inner: Arc<RwLock<Arc<ScheduleArchive>>>,
}

impl CurrentArchive {
    pub fn new(initial: ScheduleArchive) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn get(&self) -> Arc<ScheduleArchive> {
        self.inner.read().unwrap().clone()
    }

    fn swap(&self, next: ScheduleArchive) {
        *self.inner.write().unwrap() = Arc::new(next);
    }
}

pub struct WatcherConfig {
    pub registry_url: String,
    pub cache_root: PathBuf,
    pub archives_filename: String,
    pub refresh_interval_days: i64,
    pub route_filter: Option<HashSet<String>>,
}

/// Blocking initial load, run synchronously at startup before any worker is
/// spawned (mirrors the teacher's `load_initial` — a failure here is fatal,
/// not backgrounded).
pub fn load_initial(config: &WatcherConfig, service_date: NaiveDate) -> Result<ScheduleArchive, ScheduleError> {
    let dir = resolve_archive_dir(config, service_date)?;
    build_archive(&dir, service_date, config.route_filter.as_ref())
}

/// Spawns the 60s background refresh loop. The returned handle is held by
/// the orchestrator only to abort it on shutdown.
pub fn spawn(
    current: CurrentArchive,
    config: WatcherConfig,
    current_service_date: impl Fn() -> NaiveDate + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let service_date = current_service_date();
            if service_date == current.get().service_date {
                continue;
            }
            match update_if_necessary(&config, service_date) {
                Ok(next) => {
                    info!(date = %service_date, "schedule archive rolled to new service date");
                    current.swap(next);
                }
                Err(e) => {
                    error!(error = %e, "failed to refresh schedule archive; keeping previous");
                }
            }
        }
    })
}

fn update_if_necessary(config: &WatcherConfig, service_date: NaiveDate) -> Result<ScheduleArchive, ScheduleError> {
    let dir = resolve_archive_dir(config, service_date)?;
    build_archive(&dir, service_date, config.route_filter.as_ref())
}

fn build_archive(
    dir: &Path,
    service_date: NaiveDate,
    route_filter: Option<&HashSet<String>>,
) -> Result<ScheduleArchive, ScheduleError> {
    let gtfs = Gtfs::from_path(dir).map_err(|e| ScheduleError::Gtfs(e.to_string()))?;
    Ok(ScheduleArchive::from_gtfs(&gtfs, service_date, route_filter))
}

/// Resolves the extracted archive directory for `service_date`, per the
/// registry-then-cache-then-fallback policy in §4.B. A successful fetch is
/// cached to disk (§6's `data/gtfs_archives/archived_feeds.txt`) so a later
/// fetch failure can still recover a recent registry listing before falling
/// through to the newest already-extracted archive.
fn resolve_archive_dir(config: &WatcherConfig, service_date: NaiveDate) -> Result<PathBuf, ScheduleError> {
    let rows = match download_registry_text(&config.registry_url) {
        Ok(body) => {
            if let Err(e) = write_cached_registry(&config.cache_root, &config.archives_filename, &body) {
                warn!(error = %e, "failed to cache archive registry locally");
            }
            match parse_registry(&body) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "failed to parse fetched archive registry; falling back to cached registry");
                    return resolve_from_cached_registry(config, service_date);
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "archive registry fetch failed; falling back to cached registry");
            return resolve_from_cached_registry(config, service_date);
        }
    };

    match select_archive_for_date(&rows, service_date) {
        Some(matched) => {
            maybe_warn_stale(&rows, matched, config.refresh_interval_days, service_date);
            ensure_extracted(&config.cache_root, &matched.archive_url)
        }
        None => {
            warn!(date = %service_date, "no registry row covers service date; falling back to cache");
            newest_cached_archive(&config.cache_root).ok_or(ScheduleError::NoArchiveAvailable)
        }
    }
}

fn resolve_from_cached_registry(config: &WatcherConfig, service_date: NaiveDate) -> Result<PathBuf, ScheduleError> {
    match read_cached_registry(&config.cache_root, &config.archives_filename) {
        Ok(rows) => match select_archive_for_date(&rows, service_date) {
            Some(matched) => ensure_extracted(&config.cache_root, &matched.archive_url),
            None => newest_cached_archive(&config.cache_root).ok_or(ScheduleError::NoArchiveAvailable),
        },
        Err(e) => {
            warn!(error = %e, "no cached archive registry available either; falling back to newest extracted archive");
            newest_cached_archive(&config.cache_root).ok_or(ScheduleError::NoArchiveAvailable)
        }
    }
}

fn maybe_warn_stale(
    _rows: &[ArchiveRegistryRow],
    matched: &ArchiveRegistryRow,
    refresh_interval_days: i64,
    today: NaiveDate,
) {
    if should_refresh_registry(matched, refresh_interval_days, today) {
        warn!(
            feed_start_date = %matched.feed_start_date,
            "matched registry row is older than the refresh interval"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::archive::{StopTimeRecord, TripRecord};

    fn empty_archive(service_date: NaiveDate) -> ScheduleArchive {
        ScheduleArchive::from_records(service_date, Vec::<TripRecord>::new(), Vec::<StopTimeRecord>::new())
    }

    #[test]
    fn current_archive_get_reflects_latest_swap() {
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let current = CurrentArchive::new(empty_archive(day1));
        assert_eq!(current.get().service_date, day1);

        current.swap(empty_archive(day2));
        assert_eq!(current.get().service_date, day2);
    }

    #[test]
    fn cloned_handle_observes_swaps_made_through_original() {
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let current = CurrentArchive::new(empty_archive(day1));
        let handle = current.clone();

        current.swap(empty_archive(day2));

        assert_eq!(handle.get().service_date, day2);
    }
}
