//! Command-line surface (§4.K, §6): two subcommands, `gobble` (run the
//! orchestrator) and `s3-upload` (one-shot object-store mirror).

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gobbler", about = "Real-time transit vehicle-position event ingest")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs the orchestrator until a fatal error or shutdown signal.
    Gobble,
    /// Mirrors partitioned CSV shards to the object store as gzipped files.
    S3Upload {
        /// First service date to upload, `MM-DD-YYYY`. Defaults to today.
        #[arg(long, value_parser = parse_mm_dd_yyyy)]
        start_date: Option<NaiveDate>,
    },
}

fn parse_mm_dd_yyyy(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%m-%d-%Y").map_err(|e| format!("invalid date {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gobble_subcommand() {
        let cli = Cli::parse_from(["gobbler", "gobble"]);
        assert!(matches!(cli.command, Command::Gobble));
    }

    #[test]
    fn parses_s3_upload_with_start_date() {
        let cli = Cli::parse_from(["gobbler", "s3-upload", "--start-date", "01-04-2024"]);
        match cli.command {
            Command::S3Upload { start_date } => {
                assert_eq!(start_date, NaiveDate::from_ymd_opt(2024, 1, 4));
            }
            _ => panic!("expected S3Upload"),
        }
    }

    #[test]
    fn parses_s3_upload_without_start_date() {
        let cli = Cli::parse_from(["gobbler", "s3-upload"]);
        match cli.command {
            Command::S3Upload { start_date } => assert!(start_date.is_none()),
            _ => panic!("expected S3Upload"),
        }
    }

    #[test]
    fn custom_config_path_is_parsed() {
        let cli = Cli::parse_from(["gobbler", "--config", "/etc/gobbler.json", "gobble"]);
        assert_eq!(cli.config, PathBuf::from("/etc/gobbler.json"));
    }
}
