//! Crate-wide typed error taxonomy.
//!
//! Each variant corresponds to one row of the error-handling table: the
//! taxonomy is deliberately coarse (kinds, not causes) so a catch site can
//! decide a single `tracing` level per kind instead of per call site.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("feed connection closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gtfs parse error: {0}")]
    Gtfs(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no archive available locally or remotely")]
    NoArchiveAvailable,
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown agency: {0}")]
    UnknownAgency(String),
    #[error("missing required key: {0}")]
    MissingKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("violated invariant: {0}")]
    Invariant(String),
}
