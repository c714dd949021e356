//! Object-store mirror (§4.K, §6): walks the partitioned CSV tree, gzips
//! each shard, and mirrors it into `Events-live/`.
//!
//! The HTTP PUT sits behind [`ObjectStoreClient`] so the walk/gzip path has
//! unit coverage without real network I/O, the same "trait at the seam"
//! idiom the feed sources use.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

const DAILY_DIR_PREFIXES: &[&str] = &["daily-cr-data", "daily-rapid-data", "daily-bus-data"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload failed for {path}: {reason}")]
    Upload { path: PathBuf, reason: String },
}

/// The seam between the walk/gzip logic and the actual object store. A real
/// implementation issues an HTTP PUT; tests use an in-memory recorder.
pub trait ObjectStoreClient {
    fn put(&self, key: &str, body: Vec<u8>, content_type: &str, content_encoding: &str) -> Result<(), String>;
}

pub struct S3ObjectStoreClient {
    client: reqwest::blocking::Client,
    bucket_url: String,
}

impl S3ObjectStoreClient {
    pub fn new(bucket_url: String) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            bucket_url,
        }
    }
}

impl ObjectStoreClient for S3ObjectStoreClient {
    fn put(&self, key: &str, body: Vec<u8>, content_type: &str, content_encoding: &str) -> Result<(), String> {
        let url = format!("{}/{}", self.bucket_url.trim_end_matches('/'), key);
        self.client
            .put(url)
            .header("content-type", content_type)
            .header("content-encoding", content_encoding)
            .body(body)
            .send()
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Finds every `events.csv` shard under `data_root`'s daily-* directories
/// whose `Year=/Month=/Day=` partition falls within `[start_date, end_date]`
/// (inclusive). `end_date` defaults to today when `--start-date` is omitted
/// upstream; this function only ever receives a concrete range.
pub fn find_shards(data_root: &Path, start_date: NaiveDate, end_date: NaiveDate) -> Vec<PathBuf> {
    let mut shards = Vec::new();
    for prefix in DAILY_DIR_PREFIXES {
        let base = data_root.join(prefix);
        if !base.is_dir() {
            continue;
        }
        walk_for_shards(&base, start_date, end_date, &mut shards);
    }
    shards.sort();
    shards
}

fn walk_for_shards(dir: &Path, start_date: NaiveDate, end_date: NaiveDate, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_for_shards(&path, start_date, end_date, out);
        } else if path.file_name().and_then(|n| n.to_str()) == Some("events.csv") {
            if let Some(date) = partition_date(&path) {
                if date >= start_date && date <= end_date {
                    out.push(path);
                }
            }
        }
    }
}

/// Recovers the `Year=/Month=/Day=` partition date from a shard path's
/// ancestor components.
fn partition_date(shard_path: &Path) -> Option<NaiveDate> {
    let mut year = None;
    let mut month = None;
    let mut day = None;
    for component in shard_path.ancestors().filter_map(|p| p.file_name()).filter_map(|n| n.to_str()) {
        if let Some(v) = component.strip_prefix("Year=") {
            year = v.parse().ok();
        } else if let Some(v) = component.strip_prefix("Month=") {
            month = v.parse().ok();
        } else if let Some(v) = component.strip_prefix("Day=") {
            day = v.parse().ok();
        }
    }
    NaiveDate::from_ymd_opt(year?, month?, day?)
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Uploads every shard in `shards`, relative to `data_root`, under the
/// `Events-live/` prefix. Individual shard failures are logged and skipped
/// rather than aborting the whole run.
pub fn upload_shards(data_root: &Path, shards: &[PathBuf], client: &dyn ObjectStoreClient) -> usize {
    let mut uploaded = 0;
    for shard in shards {
        match upload_one(data_root, shard, client) {
            Ok(()) => uploaded += 1,
            Err(e) => warn!(shard = %shard.display(), error = %e, "failed to upload shard"),
        }
    }
    info!(count = uploaded, total = shards.len(), "s3-upload run complete");
    uploaded
}

fn upload_one(data_root: &Path, shard: &Path, client: &dyn ObjectStoreClient) -> Result<(), UploadError> {
    let bytes = std::fs::read(shard).map_err(|e| UploadError::Io { path: shard.to_path_buf(), source: e })?;
    let gzipped = gzip(&bytes).map_err(|e| UploadError::Io { path: shard.to_path_buf(), source: e })?;

    let relative = shard.strip_prefix(data_root).unwrap_or(shard);
    let key = format!("Events-live/{}.gz", relative.to_string_lossy().replace('\\', "/"));

    client
        .put(&key, gzipped, "text/csv", "gzip")
        .map_err(|reason| UploadError::Upload { path: shard.to_path_buf(), reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingClient {
        puts: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self { puts: Mutex::new(Vec::new()) }
        }
    }

    impl ObjectStoreClient for RecordingClient {
        fn put(&self, key: &str, body: Vec<u8>, _content_type: &str, _content_encoding: &str) -> Result<(), String> {
            self.puts.lock().unwrap().push((key.to_string(), body.len()));
            Ok(())
        }
    }

    fn write_shard(root: &Path, prefix: &str, date: NaiveDate, contents: &str) -> PathBuf {
        let dir = root
            .join(prefix)
            .join(format!("Year={}", date.format("%Y")))
            .join(format!("Month={}", date.format("%-m")))
            .join(format!("Day={}", date.format("%-d")));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn finds_shards_within_date_range() {
        let dir = tempfile::tempdir().unwrap();
        let in_range = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let out_of_range = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        write_shard(dir.path(), "daily-cr-data/CR-Worcester_0_WOR", in_range, "a");
        write_shard(dir.path(), "daily-rapid-data/place-davis", out_of_range, "b");

        let shards = find_shards(
            dir.path(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        );
        assert_eq!(shards.len(), 1);
        assert!(shards[0].ends_with("events.csv"));
    }

    #[test]
    fn upload_shards_gzips_and_keys_relative_to_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let shard = write_shard(dir.path(), "daily-cr-data/CR-Worcester_0_WOR", date, "service_date,route_id\n");

        let client = RecordingClient::new();
        let uploaded = upload_shards(dir.path(), &[shard], &client);

        assert_eq!(uploaded, 1);
        let puts = client.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].0.starts_with("Events-live/daily-cr-data/"));
        assert!(puts[0].0.ends_with(".gz"));
    }

    #[test]
    fn missing_shard_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = RecordingClient::new();
        let ghost = dir.path().join("daily-cr-data/nope/events.csv");
        let uploaded = upload_shards(dir.path(), &[ghost], &client);
        assert_eq!(uploaded, 0);
    }
}
