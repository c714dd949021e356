//! Schedule archive: download/cache/index GTFS-static feeds per service
//! date (§4.B), plus the lazily-built as-of schedule arrays consumed by
//! the enrichment engine (§4.C, §9).

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{Datelike, NaiveDate, Weekday};
use gtfs_structures::{Exception, Gtfs};
use tracing::{info, warn};

use crate::error::ScheduleError;
use crate::time::to_dateint;

#[derive(Clone, Debug)]
pub struct TripRecord {
    pub trip_id: String,
    pub route_id: String,
    pub direction_id: u8,
    pub service_id: String,
}

#[derive(Clone, Debug)]
pub struct StopTimeRecord {
    pub trip_id: String,
    pub route_id: String,
    pub direction_id: u8,
    pub stop_id: String,
    /// Seconds since midnight of the service date.
    pub arrival_time: i64,
    pub stop_sequence: u32,
}

/// One entry in a route/direction/stop's sorted schedule, built lazily and
/// cached inside [`ScheduleArchive`] (§9 design note: "Tabular enrichment
/// without a dataframe library").
#[derive(Clone, Debug)]
pub struct ScheduleEntry {
    pub arrival_time_offset: i64,
    pub trip_id: String,
    pub scheduled_headway: Option<i64>,
    pub scheduled_tt: i64,
}

#[derive(Default)]
pub struct RouteStopSchedule {
    /// Sorted ascending by `arrival_time_offset`.
    pub entries: Vec<ScheduleEntry>,
}

type ScheduleKey = (String, u8, String);

/// Immutable snapshot bound to one service date. Readers never mutate it
/// directly (the lazily-built schedule cache is the one piece of interior
/// mutability, guarded by a lock and populated at most once per key).
pub struct ScheduleArchive {
    pub service_date: NaiveDate,
    trips_by_route: HashMap<String, Vec<TripRecord>>,
    stop_times_by_route: HashMap<String, Vec<StopTimeRecord>>,
    trip_start_time: HashMap<String, i64>,
    schedule_cache: RwLock<HashMap<ScheduleKey, std::sync::Arc<RouteStopSchedule>>>,
}

impl ScheduleArchive {
    /// Builds an archive from a parsed GTFS feed, filtering trips to those
    /// whose service is active on `service_date` and, optionally, to a
    /// route allow-list.
    pub fn from_gtfs(gtfs: &Gtfs, service_date: NaiveDate, route_filter: Option<&HashSet<String>>) -> Self {
        let active_services = active_service_ids(gtfs, service_date);

        let mut trips = Vec::new();
        let mut stop_times = Vec::new();

        for (trip_id, trip) in &gtfs.trips {
            if !active_services.contains(&trip.service_id) {
                continue;
            }
            let route_id = trip.route_id.clone();
            if let Some(filter) = route_filter {
                if !filter.contains(&route_id) {
                    continue;
                }
            }
            let direction_id = match trip.direction_id {
                Some(gtfs_structures::DirectionType::Outbound) => 0u8,
                Some(gtfs_structures::DirectionType::Inbound) => 1u8,
                None => 0u8,
            };

            trips.push(TripRecord {
                trip_id: trip_id.clone(),
                route_id: route_id.clone(),
                direction_id,
                service_id: trip.service_id.clone(),
            });

            for st in &trip.stop_times {
                let Some(arrival) = st.arrival_time.or(st.departure_time) else {
                    continue;
                };
                stop_times.push(StopTimeRecord {
                    trip_id: trip_id.clone(),
                    route_id: route_id.clone(),
                    direction_id,
                    stop_id: st.stop.id.clone(),
                    arrival_time: arrival as i64,
                    stop_sequence: st.stop_sequence as u32,
                });
            }
        }

        Self::from_records(service_date, trips, stop_times)
    }

    /// Builds an archive directly from pre-extracted records — the path
    /// used by tests (no `gtfs_structures::Gtfs` fixture required) and
    /// available for feeding non-GTFS schedule sources in the future.
    pub fn from_records(service_date: NaiveDate, trips: Vec<TripRecord>, stop_times: Vec<StopTimeRecord>) -> Self {
        let mut trips_by_route: HashMap<String, Vec<TripRecord>> = HashMap::new();
        for trip in trips {
            trips_by_route.entry(trip.route_id.clone()).or_default().push(trip);
        }

        let mut trip_start_time: HashMap<String, i64> = HashMap::new();
        for st in &stop_times {
            trip_start_time
                .entry(st.trip_id.clone())
                .and_modify(|t| *t = (*t).min(st.arrival_time))
                .or_insert(st.arrival_time);
        }

        let mut stop_times_by_route: HashMap<String, Vec<StopTimeRecord>> = HashMap::new();
        for st in stop_times {
            stop_times_by_route.entry(st.route_id.clone()).or_default().push(st);
        }

        Self {
            service_date,
            trips_by_route,
            stop_times_by_route,
            trip_start_time,
            schedule_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn trip_start_time(&self, trip_id: &str) -> Option<i64> {
        self.trip_start_time.get(trip_id).copied()
    }

    pub fn trips_for_route(&self, route_id: &str) -> &[TripRecord] {
        self.trips_by_route.get(route_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Looks up the scheduled arrival-minus-start travel time for one
    /// scheduled trip at one stop (§4.C step 7's final lookup).
    pub fn scheduled_tt_for_trip_stop(
        &self,
        route_id: &str,
        direction_id: u8,
        trip_id: &str,
        stop_id: &str,
    ) -> Option<i64> {
        let start = self.trip_start_time(trip_id)?;
        self.stop_times_by_route.get(route_id)?.iter().find_map(|r| {
            if r.trip_id == trip_id && r.direction_id == direction_id && r.stop_id == stop_id {
                Some(r.arrival_time - start)
            } else {
                None
            }
        })
    }

    /// Returns the sorted schedule array for one (route, direction, stop),
    /// building and caching it on first use (§9).
    pub fn route_stop_schedule(
        &self,
        route_id: &str,
        direction_id: u8,
        stop_id: &str,
    ) -> std::sync::Arc<RouteStopSchedule> {
        let key = (route_id.to_string(), direction_id, stop_id.to_string());
        if let Some(existing) = self.schedule_cache.read().unwrap().get(&key) {
            return existing.clone();
        }

        let built = std::sync::Arc::new(self.build_route_stop_schedule(route_id, direction_id, stop_id));
        self.schedule_cache.write().unwrap().insert(key, built.clone());
        built
    }

    fn build_route_stop_schedule(&self, route_id: &str, direction_id: u8, stop_id: &str) -> RouteStopSchedule {
        let mut rows: Vec<&StopTimeRecord> = self
            .stop_times_by_route
            .get(route_id)
            .into_iter()
            .flatten()
            .filter(|r| r.direction_id == direction_id && r.stop_id == stop_id)
            .collect();
        rows.sort_by_key(|r| r.arrival_time);

        let mut entries = Vec::with_capacity(rows.len());
        let mut prev_arrival: Option<i64> = None;
        for row in rows {
            let headway = prev_arrival.map(|p| row.arrival_time - p);
            let scheduled_tt = self
                .trip_start_time(&row.trip_id)
                .map(|start| row.arrival_time - start)
                .unwrap_or(0);
            entries.push(ScheduleEntry {
                arrival_time_offset: row.arrival_time,
                trip_id: row.trip_id.clone(),
                scheduled_headway: headway,
                scheduled_tt,
            });
            prev_arrival = Some(row.arrival_time);
        }
        RouteStopSchedule { entries }
    }
}

fn active_service_ids(gtfs: &Gtfs, date: NaiveDate) -> HashSet<String> {
    let mut active = HashSet::new();

    for (service_id, calendar) in &gtfs.calendar {
        if date >= calendar.start_date && date <= calendar.end_date {
            let runs = match date.weekday() {
                Weekday::Mon => calendar.monday,
                Weekday::Tue => calendar.tuesday,
                Weekday::Wed => calendar.wednesday,
                Weekday::Thu => calendar.thursday,
                Weekday::Fri => calendar.friday,
                Weekday::Sat => calendar.saturday,
                Weekday::Sun => calendar.sunday,
            };
            if runs {
                active.insert(service_id.clone());
            }
        }
    }

    for (service_id, exceptions) in &gtfs.calendar_dates {
        for exception in exceptions {
            if exception.date != date {
                continue;
            }
            match exception.exception_type {
                Exception::Added => {
                    active.insert(service_id.clone());
                }
                Exception::Deleted => {
                    active.remove(service_id);
                }
            }
        }
    }

    active
}

#[derive(Clone, Debug)]
pub struct ArchiveRegistryRow {
    pub feed_start_date: NaiveDate,
    pub feed_end_date: NaiveDate,
    pub archive_url: String,
}

/// Downloads the raw archive registry body (§4.B), without parsing it, so
/// the caller can cache the body verbatim before attempting to parse it.
pub fn download_registry_text(url: &str) -> Result<String, ScheduleError> {
    Ok(reqwest::blocking::get(url)?.text()?)
}

/// Path of the locally cached registry body under `cache_root`, matching
/// §6's `data/gtfs_archives/archived_feeds.txt` layout.
fn registry_cache_path(cache_root: &Path, filename: &str) -> PathBuf {
    cache_root.join("gtfs_archives").join(filename)
}

/// Persists a freshly-fetched registry body so a later fetch failure can
/// still recover a recent listing.
pub fn write_cached_registry(cache_root: &Path, filename: &str, body: &str) -> Result<(), ScheduleError> {
    let path = registry_cache_path(cache_root, filename);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ScheduleError::Io { path: parent.to_path_buf(), source: e })?;
    }
    std::fs::write(&path, body).map_err(|e| ScheduleError::Io { path, source: e })
}

/// Reads back a registry body written by [`write_cached_registry`], the
/// fallback used before giving up to [`newest_cached_archive`].
pub fn read_cached_registry(cache_root: &Path, filename: &str) -> Result<Vec<ArchiveRegistryRow>, ScheduleError> {
    let path = registry_cache_path(cache_root, filename);
    let body = std::fs::read_to_string(&path).map_err(|e| ScheduleError::Io { path, source: e })?;
    parse_registry(&body)
}

pub(crate) fn parse_registry(body: &str) -> Result<Vec<ArchiveRegistryRow>, ScheduleError> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let feed_start_date = parse_dateint(&record[0])
            .ok_or_else(|| ScheduleError::Gtfs(format!("bad feed_start_date: {}", &record[0])))?;
        let feed_end_date = parse_dateint(&record[1])
            .ok_or_else(|| ScheduleError::Gtfs(format!("bad feed_end_date: {}", &record[1])))?;
        rows.push(ArchiveRegistryRow {
            feed_start_date,
            feed_end_date,
            archive_url: record[2].to_string(),
        });
    }
    Ok(rows)
}

fn parse_dateint(s: &str) -> Option<NaiveDate> {
    let n: u32 = s.trim().parse().ok()?;
    let year = (n / 10_000) as i32;
    let month = (n / 100) % 100;
    let day = n % 100;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Selects the first registry row covering `dateint`.
pub fn select_archive_for_date(rows: &[ArchiveRegistryRow], date: NaiveDate) -> Option<&ArchiveRegistryRow> {
    rows.iter().find(|r| r.feed_start_date <= date && date <= r.feed_end_date)
}

/// Returns the local extraction directory for an archive URL, downloading
/// and unpacking it if not already cached.
pub fn ensure_extracted(cache_root: &Path, archive_url: &str) -> Result<PathBuf, ScheduleError> {
    let archive_name = archive_name_from_url(archive_url);
    let dest = cache_root.join("gtfs_archives").join(&archive_name);
    if dest.is_dir() {
        return Ok(dest);
    }

    info!(url = archive_url, "downloading GTFS archive");
    let bytes = reqwest::blocking::get(archive_url)?.bytes()?;
    let cursor = std::io::Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(cursor).map_err(|e| ScheduleError::Gtfs(e.to_string()))?;

    std::fs::create_dir_all(&dest).map_err(|e| ScheduleError::Io {
        path: dest.clone(),
        source: e,
    })?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| ScheduleError::Gtfs(e.to_string()))?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(name);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| ScheduleError::Io { path: out_path.clone(), source: e })?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScheduleError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|e| ScheduleError::Io { path: out_path.clone(), source: e })?;
        std::fs::write(&out_path, contents).map_err(|e| ScheduleError::Io { path: out_path.clone(), source: e })?;
    }

    Ok(dest)
}

fn archive_name_from_url(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).trim_end_matches(".zip").to_string()
}

/// Fallback: scan the local cache and use the lexically-newest archive
/// directory (dateint-named directories sort correctly as strings).
pub fn newest_cached_archive(cache_root: &Path) -> Option<PathBuf> {
    let archives_dir = cache_root.join("gtfs_archives");
    let mut names: Vec<_> = std::fs::read_dir(&archives_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    let newest = names.pop()?;
    let path = archives_dir.join(newest);
    warn!(path = %path.display(), "falling back to newest cached GTFS archive");
    Some(path)
}

pub fn should_refresh_registry(matched: &ArchiveRegistryRow, refresh_interval_days: i64, today: NaiveDate) -> bool {
    (today - matched.feed_start_date).num_days() > refresh_interval_days
}
