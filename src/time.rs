//! Deterministic time/path utilities (§4.A). Pure functions operate purely
//! on their inputs; the only stateful piece is [`CurrentServiceDate`], which
//! caches the current service date per wall-clock hour.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike};

use crate::catalog::Mode;

/// The service day rolls over at 03:00 local time.
const ROLLOVER_HOUR: u32 = 3;

/// Maps a zoned wall-clock instant to its MBTA-style service date: hours
/// before 03:00 belong to the previous calendar day.
pub fn service_date<Tz: TimeZone>(t: DateTime<Tz>) -> NaiveDate {
    if t.hour() >= ROLLOVER_HOUR {
        t.date_naive()
    } else {
        (t - chrono::Duration::hours(24)).date_naive()
    }
}

pub fn to_dateint(d: NaiveDate) -> u32 {
    d.year() as u32 * 10_000 + d.month() * 100 + d.day()
}

/// Builds the mode-prefixed, day-partitioned relative output directory for
/// one shard.
pub fn output_dir_path(
    mode: Mode,
    route_id: &str,
    direction_id: u8,
    stop_id: &str,
    date: NaiveDate,
) -> PathBuf {
    let leaf = match mode {
        Mode::Cr => format!("daily-cr-data/{route_id}_{direction_id}_{stop_id}"),
        Mode::Rapid => format!("daily-rapid-data/{stop_id}"),
        Mode::Bus => format!("daily-bus-data/{route_id}-{direction_id}-{stop_id}"),
    };
    PathBuf::from(leaf)
        .join(format!("Year={}", date.year()))
        .join(format!("Month={}", date.month()))
        .join(format!("Day={}", date.day()))
}

/// Caches `get_current_service_date()` for the current wall hour so callers
/// on a hot path don't repeatedly perform a timezone conversion.
pub struct CurrentServiceDate {
    tz: chrono_tz::Tz,
    cached: Mutex<Option<(u32, NaiveDate)>>,
}

impl CurrentServiceDate {
    pub fn new(tz: chrono_tz::Tz) -> Self {
        Self {
            tz,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> NaiveDate {
        let now = chrono::Utc::now().with_timezone(&self.tz);
        let wall_hour = now.hour();
        let mut cached = self.cached.lock().unwrap();
        if let Some((h, d)) = *cached {
            if h == wall_hour {
                return d;
            }
        }
        let d = service_date(now);
        *cached = Some((wall_hour, d));
        d
    }
}
