//! Enrichment engine (§4.C): joins a live event to the schedule archive to
//! compute `scheduled_headway` and `scheduled_tt`.
//!
//! The "as-of" joins are modeled as binary searches over the sorted
//! per-(route,direction,stop) arrays built lazily by [`ScheduleArchive`]
//! (§9), rather than a dataframe library's as-of join.

use std::collections::HashMap;

use chrono::{Datelike, TimeZone};

use crate::model::Event;
use crate::schedule::archive::{RouteStopSchedule, ScheduleArchive};

fn arrival_time_offset(event: &Event) -> i64 {
    let tz = event.event_time.timezone();
    let midnight = tz
        .with_ymd_and_hms(
            event.service_date.year(),
            event.service_date.month(),
            event.service_date.day(),
            0,
            0,
            0,
        )
        .unwrap();
    (event.event_time - midnight).num_seconds()
}

/// Backward as-of: strictly-or-equal predecessor. Ties among entries with
/// identical timestamps are broken by their position in the sorted array
/// (stable, so deterministic for a given input ordering).
fn backward_index(entries: &[crate::schedule::archive::ScheduleEntry], t: i64) -> Option<usize> {
    let upper = entries.partition_point(|e| e.arrival_time_offset <= t);
    if upper == 0 {
        None
    } else {
        Some(upper - 1)
    }
}

/// Nearest as-of: the closer of the predecessor and successor, with ties
/// broken toward the earlier (predecessor) entry.
fn nearest_index(entries: &[crate::schedule::archive::ScheduleEntry], t: i64) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let upper = entries.partition_point(|e| e.arrival_time_offset <= t);
    let before = if upper == 0 { None } else { Some(upper - 1) };
    let after = if upper < entries.len() { Some(upper) } else { None };

    match (before, after) {
        (Some(b), Some(a)) => {
            let before_diff = (t - entries[b].arrival_time_offset).abs();
            let after_diff = (entries[a].arrival_time_offset - t).abs();
            if after_diff < before_diff {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Enriches a single live event in place (the streaming case: at ingest
/// time only one event for a trip is ever available, so it is its own
/// batch-of-one trip-start event per spec.md §4.C's note that single-event
/// and batch behaviour are identical per group).
pub fn enrich(event: &mut Event, archive: &ScheduleArchive) {
    let schedule = archive.route_stop_schedule(&event.route_id, event.direction_id, &event.stop_id);
    let t = arrival_time_offset(event);

    if let Some(idx) = backward_index(&schedule.entries, t) {
        event.scheduled_headway = schedule.entries[idx].scheduled_headway;
    }

    if let Some(idx) = nearest_index(&schedule.entries, t) {
        event.scheduled_tt = Some(schedule.entries[idx].scheduled_tt);
    }
}

/// Batch generalization (§4.C): groups events by `trip_id`, determines each
/// real trip's scheduled counterpart from its earliest event, then applies
/// that scheduled trip's per-stop travel time to every event of the trip.
/// Headway is still computed per event independently.
pub fn enrich_batch(events: &mut [Event], archive: &ScheduleArchive) {
    let mut by_trip: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, event) in events.iter().enumerate() {
        by_trip.entry(event.trip_id.clone()).or_default().push(i);
    }

    for (_trip_id, indices) in &by_trip {
        let start_idx = *indices
            .iter()
            .min_by_key(|&&i| events[i].event_time)
            .expect("group is non-empty");

        let (route_id, direction_id, stop_id, t) = {
            let start = &events[start_idx];
            (start.route_id.clone(), start.direction_id, start.stop_id.clone(), arrival_time_offset(start))
        };

        let schedule: std::sync::Arc<RouteStopSchedule> =
            archive.route_stop_schedule(&route_id, direction_id, &stop_id);
        let Some(nearest_idx) = nearest_index(&schedule.entries, t) else {
            continue;
        };
        let scheduled_trip_id = schedule.entries[nearest_idx].trip_id.clone();

        for &i in indices {
            let event = &mut events[i];
            event.scheduled_tt =
                archive.scheduled_tt_for_trip_stop(&event.route_id, event.direction_id, &scheduled_trip_id, &event.stop_id);
        }
    }

    for event in events.iter_mut() {
        let schedule = archive.route_stop_schedule(&event.route_id, event.direction_id, &event.stop_id);
        let t = arrival_time_offset(event);
        if let Some(idx) = backward_index(&schedule.entries, t) {
            event.scheduled_headway = schedule.entries[idx].scheduled_headway;
        }
    }
}
