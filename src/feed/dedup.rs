//! De-dup filter (§4.E), composed only into the GTFS-RT source: between
//! polls, suppress updates whose meaningful fields are unchanged from the
//! last emitted update for that trip.

use std::collections::{HashMap, HashSet};

use crate::model::{Carriage, OccupancyStatus, VehicleUpdate};

#[derive(Clone, PartialEq)]
struct CachedFields {
    stop_id: Option<String>,
    current_status: crate::model::VehicleStatus,
    current_stop_sequence: u32,
    occupancy_status: Option<OccupancyStatus>,
    carriages: Vec<Carriage>,
}

impl From<&VehicleUpdate> for CachedFields {
    fn from(u: &VehicleUpdate) -> Self {
        Self {
            stop_id: u.stop_id.clone(),
            current_status: u.current_status,
            current_stop_sequence: u.current_stop_sequence,
            occupancy_status: u.occupancy_status,
            carriages: u.vehicle_consist.clone(),
        }
    }
}

#[derive(Default)]
pub struct DedupFilter {
    cache: HashMap<String, CachedFields>,
}

impl DedupFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` (and records the update as the new baseline) iff any
    /// tracked field differs from the cached entry for this trip, in the
    /// fixed comparison order from §4.E.
    pub fn should_emit(&mut self, update: &VehicleUpdate) -> bool {
        let fields = CachedFields::from(update);
        let changed = match self.cache.get(&update.trip_id) {
            Some(cached) => cached != &fields,
            None => true,
        };
        if changed {
            self.cache.insert(update.trip_id.clone(), fields);
        }
        changed
    }

    /// Drops cached entries for trips absent from the current poll cycle.
    pub fn evict_disappeared(&mut self, seen_trip_ids: &HashSet<String>) {
        self.cache.retain(|trip_id, _| seen_trip_ids.contains(trip_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VehicleStatus;
    use chrono::Utc;

    fn update(trip_id: &str, stop_id: &str, seq: u32) -> VehicleUpdate {
        VehicleUpdate {
            route_id: "Red".to_string(),
            trip_id: trip_id.to_string(),
            direction_id: 0,
            vehicle_label: None,
            vehicle_id: None,
            current_status: VehicleStatus::InTransitTo,
            current_stop_sequence: seq,
            stop_id: Some(stop_id.to_string()),
            updated_at: Utc::now(),
            vehicle_consist: vec![],
            occupancy_status: None,
            occupancy_percentage: None,
        }
    }

    #[test]
    fn first_sighting_always_emits() {
        let mut filter = DedupFilter::new();
        assert!(filter.should_emit(&update("t1", "70001", 1)));
    }

    #[test]
    fn unchanged_update_is_suppressed() {
        let mut filter = DedupFilter::new();
        let u = update("t1", "70001", 1);
        assert!(filter.should_emit(&u));
        assert!(!filter.should_emit(&u));
    }

    #[test]
    fn changed_stop_sequence_emits_again() {
        let mut filter = DedupFilter::new();
        filter.should_emit(&update("t1", "70001", 1));
        assert!(filter.should_emit(&update("t1", "70001", 2)));
    }

    #[test]
    fn eviction_forgets_disappeared_trips() {
        let mut filter = DedupFilter::new();
        let u = update("t1", "70001", 1);
        filter.should_emit(&u);

        filter.evict_disappeared(&HashSet::new());

        // trip dropped from cache, so the identical update is treated as new again.
        assert!(filter.should_emit(&u));
    }
}
