//! Orchestrator (§4.I): spawns one worker per mode/route-chunk, each
//! funneling its feed source's updates through detect → filter → enrich →
//! write, and coordinates shutdown.
//!
//! Grounded on the teacher's single `tokio::spawn` per concern (STOMP loop,
//! persistence loop, HTTP server) in `main.rs`, generalized to N worker
//! tasks instead of three fixed ones.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{AgencyCatalog, Mode};
use crate::detect;
use crate::feed::FeedSource;
use crate::model::{Event, VehicleUpdate};
use crate::schedule::enrich;
use crate::schedule::watcher::CurrentArchive;
use crate::time::CurrentServiceDate;
use crate::tripstate::TripsStateManager;
use crate::writer::PartitionedWriter;

const BUS_CHUNK_SIZE: usize = 10;

/// The set of route ids one worker owns, fed by one `FeedSource` connection.
pub struct WorkerAssignment {
    pub mode: Mode,
    pub routes: HashSet<String>,
}

/// Splits the catalog's routes for each enabled mode into worker
/// assignments per §4.I step 4: rapid and cr are single workers; bus is
/// chunked by `BUS_CHUNK_SIZE` (the upstream SSE filter-length limit).
pub fn plan_assignments(catalog: &AgencyCatalog, modes: &[Mode]) -> Vec<WorkerAssignment> {
    let mut assignments = Vec::new();
    for &mode in modes {
        let routes = catalog.routes_for_mode(mode);
        if routes.is_empty() {
            continue;
        }
        match mode {
            Mode::Rapid | Mode::Cr => assignments.push(WorkerAssignment {
                mode,
                routes: routes.clone(),
            }),
            Mode::Bus => {
                let mut sorted: Vec<&String> = routes.iter().collect();
                sorted.sort();
                for chunk in sorted.chunks(BUS_CHUNK_SIZE) {
                    assignments.push(WorkerAssignment {
                        mode,
                        routes: chunk.iter().map(|s| (*s).clone()).collect(),
                    });
                }
            }
        }
    }
    assignments
}

pub struct Worker {
    pub mode: Mode,
    feed: Box<dyn FeedSource>,
    catalog: Arc<AgencyCatalog>,
    archive: CurrentArchive,
    writer: Arc<PartitionedWriter>,
    trips: TripsStateManager,
    current_service_date: Arc<CurrentServiceDate>,
    tz: chrono_tz::Tz,
}

impl Worker {
    pub fn new(
        mode: Mode,
        feed: Box<dyn FeedSource>,
        catalog: Arc<AgencyCatalog>,
        archive: CurrentArchive,
        writer: Arc<PartitionedWriter>,
        data_root: PathBuf,
        current_service_date: Arc<CurrentServiceDate>,
        tz: chrono_tz::Tz,
    ) -> Self {
        Self {
            mode,
            feed,
            catalog,
            archive,
            writer,
            trips: TripsStateManager::new(data_root),
            current_service_date,
            tz,
        }
    }

    /// Runs until `cancel` fires, processing one update per iteration.
    /// Each in-flight update is allowed to finish (detect → write → persist)
    /// before the loop checks cancellation again, per §4.I's shutdown
    /// contract.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(mode = %self.mode, "worker shutting down");
                    return;
                }
                update = self.feed.next_update() => update,
            };

            let Some(update) = update else {
                continue;
            };

            if let Err(e) = self.process(update) {
                error!(mode = %self.mode, error = %e, "failed to process update; dropping it");
            }
        }
    }

    fn process(&mut self, update: VehicleUpdate) -> anyhow::Result<()> {
        let service_date = self.current_service_date.get();
        let route_state = self.trips.route_state(&update.route_id, service_date);
        let now = Utc::now();

        let prev = route_state.trips.get(&update.trip_id).cloned();

        match prev {
            Some(prev) => {
                let Some(detection) = detect::detect(&prev, &update) else {
                    return Ok(());
                };

                route_state.set_trip_state(now, service_date, &update.trip_id, detection.next_state)?;

                if let Some(emit) = detection.emit {
                    if !self.catalog.should_emit(&update.route_id, &emit.stop_id) {
                        return Ok(());
                    }
                    let mut event = build_event(&update, &emit, service_date, self.tz);
                    let archive = self.archive.get();
                    enrich::enrich(&mut event, &archive);
                    self.writer.write_event(self.mode, &event)?;
                }
            }
            None => {
                if let Some(state) = detect::first_observation_state(&update) {
                    route_state.set_trip_state(now, service_date, &update.trip_id, state)?;
                } else {
                    warn!(trip_id = %update.trip_id, "first observation missing stop_id; dropped");
                }
            }
        }

        Ok(())
    }
}

fn build_event(
    update: &VehicleUpdate,
    emit: &detect::EmittedEvent,
    service_date: chrono::NaiveDate,
    tz: chrono_tz::Tz,
) -> Event {
    use chrono::TimeZone as _;
    Event {
        service_date,
        route_id: update.route_id.clone(),
        trip_id: update.trip_id.clone(),
        direction_id: update.direction_id,
        stop_id: emit.stop_id.clone(),
        stop_sequence: emit.stop_sequence,
        vehicle_id: update.vehicle_id.clone().unwrap_or_else(|| "0".to_string()),
        vehicle_label: update.vehicle_label.clone(),
        event_type: emit.event_type,
        event_time: tz.from_utc_datetime(&update.updated_at.naive_utc()),
        scheduled_headway: None,
        scheduled_tt: None,
        vehicle_consist: update.consist_string(),
        occupancy_status: update.occupancy_status_string(),
        occupancy_percentage: update.occupancy_percentage_string(),
    }
}

/// Spawns every planned worker, returning their join handles alongside the
/// shared cancellation token the caller signals on shutdown.
pub fn spawn_workers(mut workers: Vec<Worker>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    workers
        .drain(..)
        .map(|mut worker| {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::model::{Carriage, OccupancyStatus, VehicleStatus, VehicleUpdate};
    use crate::schedule::archive::ScheduleArchive;
    use async_trait::async_trait;
    use chrono::{TimeZone as _, Utc};

    /// A feed that never produces an update; the pipeline tests below drive
    /// `process` directly, so the worker's own polling loop never runs.
    struct NoopFeedSource;

    #[async_trait]
    impl FeedSource for NoopFeedSource {
        async fn next_update(&mut self) -> Option<VehicleUpdate> {
            None
        }
    }

    fn bus_catalog_with_stop_allowlist() -> AgencyCatalog {
        let mut bus_stops = HashMap::new();
        bus_stops.insert("1".to_string(), HashSet::from(["10".to_string(), "11".to_string()]));
        AgencyCatalog::new(
            HashSet::from(["1".to_string()]),
            HashSet::new(),
            HashSet::new(),
            bus_stops,
        )
    }

    fn test_worker(catalog: AgencyCatalog, data_root: PathBuf) -> Worker {
        let archive = crate::schedule::watcher::CurrentArchive::new(ScheduleArchive::from_records(
            Utc::now().date_naive(),
            Vec::new(),
            Vec::new(),
        ));
        Worker::new(
            Mode::Bus,
            Box::new(NoopFeedSource),
            Arc::new(catalog),
            archive,
            Arc::new(PartitionedWriter::new(data_root.clone())),
            data_root,
            Arc::new(CurrentServiceDate::new(chrono_tz::America::New_York)),
            chrono_tz::America::New_York,
        )
    }

    fn vehicle_update(trip_id: &str, stop_id: &str, seq: u32, status: VehicleStatus, secs_from_now: i64) -> VehicleUpdate {
        VehicleUpdate {
            route_id: "1".to_string(),
            trip_id: trip_id.to_string(),
            direction_id: 0,
            vehicle_label: Some("y1800".to_string()),
            vehicle_id: Some("y1800".to_string()),
            current_status: status,
            current_stop_sequence: seq,
            stop_id: Some(stop_id.to_string()),
            updated_at: Utc::now() + chrono::Duration::seconds(secs_from_now),
            vehicle_consist: Vec::<Carriage>::new(),
            occupancy_status: Some(OccupancyStatus::ManySeatsAvailable),
            occupancy_percentage: Some(40),
        }
    }

    /// End-to-end scenario 4: a bus route's stop filter rejects a stop not
    /// on its allow-list, so the detected departure never reaches the CSV.
    #[test]
    fn bus_stop_filter_rejects_unlisted_stop_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(bus_catalog_with_stop_allowlist(), dir.path().to_path_buf());

        // First observation establishes the trip at the allow-listed stop 10.
        worker.process(vehicle_update("trip_1", "10", 1, VehicleStatus::StoppedAt, -60)).unwrap();
        // Departs to stop 99, which is not in BUS_STOPS["1"]: the DEP event
        // for leaving stop 10 is detected but must be suppressed before write.
        worker.process(vehicle_update("trip_1", "99", 2, VehicleStatus::InTransitTo, 0)).unwrap();

        let shard = crate::writer::shard_path_for(
            dir.path(),
            Mode::Bus,
            &crate::model::Event {
                service_date: worker.current_service_date.get(),
                route_id: "1".to_string(),
                trip_id: "trip_1".to_string(),
                direction_id: 0,
                stop_id: "10".to_string(),
                stop_sequence: 1,
                vehicle_id: "y1800".to_string(),
                vehicle_label: None,
                event_type: crate::model::EventType::Dep,
                event_time: chrono_tz::America::New_York.from_utc_datetime(&Utc::now().naive_utc()),
                scheduled_headway: None,
                scheduled_tt: None,
                vehicle_consist: String::new(),
                occupancy_status: String::new(),
                occupancy_percentage: String::new(),
            },
        );
        assert!(!shard.exists(), "no shard should be written for a filtered-out stop");
    }

    /// End-to-end scenario: an allow-listed stop's departure does reach the
    /// CSV with the expected consist/occupancy string encoding.
    #[test]
    fn allowlisted_bus_stop_writes_a_row_with_consist_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(bus_catalog_with_stop_allowlist(), dir.path().to_path_buf());

        worker.process(vehicle_update("trip_2", "11", 1, VehicleStatus::StoppedAt, -60)).unwrap();
        worker.process(vehicle_update("trip_2", "10", 2, VehicleStatus::InTransitTo, 0)).unwrap();

        let service_date = worker.current_service_date.get();
        let sample_event = crate::model::Event {
            service_date,
            route_id: "1".to_string(),
            trip_id: "trip_2".to_string(),
            direction_id: 0,
            stop_id: "11".to_string(),
            stop_sequence: 1,
            vehicle_id: "y1800".to_string(),
            vehicle_label: None,
            event_type: crate::model::EventType::Dep,
            event_time: chrono_tz::America::New_York.from_utc_datetime(&Utc::now().naive_utc()),
            scheduled_headway: None,
            scheduled_tt: None,
            vehicle_consist: String::new(),
            occupancy_status: String::new(),
            occupancy_percentage: String::new(),
        };
        let shard = crate::writer::shard_path_for(dir.path(), Mode::Bus, &sample_event);

        let contents = std::fs::read_to_string(shard).unwrap();
        assert!(contents.contains("trip_2"));
        assert!(contents.contains("DEP"));
        assert!(contents.contains("MANY_SEATS_AVAILABLE"));
    }

    fn fixture_catalog() -> AgencyCatalog {
        let bus_routes: HashSet<String> = (1..=25).map(|n| n.to_string()).collect();
        AgencyCatalog::new(
            bus_routes,
            HashSet::from(["CR-Worcester".to_string()]),
            HashSet::from(["Red".to_string()]),
            HashMap::new(),
        )
    }

    #[test]
    fn rapid_and_cr_are_single_workers() {
        let catalog = fixture_catalog();
        let assignments = plan_assignments(&catalog, &[Mode::Rapid, Mode::Cr]);
        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.routes.len() == 1));
    }

    #[test]
    fn bus_routes_are_chunked_by_ten() {
        let catalog = fixture_catalog();
        let assignments = plan_assignments(&catalog, &[Mode::Bus]);
        // 25 routes -> chunks of 10, 10, 5
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments[0].routes.len(), 10);
        assert_eq!(assignments[2].routes.len(), 5);
    }

    #[test]
    fn mode_with_no_routes_is_skipped() {
        let catalog = AgencyCatalog::new(HashSet::new(), HashSet::new(), HashSet::new(), HashMap::new());
        let assignments = plan_assignments(&catalog, &[Mode::Rapid, Mode::Cr, Mode::Bus]);
        assert!(assignments.is_empty());
    }
}
