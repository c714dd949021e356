//! Event detection (§4.G): decides ARR/DEP from (previous state, current
//! update) and advances the stored state unconditionally.

use tracing::error;

use crate::error::IngestError;
use crate::model::{EventType, VehicleStatus, VehicleUpdate};
use crate::tripstate::TripState;

/// Outcome of evaluating one update against its previous trip state.
pub struct Detection {
    /// `Some` iff an event should be emitted downstream (before the stop
    /// filter and enrichment gates run).
    pub emit: Option<EmittedEvent>,
    /// The state to store for this trip, regardless of whether an event
    /// fired.
    pub next_state: TripState,
}

pub struct EmittedEvent {
    pub event_type: EventType,
    pub stop_id: String,
    pub stop_sequence: u32,
}

/// Synthesises the "previous" snapshot for a trip's first observation: it
/// equals the current update, so neither `is_departure` nor `is_arrival`
/// can be true (boundary condition: first observation never emits).
pub fn first_observation_state(update: &VehicleUpdate) -> Option<TripState> {
    let stop_id = update.stop_id.clone()?;
    Some(TripState {
        stop_sequence: update.current_stop_sequence,
        stop_id,
        updated_at: update.updated_at,
        event_type: update.event_hint(),
        vehicle_consist: update.vehicle_consist.clone(),
        occupancy_status: update.occupancy_status,
        occupancy_percentage: update.occupancy_percentage,
    })
}

/// Evaluates one update against the stored previous state. Returns `None`
/// if `update.stop_id` is absent (early return, no state change, no event,
/// per §4.G) or if the update's timestamp exactly matches the stored one
/// (duplicate suppression, resolved open question in SPEC_FULL.md §9).
pub fn detect(prev: &TripState, update: &VehicleUpdate) -> Option<Detection> {
    let stop_id = update.stop_id.clone()?;

    if update.updated_at == prev.updated_at {
        return None;
    }

    let is_departure = prev.stop_id != stop_id && prev.stop_sequence < update.current_stop_sequence;
    let is_arrival =
        update.current_status == VehicleStatus::StoppedAt && prev.event_type == EventType::Dep;

    // Composite-step convention (SPEC_FULL.md §9, open question #1): when
    // both fire in the same step, emit a single DEP-attributed row for the
    // stop being left, not the one being approached.
    let emit = if is_departure {
        Some(EmittedEvent {
            event_type: EventType::Dep,
            stop_id: prev.stop_id.clone(),
            stop_sequence: prev.stop_sequence,
        })
    } else if is_arrival {
        Some(EmittedEvent {
            event_type: EventType::Arr,
            stop_id: stop_id.clone(),
            stop_sequence: update.current_stop_sequence,
        })
    } else {
        None
    };

    let advanced_event_type = if is_departure {
        EventType::Dep
    } else if is_arrival {
        EventType::Arr
    } else {
        update.event_hint()
    };

    let next_state = TripState {
        stop_sequence: update.current_stop_sequence,
        stop_id,
        updated_at: update.updated_at,
        event_type: advanced_event_type,
        vehicle_consist: update.vehicle_consist.clone(),
        occupancy_status: update.occupancy_status,
        occupancy_percentage: update.occupancy_percentage,
    };

    // The emitted stop attribution is an invariant of this function's own
    // logic, not something the upstream feed can violate on its own — but a
    // malformed feed can still hand us an empty (non-`None`) stop_id, which
    // would otherwise silently flow into a written row with a blank
    // attribution. Catch that here rather than downstream at the writer.
    let emit = match emit {
        Some(e) => match check_emitted_event(&e) {
            Ok(()) => Some(e),
            Err(err) => {
                error!(error = %err, trip_id = %update.trip_id, "dropping event with invalid attribution");
                None
            }
        },
        None => None,
    };

    Some(Detection { emit, next_state })
}

/// Validates the one thing this module guarantees about its own output: an
/// emitted event always attributes to a real, non-empty stop id.
fn check_emitted_event(emit: &EmittedEvent) -> Result<(), IngestError> {
    if emit.stop_id.trim().is_empty() {
        return Err(IngestError::Invariant(format!(
            "emitted {:?} event has an empty stop_id",
            emit.event_type
        )));
    }
    Ok(())
}
