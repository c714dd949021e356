//! Canonical interior and egress records shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleStatus {
    IncomingAt,
    StoppedAt,
    InTransitTo,
}

impl VehicleStatus {
    /// Maps raw GTFS-RT status integers: 0=INCOMING_AT, 1=STOPPED_AT, 2=IN_TRANSIT_TO.
    pub fn from_gtfs_rt(code: i32) -> Option<Self> {
        match code {
            0 => Some(VehicleStatus::IncomingAt),
            1 => Some(VehicleStatus::StoppedAt),
            2 => Some(VehicleStatus::InTransitTo),
            _ => None,
        }
    }

    pub fn event_hint(self) -> EventType {
        match self {
            VehicleStatus::InTransitTo => EventType::Dep,
            VehicleStatus::StoppedAt => EventType::Arr,
            VehicleStatus::IncomingAt => EventType::Arr,
        }
    }

    /// Parses the JSON:API string form used by the SSE feed's `attributes.current_status`.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "INCOMING_AT" => Some(VehicleStatus::IncomingAt),
            "STOPPED_AT" => Some(VehicleStatus::StoppedAt),
            "IN_TRANSIT_TO" => Some(VehicleStatus::InTransitTo),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Arr,
    Dep,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Arr => "ARR",
            EventType::Dep => "DEP",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyStatus {
    Empty,
    ManySeatsAvailable,
    FewSeatsAvailable,
    StandingRoomOnly,
    CrushedStandingRoomOnly,
    Full,
    NotAcceptingPassengers,
    NoDataAvailable,
    NotBoardable,
}

impl OccupancyStatus {
    pub fn from_gtfs_rt(code: i32) -> Option<Self> {
        match code {
            0 => Some(OccupancyStatus::Empty),
            1 => Some(OccupancyStatus::ManySeatsAvailable),
            2 => Some(OccupancyStatus::FewSeatsAvailable),
            3 => Some(OccupancyStatus::StandingRoomOnly),
            4 => Some(OccupancyStatus::CrushedStandingRoomOnly),
            5 => Some(OccupancyStatus::Full),
            6 => Some(OccupancyStatus::NotAcceptingPassengers),
            7 => Some(OccupancyStatus::NoDataAvailable),
            8 => Some(OccupancyStatus::NotBoardable),
            _ => None,
        }
    }

    /// Parses the GTFS-RT spec string form used by the SSE feed's
    /// `attributes.occupancy_status`.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "EMPTY" => Some(OccupancyStatus::Empty),
            "MANY_SEATS_AVAILABLE" => Some(OccupancyStatus::ManySeatsAvailable),
            "FEW_SEATS_AVAILABLE" => Some(OccupancyStatus::FewSeatsAvailable),
            "STANDING_ROOM_ONLY" => Some(OccupancyStatus::StandingRoomOnly),
            "CRUSHED_STANDING_ROOM_ONLY" => Some(OccupancyStatus::CrushedStandingRoomOnly),
            "FULL" => Some(OccupancyStatus::Full),
            "NOT_ACCEPTING_PASSENGERS" => Some(OccupancyStatus::NotAcceptingPassengers),
            "NO_DATA_AVAILABLE" => Some(OccupancyStatus::NoDataAvailable),
            "NOT_BOARDABLE" => Some(OccupancyStatus::NotBoardable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccupancyStatus::Empty => "EMPTY",
            OccupancyStatus::ManySeatsAvailable => "MANY_SEATS_AVAILABLE",
            OccupancyStatus::FewSeatsAvailable => "FEW_SEATS_AVAILABLE",
            OccupancyStatus::StandingRoomOnly => "STANDING_ROOM_ONLY",
            OccupancyStatus::CrushedStandingRoomOnly => "CRUSHED_STANDING_ROOM_ONLY",
            OccupancyStatus::Full => "FULL",
            OccupancyStatus::NotAcceptingPassengers => "NOT_ACCEPTING_PASSENGERS",
            OccupancyStatus::NoDataAvailable => "NO_DATA_AVAILABLE",
            OccupancyStatus::NotBoardable => "NOT_BOARDABLE",
        }
    }
}

/// One carriage's worth of consist/occupancy data. Pipe-joined only at the
/// write boundary (§9 design note); everything upstream carries this as a
/// `Vec`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Carriage {
    pub label: Option<String>,
    pub occupancy_status: Option<OccupancyStatus>,
    pub occupancy_percentage: Option<u32>,
}

/// Canonical interior record consumed by the core, regardless of source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleUpdate {
    pub route_id: String,
    pub trip_id: String,
    pub direction_id: u8,
    pub vehicle_label: Option<String>,
    pub vehicle_id: Option<String>,
    pub current_status: VehicleStatus,
    pub current_stop_sequence: u32,
    pub stop_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub vehicle_consist: Vec<Carriage>,
    pub occupancy_status: Option<OccupancyStatus>,
    pub occupancy_percentage: Option<u32>,
}

impl VehicleUpdate {
    pub fn event_hint(&self) -> EventType {
        self.current_status.event_hint()
    }

    /// Pipe-joined carriage label, falling back to the top-level vehicle
    /// label when no carriages were reported (boundary condition: empty
    /// `carriages` array maps `vehicle_consist = vehicle_label`).
    pub fn consist_string(&self) -> String {
        if self.vehicle_consist.is_empty() {
            self.vehicle_label.clone().unwrap_or_default()
        } else {
            self.vehicle_consist
                .iter()
                .map(|c| c.label.clone().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|")
        }
    }

    pub fn occupancy_status_string(&self) -> String {
        if self.vehicle_consist.is_empty() {
            self.occupancy_status.map(|o| o.as_str().to_string()).unwrap_or_default()
        } else {
            self.vehicle_consist
                .iter()
                .map(|c| c.occupancy_status.map(|o| o.as_str().to_string()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|")
        }
    }

    pub fn occupancy_percentage_string(&self) -> String {
        if self.vehicle_consist.is_empty() {
            self.occupancy_percentage.map(|p| p.to_string()).unwrap_or_default()
        } else {
            self.vehicle_consist
                .iter()
                .map(|c| c.occupancy_percentage.map(|p| p.to_string()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|")
        }
    }
}

/// Egress event row, persisted by the writer. Written out manually (not via
/// `csv`'s derive) since `event_time` carries an agency-specific zone.
#[derive(Clone, Debug)]
pub struct Event {
    pub service_date: chrono::NaiveDate,
    pub route_id: String,
    pub trip_id: String,
    pub direction_id: u8,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub vehicle_id: String,
    pub vehicle_label: Option<String>,
    pub event_type: EventType,
    pub event_time: DateTime<chrono_tz::Tz>,
    pub scheduled_headway: Option<i64>,
    pub scheduled_tt: Option<i64>,
    pub vehicle_consist: String,
    pub occupancy_status: String,
    pub occupancy_percentage: String,
}
