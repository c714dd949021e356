//! Agency route catalog, mode classifier, and bus-stop allow-list (§3, §4.J).
//!
//! Loaded once at process start from a per-agency constant module and held
//! immutably thereafter (no lock needed — every field is read-only after
//! [`AgencyCatalog::new`] returns).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Rapid,
    Cr,
    Bus,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Rapid => "rapid",
            Mode::Cr => "cr",
            Mode::Bus => "bus",
        };
        f.write_str(s)
    }
}

pub struct AgencyCatalog {
    routes_bus: HashSet<String>,
    routes_cr: HashSet<String>,
    routes_rapid: HashSet<String>,
    bus_stops: HashMap<String, HashSet<String>>,
    tz: chrono_tz::Tz,
}

impl AgencyCatalog {
    /// Builds a catalog from disjoint route sets, panicking (at startup
    /// only, never at runtime) if the disjointness invariant from §3 is
    /// violated — such a catalog is a config-time error, not a recoverable
    /// one.
    pub fn new(
        routes_bus: HashSet<String>,
        routes_cr: HashSet<String>,
        routes_rapid: HashSet<String>,
        bus_stops: HashMap<String, HashSet<String>>,
    ) -> Self {
        Self::with_timezone(routes_bus, routes_cr, routes_rapid, bus_stops, chrono_tz::America::New_York)
    }

    pub fn with_timezone(
        routes_bus: HashSet<String>,
        routes_cr: HashSet<String>,
        routes_rapid: HashSet<String>,
        bus_stops: HashMap<String, HashSet<String>>,
        tz: chrono_tz::Tz,
    ) -> Self {
        assert!(
            routes_bus.is_disjoint(&routes_cr)
                && routes_bus.is_disjoint(&routes_rapid)
                && routes_cr.is_disjoint(&routes_rapid),
            "agency route catalog invariant violated: route sets must be disjoint"
        );
        Self {
            routes_bus,
            routes_cr,
            routes_rapid,
            bus_stops,
            tz,
        }
    }

    /// The reference agency's catalog: MBTA rapid transit, commuter rail,
    /// and a representative monitored-bus-stop allow-list. A real deployment
    /// swaps this for its own per-agency constant module.
    pub fn mbta() -> Self {
        let routes_rapid = HashSet::from([
            "Red".to_string(),
            "Orange".to_string(),
            "Blue".to_string(),
            "Green-B".to_string(),
            "Green-C".to_string(),
            "Green-D".to_string(),
            "Green-E".to_string(),
        ]);
        let routes_cr = HashSet::from([
            "CR-Worcester".to_string(),
            "CR-Fairmount".to_string(),
            "CR-Providence".to_string(),
            "CR-Franklin".to_string(),
        ]);
        let routes_bus: HashSet<String> = (1..=120).map(|n| n.to_string()).collect();
        let bus_stops = HashMap::new();
        Self::new(routes_bus, routes_cr, routes_rapid, bus_stops)
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.tz
    }

    pub fn all_routes(&self) -> HashSet<String> {
        self.routes_bus
            .iter()
            .chain(self.routes_cr.iter())
            .chain(self.routes_rapid.iter())
            .cloned()
            .collect()
    }

    pub fn routes_for_mode(&self, mode: Mode) -> &HashSet<String> {
        match mode {
            Mode::Bus => &self.routes_bus,
            Mode::Cr => &self.routes_cr,
            Mode::Rapid => &self.routes_rapid,
        }
    }

    /// Classifies a route id into its mode. Unknown routes are rejected at
    /// config-validation time, never silently at runtime — this returns
    /// `None` so the caller can decide.
    pub fn classify(&self, route_id: &str) -> Option<Mode> {
        if self.routes_bus.contains(route_id) {
            Some(Mode::Bus)
        } else if self.routes_cr.contains(route_id) {
            Some(Mode::Cr)
        } else if self.routes_rapid.contains(route_id) {
            Some(Mode::Rapid)
        } else {
            None
        }
    }

    /// The stop filter gate from §4.G: emit only for CR/Rapid routes, or
    /// for Bus routes whose stop is in the monitored allow-list. A bus
    /// route with no `BUS_STOPS` entry never emits (boundary condition).
    pub fn should_emit(&self, route_id: &str, stop_id: &str) -> bool {
        match self.classify(route_id) {
            Some(Mode::Cr) | Some(Mode::Rapid) => true,
            Some(Mode::Bus) => self
                .bus_stops
                .get(route_id)
                .is_some_and(|stops| stops.contains(stop_id)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> AgencyCatalog {
        let mut bus_stops = HashMap::new();
        bus_stops.insert("1".to_string(), HashSet::from(["10".to_string(), "11".to_string()]));
        AgencyCatalog::new(
            HashSet::from(["1".to_string()]),
            HashSet::from(["CR-Worcester".to_string()]),
            HashSet::from(["Red".to_string()]),
            bus_stops,
        )
    }

    #[test]
    fn classifies_each_mode() {
        let cat = fixture();
        assert_eq!(cat.classify("1"), Some(Mode::Bus));
        assert_eq!(cat.classify("CR-Worcester"), Some(Mode::Cr));
        assert_eq!(cat.classify("Red"), Some(Mode::Rapid));
        assert_eq!(cat.classify("nonexistent"), None);
    }

    #[test]
    fn bus_stop_filter_rejects_unlisted_stop() {
        let cat = fixture();
        assert!(!cat.should_emit("1", "99"));
        assert!(cat.should_emit("1", "10"));
    }

    #[test]
    fn bus_route_missing_from_bus_stops_never_emits() {
        let cat = AgencyCatalog::new(
            HashSet::from(["2".to_string()]),
            HashSet::new(),
            HashSet::new(),
            HashMap::new(),
        );
        assert!(!cat.should_emit("2", "anything"));
    }

    #[test]
    fn cr_and_rapid_always_emit() {
        let cat = fixture();
        assert!(cat.should_emit("CR-Worcester", "any-stop"));
        assert!(cat.should_emit("Red", "any-stop"));
    }

    #[test]
    #[should_panic(expected = "disjoint")]
    fn overlapping_route_sets_panic_at_construction() {
        AgencyCatalog::new(
            HashSet::from(["1".to_string()]),
            HashSet::from(["1".to_string()]),
            HashSet::new(),
            HashMap::new(),
        );
    }
}
