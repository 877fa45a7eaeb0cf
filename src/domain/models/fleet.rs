//! Fleet domain model.
//!
//! Trucks, loads, routes and the traffic/telemetry readings the loop
//! observes each cycle. A [`FleetSnapshot`] is the read-only view handed to
//! reasoning and planning; [`FleetState`] is the mutable copy owned by the
//! action executor.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::geo::Location;

/// Operational status of a truck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruckStatus {
    /// Parked with no route.
    Idle,
    /// Driving its route.
    EnRoute,
    Loading,
    Unloading,
    /// Out of service; never dispatched.
    Maintenance,
    /// Reported or inferred as not moving while it should be.
    Stuck,
    /// Moving but behind its schedule.
    Delayed,
}

impl Default for TruckStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl TruckStatus {
    /// Wire name, as used in fleet files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::EnRoute => "en_route",
            Self::Loading => "loading",
            Self::Unloading => "unloading",
            Self::Maintenance => "maintenance",
            Self::Stuck => "stuck",
            Self::Delayed => "delayed",
        }
    }

    /// Case-insensitive parse; `enroute` is accepted for `en_route`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "en_route" | "enroute" => Some(Self::EnRoute),
            "loading" => Some(Self::Loading),
            "unloading" => Some(Self::Unloading),
            "maintenance" => Some(Self::Maintenance),
            "stuck" => Some(Self::Stuck),
            "delayed" => Some(Self::Delayed),
            _ => None,
        }
    }

    /// Trucks that can take on new work.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Idle | Self::EnRoute)
    }
}

impl std::fmt::Display for TruckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A truck in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    /// Fleet-unique identifier.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: TruckStatus,
    /// Last known position.
    pub location: Location,
    /// Payload limit in kilograms.
    pub capacity_kg: f64,
    /// Fuel on board in litres.
    pub fuel_level_l: f64,
    /// Tank size in litres.
    #[serde(default = "default_fuel_capacity")]
    pub fuel_capacity_l: f64,
    /// Loads currently assigned to or carried by this truck.
    #[serde(default)]
    pub assigned_load_ids: Vec<String>,
    /// Active route, if the truck has one.
    #[serde(default)]
    pub route_id: Option<String>,
    /// Odometer since the truck joined the fleet.
    #[serde(default)]
    pub total_distance_km: f64,
    #[serde(default)]
    pub deliveries_completed: u32,
    /// Speed from the latest accepted GPS reading.
    #[serde(default)]
    pub speed_kmh: f64,
    /// Last time the truck was observed moving.
    pub last_moved_at: DateTime<Utc>,
}

const fn default_fuel_capacity() -> f64 {
    200.0
}

impl Truck {
    /// An idle truck with a full default tank, last seen moving at `now`.
    pub fn new(id: impl Into<String>, location: Location, capacity_kg: f64, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status: TruckStatus::Idle,
            location,
            capacity_kg,
            fuel_level_l: default_fuel_capacity(),
            fuel_capacity_l: default_fuel_capacity(),
            assigned_load_ids: Vec::new(),
            route_id: None,
            total_distance_km: 0.0,
            deliveries_completed: 0,
            speed_kmh: 0.0,
            last_moved_at: now,
        }
    }

    /// The first assigned load, if any.
    pub fn current_load_id(&self) -> Option<&str> {
        self.assigned_load_ids.first().map(String::as_str)
    }

    /// Carries or is assigned at least one load.
    pub fn is_loaded(&self) -> bool {
        !self.assigned_load_ids.is_empty()
    }

    /// Fuel level as a share of the tank, clamped to [0, 1].
    pub fn fuel_fraction(&self) -> f64 {
        if self.fuel_capacity_l <= 0.0 {
            return 0.0;
        }
        (self.fuel_level_l / self.fuel_capacity_l).clamp(0.0, 1.0)
    }

    /// Minutes since the truck last moved, as seen at `now`.
    pub fn stationary_minutes(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now - self.last_moved_at;
        (elapsed.num_seconds() as f64 / 60.0).max(0.0)
    }
}

/// Business priority of a load, lowest first so that `Ord` ranks urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPriority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Default for LoadPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl LoadPriority {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    /// Case-insensitive parse of the wire name.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Urgent and critical loads are dispatched ahead of cost.
    pub fn is_time_critical(&self) -> bool {
        matches!(self, Self::Urgent | Self::Critical)
    }
}

impl std::fmt::Display for LoadPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Assignment lifecycle of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Waiting for a truck.
    Unassigned,
    /// Matched to a truck that has not collected it yet.
    Assigned,
    /// On board.
    PickedUp,
    Delivered,
    Cancelled,
}

impl Default for LoadStatus {
    fn default() -> Self {
        Self::Unassigned
    }
}

impl LoadStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
            Self::PickedUp => "picked_up",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// States reachable from this one.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Unassigned => vec![Self::Assigned, Self::Cancelled],
            // Reassignment goes back through unassigned or stays assigned
            Self::Assigned => vec![Self::Unassigned, Self::Assigned, Self::PickedUp, Self::Cancelled],
            Self::PickedUp => vec![Self::Delivered],
            Self::Delivered | Self::Cancelled => vec![],
        }
    }

    /// `next` is in [`valid_transitions`](Self::valid_transitions).
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// States that require a truck reference.
    pub fn requires_truck(&self) -> bool {
        matches!(self, Self::Assigned | Self::PickedUp)
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hard time window on a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest service time.
    pub start: DateTime<Utc>,
    /// Latest service time.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window from `start` to `end`; callers keep `start <= end`.
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Minutes from `now` until the window closes (negative once closed).
    pub fn minutes_until_close(&self, now: DateTime<Utc>) -> f64 {
        (self.end - now).num_seconds() as f64 / 60.0
    }
}

/// A shipment awaiting or undergoing transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    /// Fleet-unique identifier.
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Mass counted against truck capacity.
    pub weight_kg: f64,
    #[serde(default)]
    pub volume_m3: f64,
    #[serde(default)]
    pub priority: LoadPriority,
    /// Where the load is collected.
    pub pickup: Location,
    /// Where the load is dropped off.
    pub delivery: Location,
    #[serde(default)]
    pub pickup_window: Option<TimeWindow>,
    #[serde(default)]
    pub delivery_window: Option<TimeWindow>,
    #[serde(default)]
    pub status: LoadStatus,
    /// Set exactly when the status requires a truck.
    #[serde(default)]
    pub assigned_truck_id: Option<String>,
    /// Route carrying the load, once dispatched.
    #[serde(default)]
    pub route_id: Option<String>,
}

impl Load {
    /// An unassigned load with no time windows.
    pub fn new(
        id: impl Into<String>,
        weight_kg: f64,
        priority: LoadPriority,
        pickup: Location,
        delivery: Location,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            weight_kg,
            volume_m3: 0.0,
            priority,
            pickup,
            delivery,
            pickup_window: None,
            delivery_window: None,
            status: LoadStatus::Unassigned,
            assigned_truck_id: None,
            route_id: None,
        }
    }

    /// Assignment state and truck reference agree.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            LoadStatus::Assigned | LoadStatus::PickedUp => self.assigned_truck_id.is_some(),
            LoadStatus::Unassigned | LoadStatus::Cancelled => self.assigned_truck_id.is_none(),
            LoadStatus::Delivered => true,
        }
    }

    /// Whether this load counts against its truck's capacity.
    pub fn occupies_capacity(&self) -> bool {
        self.status.requires_truck()
    }

    /// Earliest window close across pickup and delivery, used for ordering.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match (self.pickup_window, self.delivery_window) {
            (Some(p), Some(d)) => Some(p.end.min(d.end)),
            (Some(p), None) => Some(p.end),
            (None, Some(d)) => Some(d.end),
            (None, None) => None,
        }
    }

    /// Pickup and delivery as route stops.
    pub fn stops(&self) -> [Stop; 2] {
        [
            Stop {
                id: format!("{}-pickup", self.id),
                location: self.pickup,
                kind: StopKind::Pickup,
                load_id: Some(self.id.clone()),
                window: self.pickup_window,
            },
            Stop {
                id: format!("{}-delivery", self.id),
                location: self.delivery,
                kind: StopKind::Delivery,
                load_id: Some(self.id.clone()),
                window: self.delivery_window,
            },
        ]
    }
}

/// Why a route visits a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Pickup,
    Delivery,
    /// Pass-through point with no load attached.
    Waypoint,
}

/// A waypoint on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    /// Unique within a route; load stops use `<load>-pickup` and `<load>-delivery`.
    pub id: String,
    pub location: Location,
    pub kind: StopKind,
    /// Load served here, for pickups and deliveries.
    #[serde(default)]
    pub load_id: Option<String>,
    /// Hard window the arrival must fall in.
    #[serde(default)]
    pub window: Option<TimeWindow>,
}

impl Stop {
    /// A stop with no load and no window.
    pub fn waypoint(id: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.into(),
            location,
            kind: StopKind::Waypoint,
            load_id: None,
            window: None,
        }
    }

    /// Attach a hard arrival window.
    #[must_use]
    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }
}

/// Recorded arrival at a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopArrival {
    /// [`Stop::id`] of the stop reached.
    pub stop_id: String,
    pub arrived_at: DateTime<Utc>,
}

/// The active route of a truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// Truck driving the route; at most one route per truck.
    pub truck_id: String,
    /// Stops in visiting order.
    pub stops: Vec<Stop>,
    /// Planned totals from the optimizer.
    pub distance_km: f64,
    pub duration_min: f64,
    pub fuel_l: f64,
    pub created_at: DateTime<Utc>,
    /// When the truck set off; `None` while only planned.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Arrivals so far, in order.
    #[serde(default)]
    pub progress: Vec<StopArrival>,
}

impl Route {
    /// Stops not yet reached.
    pub fn remaining_stops(&self) -> Vec<Stop> {
        self.stops
            .iter()
            .filter(|s| !self.progress.iter().any(|p| p.stop_id == s.id))
            .cloned()
            .collect()
    }
}

/// Congestion level of a road segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLevel {
    FreeFlow,
    Light,
    Moderate,
    Heavy,
    Standstill,
}

impl Default for TrafficLevel {
    fn default() -> Self {
        Self::FreeFlow
    }
}

impl TrafficLevel {
    /// Travel cost multiplier; `standstill_ceiling` caps the scale.
    pub fn factor(&self, standstill_ceiling: f64) -> f64 {
        match self {
            Self::FreeFlow => 1.0,
            Self::Light => 1.1,
            Self::Moderate => 1.3,
            Self::Heavy => 1.7_f64.min(standstill_ceiling),
            Self::Standstill => standstill_ceiling,
        }
    }

    /// Heavy or standstill.
    pub fn is_congested(&self) -> bool {
        matches!(self, Self::Heavy | Self::Standstill)
    }
}

/// Directional segment key between two stops (or a truck and a stop).
pub fn segment_key(from_id: &str, to_id: &str) -> String {
    format!("{from_id}->{to_id}")
}

/// Observed traffic on one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficCondition {
    /// Key built by [`segment_key`].
    pub segment_id: String,
    pub level: TrafficLevel,
    /// Average observed speed; never negative.
    #[serde(default)]
    pub speed_kmh: f64,
    /// Extra minutes over free flow; never negative.
    #[serde(default)]
    pub delay_minutes: f64,
    /// Free-text cause, such as an accident or roadworks.
    #[serde(default)]
    pub incident: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Latest traffic level per segment.
pub type TrafficIndex = HashMap<String, TrafficLevel>;

/// A position report from a truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsReading {
    pub truck_id: String,
    pub location: Location,
    /// Ground speed at the time of the reading.
    #[serde(default)]
    pub speed_kmh: f64,
    /// Compass heading, 0 is north.
    #[serde(default)]
    pub heading_deg: f64,
    /// Device clock; readings stamped too far ahead are discarded.
    pub recorded_at: DateTime<Utc>,
}

/// Read-only view of the fleet taken once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Clock every time-based rule in the cycle is evaluated against.
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub trucks: Vec<Truck>,
    #[serde(default)]
    pub loads: Vec<Load>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub traffic: Vec<TrafficCondition>,
    /// Raw telemetry; after OBSERVE only accepted readings remain.
    #[serde(default)]
    pub gps: Vec<GpsReading>,
}

impl FleetSnapshot {
    pub fn truck(&self, id: &str) -> Option<&Truck> {
        self.trucks.iter().find(|t| t.id == id)
    }

    pub fn load(&self, id: &str) -> Option<&Load> {
        self.loads.iter().find(|l| l.id == id)
    }

    /// The route driven by `truck_id`, if any.
    pub fn route_for(&self, truck_id: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.truck_id == truck_id)
    }

    /// Loads still waiting for a truck, in snapshot order.
    pub fn unassigned_loads(&self) -> Vec<Load> {
        self.loads
            .iter()
            .filter(|l| l.status == LoadStatus::Unassigned)
            .cloned()
            .collect()
    }

    /// Latest reading per segment wins.
    pub fn traffic_index(&self) -> TrafficIndex {
        let mut latest: HashMap<&str, &TrafficCondition> = HashMap::new();
        for condition in &self.traffic {
            latest
                .entry(condition.segment_id.as_str())
                .and_modify(|current| {
                    if condition.observed_at >= current.observed_at {
                        *current = condition;
                    }
                })
                .or_insert(condition);
        }
        latest
            .into_iter()
            .map(|(segment, condition)| (segment.to_string(), condition.level))
            .collect()
    }

    /// Weight of loads currently occupying `truck_id`.
    pub fn committed_weight_kg(&self, truck_id: &str) -> f64 {
        self.loads
            .iter()
            .filter(|l| l.occupies_capacity() && l.assigned_truck_id.as_deref() == Some(truck_id))
            .map(|l| l.weight_kg)
            .sum()
    }

    /// Remaining planned stops for a truck, empty when it has no route.
    pub fn planned_stops(&self, truck_id: &str) -> Vec<Stop> {
        self.route_for(truck_id)
            .map(Route::remaining_stops)
            .unwrap_or_default()
    }

    /// Snapshot as of `minutes` from now, for scenario projections.
    pub fn horizon(&self, minutes: i64) -> DateTime<Utc> {
        self.taken_at + Duration::minutes(minutes)
    }
}

/// Mutable fleet records owned by the action executor for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    /// Trucks by id.
    pub trucks: BTreeMap<String, Truck>,
    /// Loads by id.
    pub loads: BTreeMap<String, Load>,
    /// Routes by route id.
    pub routes: BTreeMap<String, Route>,
    /// Traffic observed with the records, used to price rebuilt routes.
    #[serde(default)]
    pub traffic: TrafficIndex,
}

impl FleetState {
    /// Owned copy of the snapshot records.
    pub fn from_snapshot(snapshot: &FleetSnapshot) -> Self {
        Self {
            trucks: snapshot.trucks.iter().map(|t| (t.id.clone(), t.clone())).collect(),
            loads: snapshot.loads.iter().map(|l| (l.id.clone(), l.clone())).collect(),
            routes: snapshot.routes.iter().map(|r| (r.id.clone(), r.clone())).collect(),
            traffic: snapshot.traffic_index(),
        }
    }

    /// Weight of loads currently occupying `truck_id`.
    pub fn committed_weight_kg(&self, truck_id: &str) -> f64 {
        self.loads
            .values()
            .filter(|l| l.occupies_capacity() && l.assigned_truck_id.as_deref() == Some(truck_id))
            .map(|l| l.weight_kg)
            .sum()
    }

    /// First violated invariant, if any.
    pub fn check_invariants(&self) -> Result<(), String> {
        for load in self.loads.values() {
            if !load.is_consistent() {
                return Err(format!(
                    "load {} is {} with truck {:?}",
                    load.id, load.status, load.assigned_truck_id
                ));
            }
        }
        for truck in self.trucks.values() {
            let committed = self.committed_weight_kg(&truck.id);
            if committed > truck.capacity_kg + f64::EPSILON {
                return Err(format!(
                    "truck {} carries {committed:.1} kg over capacity {:.1} kg",
                    truck.id, truck.capacity_kg
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_truck_status_roundtrip() {
        for status in [
            TruckStatus::Idle,
            TruckStatus::EnRoute,
            TruckStatus::Loading,
            TruckStatus::Unloading,
            TruckStatus::Maintenance,
            TruckStatus::Stuck,
            TruckStatus::Delayed,
        ] {
            assert_eq!(TruckStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TruckStatus::from_str("flying"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(LoadPriority::Critical > LoadPriority::Urgent);
        assert!(LoadPriority::Urgent > LoadPriority::High);
        assert!(LoadPriority::High > LoadPriority::Normal);
        assert!(LoadPriority::Normal > LoadPriority::Low);
    }

    #[test]
    fn test_load_status_transitions() {
        assert!(LoadStatus::Unassigned.can_transition_to(LoadStatus::Assigned));
        assert!(LoadStatus::Assigned.can_transition_to(LoadStatus::PickedUp));
        assert!(LoadStatus::PickedUp.can_transition_to(LoadStatus::Delivered));
        assert!(!LoadStatus::Unassigned.can_transition_to(LoadStatus::Delivered));
        assert!(LoadStatus::Delivered.valid_transitions().is_empty());
    }

    #[test]
    fn test_load_consistency() {
        let mut load = Load::new(
            "L1",
            100.0,
            LoadPriority::Normal,
            Location::new(0.0, 0.0),
            Location::new(0.1, 0.0),
        );
        assert!(load.is_consistent());

        load.status = LoadStatus::Assigned;
        assert!(!load.is_consistent());

        load.assigned_truck_id = Some("T1".into());
        assert!(load.is_consistent());

        load.status = LoadStatus::Unassigned;
        assert!(!load.is_consistent());
    }

    #[test]
    fn test_traffic_factor_respects_ceiling() {
        assert!((TrafficLevel::FreeFlow.factor(3.0) - 1.0).abs() < f64::EPSILON);
        assert!((TrafficLevel::Standstill.factor(3.0) - 3.0).abs() < f64::EPSILON);
        assert!((TrafficLevel::Standstill.factor(2.0) - 2.0).abs() < f64::EPSILON);
        assert!((TrafficLevel::Heavy.factor(1.5) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_traffic_index_keeps_latest_reading() {
        let t0 = now();
        let snapshot = FleetSnapshot {
            taken_at: t0,
            traffic: vec![
                TrafficCondition {
                    segment_id: segment_key("A", "B"),
                    level: TrafficLevel::Standstill,
                    speed_kmh: 0.0,
                    delay_minutes: 40.0,
                    incident: Some("crash".into()),
                    observed_at: t0 - Duration::minutes(10),
                },
                TrafficCondition {
                    segment_id: segment_key("A", "B"),
                    level: TrafficLevel::Light,
                    speed_kmh: 55.0,
                    delay_minutes: 2.0,
                    incident: None,
                    observed_at: t0,
                },
            ],
            ..Default::default()
        };

        let index = snapshot.traffic_index();
        assert_eq!(index.get("A->B"), Some(&TrafficLevel::Light));
    }

    #[test]
    fn test_state_invariants_detect_overload() {
        let mut truck = Truck::new("T1", Location::new(0.0, 0.0), 500.0, now());
        truck.assigned_load_ids = vec!["L1".into()];
        let mut load = Load::new(
            "L1",
            600.0,
            LoadPriority::Normal,
            Location::new(0.0, 0.0),
            Location::new(0.1, 0.0),
        );
        load.status = LoadStatus::Assigned;
        load.assigned_truck_id = Some("T1".into());

        let state = FleetState::from_snapshot(&FleetSnapshot {
            taken_at: now(),
            trucks: vec![truck],
            loads: vec![load],
            ..Default::default()
        });

        let err = state.check_invariants().unwrap_err();
        assert!(err.contains("over capacity"));
    }
}
