//! Observation preprocessing.
//!
//! Runs inside OBSERVE before anything reasons over the snapshot. Malformed
//! records are dropped with a warning, GPS readings that pass the range and
//! clock checks move their truck, and an en-route truck whose most recent
//! readings are all crawling is marked stuck.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::models::{
    FleetSnapshot, GpsReading, Load, ObservationConfig, TrafficCondition, Truck, TruckStatus,
};

/// What preprocessing changed in one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationReport {
    /// Trucks whose position came from a GPS reading.
    pub positions_applied: usize,
    /// Trucks newly marked stuck from their speed history.
    pub marked_stuck: Vec<String>,
    pub dropped_trucks: usize,
    pub dropped_loads: usize,
    pub dropped_traffic: usize,
    pub dropped_gps: usize,
}

impl ObservationReport {
    pub fn dropped(&self) -> usize {
        self.dropped_trucks + self.dropped_loads + self.dropped_traffic + self.dropped_gps
    }
}

/// Validates a raw snapshot and folds GPS telemetry into truck state.
#[derive(Debug, Clone, Default)]
pub struct ObservationPreprocessor {
    config: ObservationConfig,
}

impl ObservationPreprocessor {
    pub fn new(config: ObservationConfig) -> Self {
        Self { config }
    }

    /// Clean `snapshot` in place.
    ///
    /// Only accepted readings remain in `snapshot.gps`, sorted by truck and
    /// then time.
    pub fn prepare(&self, snapshot: &mut FleetSnapshot) -> ObservationReport {
        let mut report = ObservationReport::default();

        let before = snapshot.trucks.len();
        snapshot.trucks.retain(|t| truck_is_valid(t));
        report.dropped_trucks = before - snapshot.trucks.len();

        let before = snapshot.loads.len();
        snapshot.loads.retain(|l| load_is_valid(l));
        report.dropped_loads = before - snapshot.loads.len();

        let before = snapshot.traffic.len();
        snapshot.traffic.retain(|c| traffic_is_valid(c));
        report.dropped_traffic = before - snapshot.traffic.len();

        let latest_allowed = snapshot.taken_at + Duration::seconds(self.config.max_clock_skew_seconds);
        let known: HashSet<&str> = snapshot.trucks.iter().map(|t| t.id.as_str()).collect();
        let mut accepted: Vec<GpsReading> = Vec::with_capacity(snapshot.gps.len());
        for reading in snapshot.gps.drain(..) {
            if !known.contains(reading.truck_id.as_str()) {
                debug!(truck_id = %reading.truck_id, "gps reading for unknown truck dropped");
                report.dropped_gps += 1;
            } else if let Err(problem) = self.check_reading(&reading, latest_allowed) {
                warn!(
                    truck_id = %reading.truck_id,
                    recorded_at = %reading.recorded_at,
                    problem,
                    "gps reading dropped"
                );
                report.dropped_gps += 1;
            } else {
                accepted.push(reading);
            }
        }
        accepted.sort_by(|a, b| {
            a.truck_id
                .cmp(&b.truck_id)
                .then(a.recorded_at.cmp(&b.recorded_at))
        });

        for truck in &mut snapshot.trucks {
            let history: Vec<&GpsReading> = accepted.iter().filter(|r| r.truck_id == truck.id).collect();
            let Some(latest) = history.last() else {
                continue;
            };
            truck.location = latest.location;
            truck.speed_kmh = latest.speed_kmh;
            report.positions_applied += 1;

            let last_moving = history
                .iter()
                .rev()
                .find(|r| r.speed_kmh >= self.config.stuck_speed_kmh)
                .map(|r| r.recorded_at);
            if let Some(moved_at) = last_moving {
                if moved_at > truck.last_moved_at {
                    truck.last_moved_at = moved_at;
                }
            }

            if truck.status == TruckStatus::EnRoute && self.is_crawling(&history) {
                info!(
                    truck_id = %truck.id,
                    readings = self.config.stuck_readings,
                    below_kmh = self.config.stuck_speed_kmh,
                    "truck marked stuck from gps history"
                );
                truck.status = TruckStatus::Stuck;
                report.marked_stuck.push(truck.id.clone());
            }
        }
        snapshot.gps = accepted;

        if report.dropped() > 0 {
            warn!(
                trucks = report.dropped_trucks,
                loads = report.dropped_loads,
                traffic = report.dropped_traffic,
                gps = report.dropped_gps,
                "malformed observations dropped"
            );
        }
        report
    }

    fn check_reading(
        &self,
        reading: &GpsReading,
        latest_allowed: DateTime<Utc>,
    ) -> Result<(), &'static str> {
        if !reading.location.is_valid() {
            return Err("coordinates out of range");
        }
        if !(0.0..=self.config.max_speed_kmh).contains(&reading.speed_kmh) {
            return Err("speed out of range");
        }
        if reading.recorded_at > latest_allowed {
            return Err("timestamp in the future");
        }
        Ok(())
    }

    /// The last `stuck_readings` readings, oldest first, are all below the
    /// stuck speed.
    fn is_crawling(&self, history: &[&GpsReading]) -> bool {
        let window = self.config.stuck_readings;
        history.len() >= window
            && history[history.len() - window..]
                .iter()
                .all(|r| r.speed_kmh < self.config.stuck_speed_kmh)
    }
}

fn truck_is_valid(truck: &Truck) -> bool {
    let valid = truck.location.is_valid() && truck.capacity_kg.is_finite() && truck.capacity_kg > 0.0;
    if !valid {
        warn!(truck_id = %truck.id, capacity_kg = truck.capacity_kg, "malformed truck record dropped");
    }
    valid
}

fn load_is_valid(load: &Load) -> bool {
    let valid = load.weight_kg.is_finite()
        && load.weight_kg > 0.0
        && load.pickup.is_valid()
        && load.delivery.is_valid();
    if !valid {
        warn!(load_id = %load.id, weight_kg = load.weight_kg, "malformed load record dropped");
    }
    valid
}

fn traffic_is_valid(condition: &TrafficCondition) -> bool {
    let valid = condition.speed_kmh >= 0.0 && condition.delay_minutes >= 0.0;
    if !valid {
        warn!(
            segment_id = %condition.segment_id,
            speed_kmh = condition.speed_kmh,
            delay_minutes = condition.delay_minutes,
            "malformed traffic record dropped"
        );
    }
    valid
}
