//! Load assignment engine.
//!
//! Greedy weighted bipartite matching of pending loads to trucks. Loads are
//! processed by priority (then deadline, then id); each takes the cheapest
//! feasible truck, and the truck's spare capacity and planned stops are
//! updated before the next load is considered. Exact cost ties go to the
//! lexicographically smaller truck id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::models::{
    AssignmentConfig, FleetSnapshot, Load, LoadPriority, Stop, TrafficIndex, Truck,
};

use super::route_optimizer::{OptimizedRoute, RouteOptimizer};

/// Why a load could not be matched, ordered by how far the checks got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoTrucksAvailable,
    OutOfRadius,
    Capacity,
    InsufficientFuel,
    TimeWindow,
    /// Feasible only on trucks already given a load in this dispatch round.
    TruckCommitted,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTrucksAvailable => "no_trucks_available",
            Self::OutOfRadius => "out_of_radius",
            Self::Capacity => "capacity",
            Self::InsufficientFuel => "insufficient_fuel",
            Self::TimeWindow => "time_window",
            Self::TruckCommitted => "truck_committed",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A load matched to a truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub load_id: String,
    pub truck_id: String,
    pub load_priority: LoadPriority,
    pub weight_kg: f64,
    /// Matching cost; lower is preferred.
    pub cost: f64,
    pub distance_to_pickup_km: f64,
    /// Extra weighted distance over the truck's current plan.
    pub detour_km: f64,
    /// Priority term added to the cost, negative for higher priorities.
    pub priority_adjustment: f64,
    /// The truck's planned route after inserting this load.
    pub route: OptimizedRoute,
}

/// A load no truck could take, with the furthest check it reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unassignable {
    pub load_id: String,
    pub reason: RejectionReason,
}

/// Result of one matching pass; every input load lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub assignments: Vec<Assignment>,
    pub unassignable: Vec<Unassignable>,
}

impl AssignmentOutcome {
    pub fn assignment_for(&self, load_id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.load_id == load_id)
    }

    pub fn rejection_for(&self, load_id: &str) -> Option<RejectionReason> {
        self.unassignable
            .iter()
            .find(|u| u.load_id == load_id)
            .map(|u| u.reason)
    }
}

/// Mutable per-truck view while matching.
struct Candidate<'a> {
    truck: &'a Truck,
    committed_kg: f64,
    planned: Vec<Stop>,
    base: OptimizedRoute,
    claimed: bool,
}

struct PairEvaluation {
    cost: f64,
    distance_to_pickup_km: f64,
    detour_km: f64,
    priority_adjustment: f64,
    route: OptimizedRoute,
}

/// Matches unassigned loads to candidate trucks.
#[derive(Debug, Clone)]
pub struct LoadAssignmentEngine {
    optimizer: RouteOptimizer,
    config: AssignmentConfig,
}

impl LoadAssignmentEngine {
    pub fn new(optimizer: RouteOptimizer, config: AssignmentConfig) -> Self {
        Self { optimizer, config }
    }

    /// Assign `loads` to `trucks` against the commitments in `snapshot`.
    ///
    /// Capacity already committed in the snapshot plus every weight assigned
    /// here never exceeds a truck's capacity.
    pub fn assign(&self, loads: &[Load], trucks: &[Truck], snapshot: &FleetSnapshot) -> AssignmentOutcome {
        self.matching(loads, trucks, snapshot, false)
    }

    /// Joint matching for one cycle's dispatches: each truck takes at most
    /// one new load, so every assignment can be executed as its own
    /// dispatch. Loads that only fit trucks claimed earlier in the round are
    /// reported as [`RejectionReason::TruckCommitted`].
    pub fn dispatch_round(&self, loads: &[Load], trucks: &[Truck], snapshot: &FleetSnapshot) -> AssignmentOutcome {
        self.matching(loads, trucks, snapshot, true)
    }

    fn matching(
        &self,
        loads: &[Load],
        trucks: &[Truck],
        snapshot: &FleetSnapshot,
        one_per_truck: bool,
    ) -> AssignmentOutcome {
        let traffic = snapshot.traffic_index();
        let departure = snapshot.taken_at;

        let mut eligible: Vec<&Truck> = trucks.iter().filter(|t| t.status.is_dispatchable()).collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let mut candidates: Vec<Candidate<'_>> = eligible
            .into_iter()
            .map(|truck| {
                let planned = snapshot.planned_stops(&truck.id);
                let base = self.optimizer.optimize(truck, &planned, &traffic, departure);
                Candidate {
                    truck,
                    committed_kg: snapshot.committed_weight_kg(&truck.id),
                    planned: base.ordered_stops.clone(),
                    base,
                    claimed: false,
                }
            })
            .collect();

        let mut ordered: Vec<&Load> = loads.iter().collect();
        ordered.sort_by(|a, b| compare_load_order(a, b));

        let mut outcome = AssignmentOutcome::default();
        for load in ordered {
            if candidates.is_empty() {
                outcome.unassignable.push(Unassignable {
                    load_id: load.id.clone(),
                    reason: RejectionReason::NoTrucksAvailable,
                });
                continue;
            }

            let mut best: Option<(usize, PairEvaluation)> = None;
            let mut furthest = RejectionReason::OutOfRadius;
            for (idx, candidate) in candidates.iter().enumerate() {
                match self.evaluate_pair(load, candidate, &traffic, departure) {
                    Ok(_) if one_per_truck && candidate.claimed => {
                        furthest = furthest.max(RejectionReason::TruckCommitted);
                    }
                    Ok(eval) => {
                        let better = best.as_ref().map_or(true, |(best_idx, best_eval)| {
                            match eval.cost.total_cmp(&best_eval.cost) {
                                Ordering::Less => true,
                                Ordering::Greater => false,
                                Ordering::Equal => candidate.truck.id < candidates[*best_idx].truck.id,
                            }
                        });
                        if better {
                            best = Some((idx, eval));
                        }
                    }
                    Err(reason) => furthest = furthest.max(reason),
                }
            }

            match best {
                Some((idx, eval)) => {
                    let candidate = &mut candidates[idx];
                    candidate.committed_kg += load.weight_kg;
                    candidate.planned = eval.route.ordered_stops.clone();
                    candidate.base = eval.route.clone();
                    candidate.claimed = true;

                    debug!(
                        load_id = %load.id,
                        truck_id = %candidate.truck.id,
                        cost = eval.cost,
                        "load assigned"
                    );
                    outcome.assignments.push(Assignment {
                        load_id: load.id.clone(),
                        truck_id: candidate.truck.id.clone(),
                        load_priority: load.priority,
                        weight_kg: load.weight_kg,
                        cost: eval.cost,
                        distance_to_pickup_km: eval.distance_to_pickup_km,
                        detour_km: eval.detour_km,
                        priority_adjustment: eval.priority_adjustment,
                        route: eval.route,
                    });
                }
                None => {
                    debug!(load_id = %load.id, reason = %furthest, "load unassignable");
                    outcome.unassignable.push(Unassignable {
                        load_id: load.id.clone(),
                        reason: furthest,
                    });
                }
            }
        }

        outcome
    }

    /// Check constraints in order and price a feasible pair.
    fn evaluate_pair(
        &self,
        load: &Load,
        candidate: &Candidate<'_>,
        traffic: &TrafficIndex,
        departure: chrono::DateTime<chrono::Utc>,
    ) -> Result<PairEvaluation, RejectionReason> {
        let truck = candidate.truck;
        let distance_to_pickup_km = truck.location.distance_km(&load.pickup);
        if distance_to_pickup_km > self.config.search_radius_km {
            return Err(RejectionReason::OutOfRadius);
        }

        if candidate.committed_kg + load.weight_kg > truck.capacity_kg + f64::EPSILON {
            return Err(RejectionReason::Capacity);
        }

        let mut stops = candidate.planned.clone();
        stops.extend(load.stops());
        let route = self.optimizer.optimize(truck, &stops, traffic, departure);

        let routing = self.optimizer.config();
        let range_km = truck.fuel_level_l * self.config.usable_fuel_fraction / routing.fuel_l_per_km.max(f64::EPSILON);
        if route.distance_km > range_km {
            return Err(RejectionReason::InsufficientFuel);
        }

        if route.window_violations > candidate.base.window_violations {
            return Err(RejectionReason::TimeWindow);
        }

        let detour_km = (route.weighted_distance_km - candidate.base.weighted_distance_km).max(0.0);
        let priority_adjustment = self.priority_adjustment(load.priority);

        Ok(PairEvaluation {
            cost: distance_to_pickup_km + detour_km + priority_adjustment,
            distance_to_pickup_km,
            detour_km,
            priority_adjustment,
            route,
        })
    }

    fn priority_adjustment(&self, priority: LoadPriority) -> f64 {
        match priority {
            LoadPriority::Critical => self.config.critical_discount,
            LoadPriority::Urgent => self.config.urgent_discount,
            LoadPriority::High => self.config.high_discount,
            LoadPriority::Normal | LoadPriority::Low => 0.0,
        }
    }
}

/// Priority descending, earliest deadline, then id.
fn compare_load_order(a: &Load, b: &Load) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.deadline(), b.deadline()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}
