//! Scenario planner.
//!
//! Builds a fixed menu of candidate scenarios per issue type and prices each
//! one with the route optimizer or the assignment engine. Menus for distinct
//! issues share no mutable state, so [`ScenarioPlanner::plan_all`] fans them
//! out over a bounded pool of blocking workers.
//!
//! Unassigned loads compete for the same trucks, so their dispatches come
//! from one matching per cycle ([`ScenarioPlanner::dispatch_round`]) rather
//! than from each issue alone.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::models::{
    Action, FleetSnapshot, Issue, IssueType, Load, LoadStatus, Scenario, Stop, TrafficIndex,
    Truck,
};

use super::load_assignment::{AssignmentOutcome, LoadAssignmentEngine, RejectionReason};
use super::route_optimizer::{OptimizationOutcome, OptimizedRoute, RouteOptimizer};

const WAIT_RELIABILITY: f64 = 0.7;
const LONG_WAIT_RELIABILITY: f64 = 0.75;
const MONITOR_RELIABILITY: f64 = 0.5;
const REROUTE_RELIABILITY: f64 = 0.85;
const CONSERVATIVE_REROUTE_RELIABILITY: f64 = 0.8;
const REASSIGN_RELIABILITY: f64 = 0.9;
const NOTIFY_RELIABILITY: f64 = 0.6;
const DISPATCH_RELIABILITY: f64 = 0.95;
const ESCALATE_RELIABILITY: f64 = 0.8;
const CAPACITY_ESCALATE_RELIABILITY: f64 = 0.9;

const NOTIFICATION_COST: f64 = 10.0;
const ESCALATION_MINUTES: f64 = 30.0;
const CAPACITY_ESCALATION_MINUTES: f64 = 15.0;
const HOLD_FOR_TRUCK_MINUTES: f64 = 15.0;
const HOLD_FOR_TRUCK_RELIABILITY: f64 = 0.6;

/// Cost, time and fuel attached to a candidate.
#[derive(Debug, Clone, Copy, Default)]
struct Estimate {
    cost: f64,
    time_min: f64,
    fuel_l: f64,
    infeasible: bool,
}

impl Estimate {
    fn from_route(route: &OptimizedRoute) -> Self {
        Self {
            cost: route.cost,
            time_min: route.duration_min,
            fuel_l: route.fuel_l,
            infeasible: route.feasibility_violated,
        }
    }
}

struct Candidate {
    kind: &'static str,
    name: String,
    description: String,
    action: Action,
    estimate: Estimate,
    base_reliability: f64,
}

/// Generates and prices candidate scenarios for issues.
#[derive(Debug, Clone)]
pub struct ScenarioPlanner {
    optimizer: RouteOptimizer,
    assignment: LoadAssignmentEngine,
}

impl ScenarioPlanner {
    pub fn new(optimizer: RouteOptimizer, assignment: LoadAssignmentEngine) -> Self {
        Self {
            optimizer,
            assignment,
        }
    }

    /// One-load-per-truck matching of every unassigned load in the snapshot.
    pub fn dispatch_round(&self, snapshot: &FleetSnapshot) -> AssignmentOutcome {
        self.assignment
            .dispatch_round(&snapshot.unassigned_loads(), &snapshot.trucks, snapshot)
    }

    /// Candidate scenarios for one issue, in stable menu order.
    pub fn plan(&self, issue: &Issue, snapshot: &FleetSnapshot) -> Vec<Scenario> {
        let round = self.dispatch_round(snapshot);
        self.plan_with(issue, snapshot, &round)
    }

    /// Like [`plan`](Self::plan), with dispatches drawn from a precomputed
    /// [`dispatch_round`](Self::dispatch_round).
    pub fn plan_with(&self, issue: &Issue, snapshot: &FleetSnapshot, round: &AssignmentOutcome) -> Vec<Scenario> {
        let traffic = snapshot.traffic_index();
        let truck = issue.primary_truck().and_then(|id| snapshot.truck(id));

        let candidates = match (issue.issue_type, truck) {
            (IssueType::StuckTruck, Some(truck)) => {
                let mut menu = vec![self.wait(truck, snapshot, &traffic, 30.0, WAIT_RELIABILITY)];
                menu.extend(self.reroute(truck, snapshot, &traffic, REROUTE_RELIABILITY));
                menu.extend(self.reassign(issue, truck, snapshot));
                menu
            }
            (IssueType::Delay, Some(truck)) => {
                let mut menu = vec![
                    self.notify(truck, snapshot, &traffic, "customer", "Delivery delayed; revised arrival to follow"),
                    self.wait(truck, snapshot, &traffic, 45.0, LONG_WAIT_RELIABILITY),
                ];
                menu.extend(self.reroute(truck, snapshot, &traffic, REROUTE_RELIABILITY));
                menu
            }
            (IssueType::Traffic, Some(truck)) => {
                let mut menu: Vec<Candidate> = self
                    .reroute(truck, snapshot, &traffic, REROUTE_RELIABILITY)
                    .into_iter()
                    .collect();
                menu.push(self.wait(truck, snapshot, &traffic, 20.0, WAIT_RELIABILITY));
                menu
            }
            (IssueType::LowFuel, Some(truck)) => {
                let mut menu: Vec<Candidate> = self
                    .reroute(truck, snapshot, &traffic, CONSERVATIVE_REROUTE_RELIABILITY)
                    .into_iter()
                    .collect();
                menu.push(self.notify(truck, snapshot, &traffic, "driver", "Refuel at the nearest station"));
                menu
            }
            (IssueType::WindowRisk | IssueType::UnassignedLoad | IssueType::CapacityMismatch, _) => {
                self.dispatch_or_escalate(issue, snapshot, round)
            }
            _ => vec![
                self.monitor(truck, snapshot, &traffic),
                self.escalate(issue, ESCALATE_RELIABILITY, ESCALATION_MINUTES, "Request operator review"),
            ],
        };

        let scenarios: Vec<Scenario> = candidates
            .into_iter()
            .enumerate()
            .map(|(sequence, candidate)| {
                let mut reliability =
                    (candidate.base_reliability * (0.5 + 0.5 * issue.confidence)).clamp(0.0, 1.0);
                if candidate.estimate.infeasible {
                    reliability /= 2.0;
                }
                Scenario {
                    id: format!("SCEN-{}-{}", issue.id, candidate.kind),
                    issue_id: issue.id.clone(),
                    name: candidate.name,
                    description: candidate.description,
                    actions: vec![candidate.action],
                    estimated_cost: candidate.estimate.cost.max(0.0),
                    estimated_time_min: candidate.estimate.time_min.max(0.0),
                    estimated_fuel_l: candidate.estimate.fuel_l.max(0.0),
                    reliability,
                    feasibility_violated: candidate.estimate.infeasible,
                    sequence,
                }
            })
            .collect();

        for scenario in &scenarios {
            debug!(
                issue_id = %issue.id,
                scenario_id = %scenario.id,
                cost = scenario.estimated_cost,
                time_min = scenario.estimated_time_min,
                reliability = scenario.reliability,
                "scenario planned"
            );
        }
        scenarios
    }

    /// Plan every issue on at most `workers` blocking tasks.
    ///
    /// Output is grouped by issue in input order; a failed worker only drops
    /// its own issue's scenarios.
    pub async fn plan_all(
        self: &Arc<Self>,
        issues: &[Issue],
        snapshot: Arc<FleetSnapshot>,
        workers: usize,
    ) -> Vec<Scenario> {
        let round = {
            let planner = Arc::clone(self);
            let snapshot = Arc::clone(&snapshot);
            match tokio::task::spawn_blocking(move || planner.dispatch_round(&snapshot)).await {
                Ok(round) => Arc::new(round),
                Err(e) => {
                    warn!(error = %e, "dispatch matching task failed");
                    Arc::new(AssignmentOutcome::default())
                }
            }
        };
        debug!(
            assigned = round.assignments.len(),
            unassignable = round.unassignable.len(),
            "dispatch round matched"
        );

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(issues.len());

        for issue in issues {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                warn!("planner pool closed before all issues were scheduled");
                break;
            };
            let planner = Arc::clone(self);
            let snapshot = Arc::clone(&snapshot);
            let round = Arc::clone(&round);
            let issue = issue.clone();
            let issue_id = issue.id.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                planner.plan_with(&issue, &snapshot, &round)
            });
            handles.push((issue_id, handle));
        }

        let (issue_ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let mut scenarios = Vec::new();
        for (issue_id, joined) in issue_ids.iter().zip(join_all(handles).await) {
            match joined {
                Ok(planned) => scenarios.extend(planned),
                Err(e) => warn!(issue_id = %issue_id, error = %e, "scenario planning task failed"),
            }
        }
        scenarios
    }

    fn current_route(&self, truck: &Truck, snapshot: &FleetSnapshot, traffic: &TrafficIndex, delay_min: f64) -> OptimizedRoute {
        let stops = snapshot.planned_stops(&truck.id);
        let departure = snapshot.taken_at + ChronoDuration::seconds((delay_min * 60.0) as i64);
        self.optimizer.evaluate(truck, &stops, traffic, departure)
    }

    fn wait(
        &self,
        truck: &Truck,
        snapshot: &FleetSnapshot,
        traffic: &TrafficIndex,
        minutes: f64,
        base_reliability: f64,
    ) -> Candidate {
        let route = self.current_route(truck, snapshot, traffic, minutes);
        let mut estimate = Estimate::from_route(&route);
        estimate.cost += self.optimizer.cost_of(0.0, minutes);
        estimate.time_min += minutes;
        Candidate {
            kind: "WAIT",
            name: format!("Wait {minutes:.0} minutes"),
            description: format!("Hold truck {} for {minutes:.0} minutes, then continue on the current route", truck.id),
            action: Action::Wait {
                truck_id: Some(truck.id.clone()),
                duration_minutes: minutes,
            },
            estimate,
            base_reliability,
        }
    }

    fn monitor(&self, truck: Option<&Truck>, snapshot: &FleetSnapshot, traffic: &TrafficIndex) -> Candidate {
        let minutes = 15.0;
        let mut estimate = truck
            .map(|t| Estimate::from_route(&self.current_route(t, snapshot, traffic, minutes)))
            .unwrap_or_default();
        estimate.cost += self.optimizer.cost_of(0.0, minutes);
        estimate.time_min += minutes;
        Candidate {
            kind: "WAIT",
            name: "Monitor and reassess".to_string(),
            description: "Keep monitoring for 15 minutes and reassess".to_string(),
            action: Action::Wait {
                truck_id: truck.map(|t| t.id.clone()),
                duration_minutes: minutes,
            },
            estimate,
            base_reliability: MONITOR_RELIABILITY,
        }
    }

    /// Reroute only when the optimizer finds a better order.
    fn reroute(
        &self,
        truck: &Truck,
        snapshot: &FleetSnapshot,
        traffic: &TrafficIndex,
        base_reliability: f64,
    ) -> Option<Candidate> {
        let stops = snapshot.planned_stops(&truck.id);
        if stops.len() < 2 {
            return None;
        }
        let route = self.optimizer.optimize(truck, &stops, traffic, snapshot.taken_at);
        if route.outcome == OptimizationOutcome::NoImprovement {
            debug!(truck_id = %truck.id, "no reroute candidate: current order already best");
            return None;
        }
        Some(Candidate {
            kind: "REROUTE",
            name: format!("Reroute {}", truck.id),
            description: format!(
                "Visit {} in optimized order ({:.1} km)",
                route.stop_ids().join(", "),
                route.distance_km
            ),
            estimate: Estimate::from_route(&route),
            action: Action::Reroute {
                truck_id: truck.id.clone(),
                stops: route.ordered_stops,
            },
            base_reliability,
        })
    }

    fn notify(
        &self,
        truck: &Truck,
        snapshot: &FleetSnapshot,
        traffic: &TrafficIndex,
        recipient: &str,
        message: &str,
    ) -> Candidate {
        let mut estimate = Estimate::from_route(&self.current_route(truck, snapshot, traffic, 0.0));
        estimate.cost += NOTIFICATION_COST;
        Candidate {
            kind: "NOTIFY",
            name: format!("Continue and notify {recipient}"),
            description: format!("Truck {} continues; {recipient} is notified", truck.id),
            action: Action::Notify {
                recipient: recipient.to_string(),
                message: message.to_string(),
            },
            estimate,
            base_reliability: NOTIFY_RELIABILITY,
        }
    }

    /// Move the stuck truck's load to the best other truck.
    fn reassign(&self, issue: &Issue, truck: &Truck, snapshot: &FleetSnapshot) -> Option<Candidate> {
        let load_id = issue.primary_load().or_else(|| truck.current_load_id())?;
        let load = snapshot.load(load_id)?;
        if load.assigned_truck_id.as_deref() != Some(truck.id.as_str()) {
            return None;
        }

        let others: Vec<Truck> = snapshot
            .trucks
            .iter()
            .filter(|t| t.id != truck.id)
            .cloned()
            .collect();
        let mut detached: Load = load.clone();
        if detached.status == LoadStatus::PickedUp {
            // Transfer happens at the stuck truck's position.
            detached.pickup = truck.location;
            detached.pickup_window = None;
        }
        let outcome = self.assignment.assign(std::slice::from_ref(&detached), &others, snapshot);
        let assignment = outcome.assignment_for(&load.id)?;

        Some(Candidate {
            kind: "REASSIGN",
            name: format!("Reassign {} to {}", load.id, assignment.truck_id),
            description: format!(
                "Transfer load {} from {} to {} ({:.1} km to pickup)",
                load.id, truck.id, assignment.truck_id, assignment.distance_to_pickup_km
            ),
            action: Action::Reassign {
                load_id: load.id.clone(),
                from_truck_id: Some(truck.id.clone()),
                to_truck_id: assignment.truck_id.clone(),
                load_priority: load.priority,
            },
            estimate: Estimate::from_route(&assignment.route),
            base_reliability: REASSIGN_RELIABILITY,
        })
    }

    fn dispatch_or_escalate(&self, issue: &Issue, snapshot: &FleetSnapshot, round: &AssignmentOutcome) -> Vec<Candidate> {
        let Some(load) = issue.primary_load().and_then(|id| snapshot.load(id)) else {
            return vec![self.escalate(issue, ESCALATE_RELIABILITY, ESCALATION_MINUTES, "Issue references no known load")];
        };
        if load.status != LoadStatus::Unassigned {
            return vec![self.escalate(
                issue,
                ESCALATE_RELIABILITY,
                ESCALATION_MINUTES,
                &format!("Load {} is already {}", load.id, load.status),
            )];
        }

        if let Some(assignment) = round.assignment_for(&load.id) {
            let stops: Vec<Stop> = assignment.route.ordered_stops.clone();
            return vec![Candidate {
                kind: "DISPATCH",
                name: format!("Dispatch {} for {}", assignment.truck_id, load.id),
                description: format!(
                    "Send truck {} to collect {} load {} ({:.1} km to pickup)",
                    assignment.truck_id, load.priority, load.id, assignment.distance_to_pickup_km
                ),
                action: Action::Dispatch {
                    truck_id: assignment.truck_id.clone(),
                    load_id: load.id.clone(),
                    stops,
                    load_priority: load.priority,
                },
                estimate: Estimate::from_route(&assignment.route),
                base_reliability: DISPATCH_RELIABILITY,
            }];
        }

        let rejection = round.rejection_for(&load.id);
        if rejection == Some(RejectionReason::TruckCommitted) {
            return vec![self.hold_for_truck(load)];
        }
        let reason = rejection.map_or("no feasible truck", |r| r.as_str());
        let (reliability, minutes) = if issue.issue_type == IssueType::CapacityMismatch {
            (CAPACITY_ESCALATE_RELIABILITY, CAPACITY_ESCALATION_MINUTES)
        } else {
            (ESCALATE_RELIABILITY, ESCALATION_MINUTES)
        };
        vec![self.escalate(
            issue,
            reliability,
            minutes,
            &format!("Load {} cannot be dispatched: {reason}", load.id),
        )]
    }

    /// Every truck that could take the load is already dispatched this cycle.
    fn hold_for_truck(&self, load: &Load) -> Candidate {
        Candidate {
            kind: "WAIT",
            name: "Hold for a free truck".to_string(),
            description: format!(
                "Feasible trucks for {} load {} are dispatched this cycle; reassess next cycle",
                load.priority, load.id
            ),
            action: Action::Wait {
                truck_id: None,
                duration_minutes: HOLD_FOR_TRUCK_MINUTES,
            },
            estimate: Estimate {
                cost: self.optimizer.cost_of(0.0, HOLD_FOR_TRUCK_MINUTES),
                time_min: HOLD_FOR_TRUCK_MINUTES,
                ..Estimate::default()
            },
            base_reliability: HOLD_FOR_TRUCK_RELIABILITY,
        }
    }

    fn escalate(&self, issue: &Issue, base_reliability: f64, minutes: f64, reason: &str) -> Candidate {
        Candidate {
            kind: "ESCALATE",
            name: "Escalate to operator".to_string(),
            description: format!("{reason} ({})", issue.description),
            action: Action::Escalate {
                reason: reason.to_string(),
            },
            estimate: Estimate {
                time_min: minutes,
                ..Estimate::default()
            },
            base_reliability,
        }
    }
}
