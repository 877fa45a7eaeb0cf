//! Action executor.
//!
//! The only writer of fleet records during a cycle. Each decision is applied
//! to a staged copy of the state, validated against the capacity and
//! assignment invariants, and committed whole or not at all. Applied
//! mutations keep a pre-image so they can be rolled back later.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Action, ActionResult, ActionStatus, ActionType, Decision, EntityRef, FleetState, Load,
    LoadStatus, PreImage, Route, Stop, Truck, TruckStatus,
};

use super::route_optimizer::RouteOptimizer;

/// Applies decisions to the cycle's fleet state.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    optimizer: RouteOptimizer,
    touched: HashSet<EntityRef>,
}

impl ActionExecutor {
    pub fn new(optimizer: RouteOptimizer) -> Self {
        Self {
            optimizer,
            touched: HashSet::new(),
        }
    }

    /// Forget entities mutated in the previous cycle.
    pub fn begin_cycle(&mut self) {
        self.touched.clear();
    }

    /// Execute one decision against `state`.
    pub fn execute(&mut self, state: &mut FleetState, decision: &Decision, now: DateTime<Utc>) -> ActionResult {
        let Some(action) = decision.scenario.primary_action() else {
            return result(decision, ActionType::Escalate, ActionStatus::Failed, "Scenario has no actions", None, now);
        };
        let action_type = action.action_type();

        if !decision.approval.is_executable() {
            return result(
                decision,
                action_type,
                ActionStatus::Deferred,
                format!("Awaiting approval ({})", decision.approval.as_str()),
                None,
                now,
            );
        }

        let touched = action.touched_entities();
        if let Some(conflict) = touched.iter().find(|e| self.touched.contains(e)) {
            warn!(decision_id = %decision.id, entity = ?conflict, "decision deferred on entity conflict");
            return result(
                decision,
                action_type,
                ActionStatus::Deferred,
                format!("conflict: {conflict:?} already mutated this cycle"),
                None,
                now,
            );
        }

        if !action_type.mutates_fleet() {
            info!(decision_id = %decision.id, action = %action_type, "action recorded");
            return result(decision, action_type, ActionStatus::Recorded, describe(action), None, now);
        }

        let mut staged = state.clone();
        let applied = self
            .apply(&mut staged, action, decision, now)
            .and_then(|pre_image| validate(&staged, &touched).map(|()| pre_image));

        match applied {
            Ok(pre_image) => {
                *state = staged;
                self.touched.extend(touched);
                info!(decision_id = %decision.id, action = %action_type, "action applied");
                result(decision, action_type, ActionStatus::Applied, describe(action), Some(pre_image), now)
            }
            Err(err) => {
                let status = if err.is_invariant_violation() {
                    ActionStatus::Rejected
                } else {
                    ActionStatus::Failed
                };
                warn!(decision_id = %decision.id, action = %action_type, error = %err, status = status.as_str(), "action not applied");
                result(decision, action_type, status, err.to_string(), None, now)
            }
        }
    }

    /// Restore the records captured before an applied action.
    pub fn rollback(&mut self, state: &mut FleetState, applied: &ActionResult, now: DateTime<Utc>) -> DomainResult<ActionResult> {
        let pre_image = match (&applied.pre_image, applied.rollback_possible, applied.status) {
            (Some(pre_image), true, ActionStatus::Applied) => pre_image,
            _ => {
                return Err(DomainError::ExecutionFailed(format!(
                    "decision {} has no applied mutation to roll back",
                    applied.decision_id
                )))
            }
        };

        for route_id in &pre_image.created_route_ids {
            state.routes.remove(route_id);
        }
        for route in &pre_image.routes {
            state.routes.insert(route.id.clone(), route.clone());
        }
        for truck in &pre_image.trucks {
            state.trucks.insert(truck.id.clone(), truck.clone());
        }
        for load in &pre_image.loads {
            state.loads.insert(load.id.clone(), load.clone());
        }

        info!(decision_id = %applied.decision_id, "action rolled back");
        Ok(ActionResult {
            decision_id: applied.decision_id,
            action_type: applied.action_type,
            status: ActionStatus::RolledBack,
            success: true,
            message: format!("Rolled back {}", applied.action_type),
            rollback_possible: false,
            pre_image: None,
            executed_at: now,
        })
    }

    fn apply(
        &self,
        state: &mut FleetState,
        action: &Action,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> DomainResult<PreImage> {
        match action {
            Action::Reroute { truck_id, stops } => {
                let mut pre_image = PreImage::default();
                let truck = dispatchable_truck(state, truck_id)?;
                pre_image.trucks.push(truck.clone());
                self.replace_route(state, &mut pre_image, truck_id, stops.clone(), decision, now)?;
                Ok(pre_image)
            }
            Action::Reassign {
                load_id,
                from_truck_id,
                to_truck_id,
                ..
            } => self.reassign(state, load_id, from_truck_id.as_deref(), to_truck_id, decision, now),
            Action::Dispatch {
                truck_id,
                load_id,
                stops,
                ..
            } => self.dispatch(state, truck_id, load_id, stops, decision, now),
            Action::Wait { .. } | Action::Notify { .. } | Action::Escalate { .. } => Ok(PreImage::default()),
        }
    }

    fn reassign(
        &self,
        state: &mut FleetState,
        load_id: &str,
        expected_from: Option<&str>,
        to_truck_id: &str,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> DomainResult<PreImage> {
        let load = state
            .loads
            .get(load_id)
            .cloned()
            .ok_or_else(|| DomainError::LoadNotFound(load_id.to_string()))?;
        if matches!(load.status, LoadStatus::Delivered | LoadStatus::Cancelled) {
            return Err(DomainError::InvalidStateTransition {
                from: load.status.as_str().to_string(),
                to: LoadStatus::Assigned.as_str().to_string(),
                reason: format!("load {load_id} is closed"),
            });
        }
        if load.assigned_truck_id.as_deref() != expected_from {
            return Err(DomainError::ConflictingMutation {
                entity: "load".to_string(),
                id: load_id.to_string(),
            });
        }
        let target = dispatchable_truck(state, to_truck_id)?.clone();

        let mut pre_image = PreImage::default();
        pre_image.loads.push(load.clone());
        pre_image.trucks.push(target.clone());

        // Detach from the previous truck and its route.
        if let Some(from_id) = load.assigned_truck_id.as_deref() {
            if let Some(from) = state.trucks.get_mut(from_id) {
                pre_image.trucks.push(from.clone());
                from.assigned_load_ids.retain(|id| id != load_id);
                if let Some(route_id) = from.route_id.clone() {
                    if let Some(route) = state.routes.get_mut(&route_id) {
                        pre_image.routes.push(route.clone());
                        route.stops.retain(|s| s.load_id.as_deref() != Some(load_id));
                    }
                }
            }
        }

        let mut moved = load.clone();
        if moved.status == LoadStatus::PickedUp {
            // Cargo is handed over where the old truck stands.
            if let Some(from) = load.assigned_truck_id.as_deref().and_then(|id| state.trucks.get(id)) {
                moved.pickup = from.location;
                moved.pickup_window = None;
            }
        }
        let mut stops = route_stops(state, &target);
        stops.extend(moved.stops());

        if let Some(entry) = state.loads.get_mut(load_id) {
            entry.assigned_truck_id = Some(to_truck_id.to_string());
            if entry.status == LoadStatus::Unassigned {
                entry.status = LoadStatus::Assigned;
            }
        }
        if let Some(truck) = state.trucks.get_mut(to_truck_id) {
            truck.assigned_load_ids.push(load_id.to_string());
            if truck.status == TruckStatus::Idle {
                truck.status = TruckStatus::EnRoute;
            }
        }

        let optimized = self
            .optimizer
            .optimize(&target, &stops, &state.traffic, now)
            .ordered_stops;
        self.replace_route(state, &mut pre_image, to_truck_id, optimized, decision, now)?;
        Ok(pre_image)
    }

    fn dispatch(
        &self,
        state: &mut FleetState,
        truck_id: &str,
        load_id: &str,
        stops: &[Stop],
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> DomainResult<PreImage> {
        let load = state
            .loads
            .get(load_id)
            .cloned()
            .ok_or_else(|| DomainError::LoadNotFound(load_id.to_string()))?;
        if load.status != LoadStatus::Unassigned {
            return Err(DomainError::InvalidStateTransition {
                from: load.status.as_str().to_string(),
                to: LoadStatus::Assigned.as_str().to_string(),
                reason: format!("load {load_id} is not awaiting dispatch"),
            });
        }
        let truck = dispatchable_truck(state, truck_id)?.clone();
        // A plan made before the truck's route last changed would drop stops.
        let dropped = route_stops(state, &truck)
            .into_iter()
            .any(|planned| !stops.iter().any(|s| s.id == planned.id));
        if dropped {
            return Err(DomainError::ConflictingMutation {
                entity: "route".to_string(),
                id: truck.route_id.clone().unwrap_or_default(),
            });
        }

        let mut pre_image = PreImage::default();
        pre_image.loads.push(load);
        pre_image.trucks.push(truck);

        if let Some(entry) = state.loads.get_mut(load_id) {
            entry.status = LoadStatus::Assigned;
            entry.assigned_truck_id = Some(truck_id.to_string());
        }
        if let Some(entry) = state.trucks.get_mut(truck_id) {
            entry.assigned_load_ids.push(load_id.to_string());
            entry.status = TruckStatus::EnRoute;
        }

        self.replace_route(state, &mut pre_image, truck_id, stops.to_vec(), decision, now)?;
        Ok(pre_image)
    }

    /// Swap the truck's active route for one over `stops`.
    fn replace_route(
        &self,
        state: &mut FleetState,
        pre_image: &mut PreImage,
        truck_id: &str,
        stops: Vec<Stop>,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let truck = state
            .trucks
            .get(truck_id)
            .cloned()
            .ok_or_else(|| DomainError::TruckNotFound(truck_id.to_string()))?;

        if let Some(old_id) = truck.route_id.as_deref() {
            if let Some(old) = state.routes.remove(old_id) {
                if !pre_image.routes.iter().any(|r| r.id == old.id) {
                    pre_image.routes.push(old);
                }
            }
        }

        let estimate = self.optimizer.evaluate(&truck, &stops, &state.traffic, now);
        let route_id = format!("RT-{}-{}", truck_id, decision.id.simple());
        state.routes.insert(
            route_id.clone(),
            Route {
                id: route_id.clone(),
                truck_id: truck_id.to_string(),
                stops,
                distance_km: estimate.distance_km,
                duration_min: estimate.duration_min,
                fuel_l: estimate.fuel_l,
                created_at: now,
                started_at: Some(now),
                progress: Vec::new(),
            },
        );
        pre_image.created_route_ids.push(route_id.clone());

        if let Some(entry) = state.trucks.get_mut(truck_id) {
            entry.route_id = Some(route_id.clone());
        }
        for load in state.loads.values_mut() {
            if load.assigned_truck_id.as_deref() == Some(truck_id) && load.route_id.as_deref() != Some(&route_id) {
                if !pre_image.loads.iter().any(|l| l.id == load.id) {
                    pre_image.loads.push(load.clone());
                }
                load.route_id = Some(route_id.clone());
            }
        }
        Ok(())
    }
}

fn dispatchable_truck<'a>(state: &'a FleetState, truck_id: &str) -> DomainResult<&'a Truck> {
    let truck = state
        .trucks
        .get(truck_id)
        .ok_or_else(|| DomainError::TruckNotFound(truck_id.to_string()))?;
    if truck.status == TruckStatus::Maintenance {
        return Err(DomainError::InconsistentAssignment {
            load_id: String::new(),
            reason: format!("truck {truck_id} is in maintenance"),
        });
    }
    Ok(truck)
}

fn route_stops(state: &FleetState, truck: &Truck) -> Vec<Stop> {
    truck
        .route_id
        .as_deref()
        .and_then(|id| state.routes.get(id))
        .map(Route::remaining_stops)
        .unwrap_or_default()
}

/// Capacity of touched trucks, then every load/truck reference.
fn validate(state: &FleetState, touched: &[EntityRef]) -> DomainResult<()> {
    for entity in touched {
        if let EntityRef::Truck(id) = entity {
            let Some(truck) = state.trucks.get(id) else { continue };
            let committed = state.committed_weight_kg(id);
            if committed > truck.capacity_kg + f64::EPSILON {
                return Err(DomainError::CapacityExceeded {
                    truck_id: id.clone(),
                    committed_kg: committed,
                    capacity_kg: truck.capacity_kg,
                });
            }
        }
    }

    for load in state.loads.values() {
        let holder_agrees = match load.assigned_truck_id.as_deref() {
            Some(truck_id) if load.status.requires_truck() => state
                .trucks
                .get(truck_id)
                .is_some_and(|t| t.assigned_load_ids.iter().any(|id| id == &load.id)),
            _ => true,
        };
        if !holder_agrees {
            return Err(inconsistent(load, "truck does not list the load"));
        }
    }

    state
        .check_invariants()
        .map_err(|reason| DomainError::InconsistentAssignment {
            load_id: String::new(),
            reason,
        })
}

fn inconsistent(load: &Load, reason: &str) -> DomainError {
    DomainError::InconsistentAssignment {
        load_id: load.id.clone(),
        reason: reason.to_string(),
    }
}

fn describe(action: &Action) -> String {
    match action {
        Action::Reroute { truck_id, stops } => format!("Rerouted {truck_id} over {} stops", stops.len()),
        Action::Reassign {
            load_id, to_truck_id, ..
        } => format!("Reassigned {load_id} to {to_truck_id}"),
        Action::Dispatch { truck_id, load_id, .. } => format!("Dispatched {truck_id} for {load_id}"),
        Action::Wait {
            truck_id,
            duration_minutes,
        } => match truck_id {
            Some(id) => format!("Holding {id} for {duration_minutes:.0} min"),
            None => format!("Monitoring for {duration_minutes:.0} min"),
        },
        Action::Notify { recipient, message } => format!("Notified {recipient}: {message}"),
        Action::Escalate { reason } => format!("Escalated: {reason}"),
    }
}

fn result(
    decision: &Decision,
    action_type: ActionType,
    status: ActionStatus,
    message: impl Into<String>,
    pre_image: Option<PreImage>,
    now: DateTime<Utc>,
) -> ActionResult {
    ActionResult {
        decision_id: decision.id,
        action_type,
        status,
        success: matches!(status, ActionStatus::Applied | ActionStatus::Recorded),
        message: message.into(),
        rollback_possible: pre_image.is_some(),
        pre_image,
        executed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        ApprovalState, FleetSnapshot, LoadPriority, Location, RoutingConfig, Scenario,
    };
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn executor() -> ActionExecutor {
        ActionExecutor::new(RouteOptimizer::new(RoutingConfig::default()))
    }

    fn decision(action: Action) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            issue_id: "I1".into(),
            scenario: Scenario {
                id: "SCEN-I1-X".into(),
                issue_id: "I1".into(),
                name: "x".into(),
                description: String::new(),
                actions: vec![action],
                estimated_cost: 10.0,
                estimated_time_min: 10.0,
                estimated_fuel_l: 1.0,
                reliability: 0.9,
                feasibility_violated: false,
                sequence: 0,
            },
            score: 0.8,
            confidence: 0.9,
            rationale: String::new(),
            requires_oracle_verification: false,
            requires_human_approval: false,
            approval: ApprovalState::NotRequired,
            approval_reason: None,
            created_at: now(),
        }
    }

    /// T1 carries L1 (400 kg); T2 idle with 500 kg capacity; L2 (300 kg) unassigned.
    fn state() -> FleetState {
        let mut t1 = Truck::new("T1", Location::new(0.0, 0.0), 1000.0, now());
        t1.status = TruckStatus::Stuck;
        t1.assigned_load_ids = vec!["L1".into()];
        let t2 = Truck::new("T2", Location::new(0.01, 0.0), 500.0, now());

        let mut l1 = Load::new("L1", 400.0, LoadPriority::Normal, Location::new(0.0, 0.0), Location::new(0.1, 0.0));
        l1.status = LoadStatus::Assigned;
        l1.assigned_truck_id = Some("T1".into());
        let l2 = Load::new("L2", 300.0, LoadPriority::High, Location::new(0.02, 0.0), Location::new(0.1, 0.0));

        FleetState::from_snapshot(&FleetSnapshot {
            taken_at: now(),
            trucks: vec![t1, t2],
            loads: vec![l1, l2],
            ..Default::default()
        })
    }

    fn reassign_l1() -> Action {
        Action::Reassign {
            load_id: "L1".into(),
            from_truck_id: Some("T1".into()),
            to_truck_id: "T2".into(),
            load_priority: LoadPriority::Normal,
        }
    }

    #[test]
    fn test_reassign_moves_load_and_records_pre_image() {
        let mut state = state();
        let mut exec = executor();
        let result = exec.execute(&mut state, &decision(reassign_l1()), now());

        assert_eq!(result.status, ActionStatus::Applied);
        assert!(result.rollback_possible);
        assert_eq!(state.loads["L1"].assigned_truck_id.as_deref(), Some("T2"));
        assert!(state.trucks["T1"].assigned_load_ids.is_empty());
        assert_eq!(state.trucks["T2"].assigned_load_ids, vec!["L1".to_string()]);
        assert_eq!(state.trucks["T2"].status, TruckStatus::EnRoute);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_rollback_restores_pre_image() {
        let original = state();
        let mut state = original.clone();
        let mut exec = executor();
        let applied = exec.execute(&mut state, &decision(reassign_l1()), now());

        let rolled = exec.rollback(&mut state, &applied, now()).unwrap();
        assert_eq!(rolled.status, ActionStatus::RolledBack);
        assert_eq!(state, original);
        assert!(exec.rollback(&mut state, &rolled, now()).is_err());
    }

    #[test]
    fn test_capacity_violation_is_rejected_without_mutation() {
        let mut state = state();
        let before = state.clone();
        let mut exec = executor();

        // L2 to T2 first, then L1 would push T2 to 700 kg of 500.
        let dispatch = Action::Dispatch {
            truck_id: "T2".into(),
            load_id: "L2".into(),
            stops: vec![],
            load_priority: LoadPriority::High,
        };
        assert_eq!(exec.execute(&mut state, &decision(dispatch), now()).status, ActionStatus::Applied);
        exec.begin_cycle();
        let after_dispatch = state.clone();

        let result = exec.execute(&mut state, &decision(reassign_l1()), now());
        assert_eq!(result.status, ActionStatus::Rejected);
        assert!(!result.success);
        assert!(result.message.contains("capacity"));
        assert_eq!(state, after_dispatch);
        assert_ne!(state, before);
    }

    #[test]
    fn test_second_mutation_of_entity_is_deferred() {
        let mut state = state();
        let mut exec = executor();
        assert_eq!(exec.execute(&mut state, &decision(reassign_l1()), now()).status, ActionStatus::Applied);

        let reroute = Action::Reroute {
            truck_id: "T2".into(),
            stops: vec![],
        };
        let result = exec.execute(&mut state, &decision(reroute), now());
        assert_eq!(result.status, ActionStatus::Deferred);
        assert!(result.message.starts_with("conflict"));
    }

    #[test]
    fn test_pending_decision_is_deferred() {
        let mut state = state();
        let mut d = decision(reassign_l1());
        d.approval = ApprovalState::Pending;
        let result = executor().execute(&mut state, &d, now());
        assert_eq!(result.status, ActionStatus::Deferred);
        assert_eq!(state.loads["L1"].assigned_truck_id.as_deref(), Some("T1"));
    }

    #[test]
    fn test_maintenance_truck_rejected() {
        let mut state = state();
        state.trucks.get_mut("T2").unwrap().status = TruckStatus::Maintenance;
        let result = executor().execute(&mut state, &decision(reassign_l1()), now());
        assert_eq!(result.status, ActionStatus::Rejected);
    }

    #[test]
    fn test_missing_truck_fails() {
        let mut state = state();
        let reroute = Action::Reroute {
            truck_id: "T9".into(),
            stops: vec![],
        };
        let result = executor().execute(&mut state, &decision(reroute), now());
        assert_eq!(result.status, ActionStatus::Failed);
    }

    #[test]
    fn test_notify_records_without_mutation() {
        let mut state = state();
        let before = state.clone();
        let notify = Action::Notify {
            recipient: "customer".into(),
            message: "late".into(),
        };
        let result = executor().execute(&mut state, &decision(notify), now());
        assert_eq!(result.status, ActionStatus::Recorded);
        assert!(result.success);
        assert!(!result.rollback_possible);
        assert_eq!(state, before);
    }

    #[test]
    fn test_rebuilt_route_is_priced_with_observed_traffic() {
        let stops = vec![
            Stop::waypoint("P1", Location::new(0.05, 0.0)),
            Stop::waypoint("P2", Location::new(0.1, 0.0)),
        ];
        let reroute = || Action::Reroute {
            truck_id: "T2".into(),
            stops: stops.clone(),
        };

        let mut clear = state();
        executor().execute(&mut clear, &decision(reroute()), now());
        let mut jammed = state();
        jammed
            .traffic
            .insert(crate::domain::models::segment_key("T2", "P1"), crate::domain::models::TrafficLevel::Standstill);
        executor().execute(&mut jammed, &decision(reroute()), now());

        let duration = |state: &FleetState| {
            let route_id = state.trucks["T2"].route_id.clone().unwrap();
            state.routes[&route_id].duration_min
        };
        assert!(duration(&jammed) > duration(&clear));
    }

    #[test]
    fn test_dispatch_that_would_drop_planned_stops_fails() {
        let mut state = state();
        let mut exec = executor();
        let first = Action::Reroute {
            truck_id: "T2".into(),
            stops: vec![Stop::waypoint("P1", Location::new(0.05, 0.0))],
        };
        assert_eq!(exec.execute(&mut state, &decision(first), now()).status, ActionStatus::Applied);
        exec.begin_cycle();

        let stale = Action::Dispatch {
            truck_id: "T2".into(),
            load_id: "L2".into(),
            stops: state.loads["L2"].stops().to_vec(),
            load_priority: LoadPriority::High,
        };
        let result = exec.execute(&mut state, &decision(stale), now());
        assert_eq!(result.status, ActionStatus::Failed);
        assert_eq!(state.loads["L2"].status, LoadStatus::Unassigned);
    }
}
