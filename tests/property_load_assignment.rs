//! Property tests for the greedy load assignment engine.

mod common;

use std::collections::HashMap;

use fleet_loop::domain::models::{AssignmentConfig, LoadPriority, RoutingConfig};
use fleet_loop::services::{LoadAssignmentEngine, RejectionReason, RouteOptimizer};
use proptest::prelude::*;

use common::{load, snapshot, truck};

fn engine() -> LoadAssignmentEngine {
    LoadAssignmentEngine::new(
        RouteOptimizer::new(RoutingConfig::default()),
        AssignmentConfig::default(),
    )
}

fn priority() -> impl Strategy<Value = LoadPriority> {
    prop_oneof![
        Just(LoadPriority::Low),
        Just(LoadPriority::Normal),
        Just(LoadPriority::High),
        Just(LoadPriority::Urgent),
        Just(LoadPriority::Critical),
    ]
}

/// (latitude offset, longitude offset) near the depot at 52.0, 4.0.
fn offset() -> impl Strategy<Value = (f64, f64)> {
    (-0.3f64..0.3, -0.3f64..0.3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: no truck ever carries more than its capacity
    #[test]
    fn prop_capacity_never_exceeded(
        trucks in prop::collection::vec((offset(), 200.0f64..2000.0), 1..4),
        loads in prop::collection::vec((offset(), 50.0f64..900.0, priority()), 1..7),
    ) {
        let trucks: Vec<_> = trucks
            .into_iter()
            .enumerate()
            .map(|(i, ((dlat, dlon), cap))| truck(&format!("T{i}"), 52.0 + dlat, 4.0 + dlon, cap))
            .collect();
        let loads: Vec<_> = loads
            .into_iter()
            .enumerate()
            .map(|(i, ((dlat, dlon), weight, p))| load(&format!("L{i}"), weight, p, 52.0 + dlat, 4.0 + dlon))
            .collect();
        let fleet = snapshot(trucks.clone(), loads.clone());

        let outcome = engine().assign(&loads, &trucks, &fleet);

        let mut carried: HashMap<&str, f64> = HashMap::new();
        for a in &outcome.assignments {
            *carried.entry(a.truck_id.as_str()).or_default() += a.weight_kg;
        }
        for t in &trucks {
            let total = carried.get(t.id.as_str()).copied().unwrap_or(0.0);
            prop_assert!(total <= t.capacity_kg + 1e-9, "truck {} carries {} of {}", t.id, total, t.capacity_kg);
        }
        prop_assert_eq!(outcome.assignments.len() + outcome.unassignable.len(), loads.len());
    }

    /// Property: identical inputs give identical matchings and costs
    #[test]
    fn prop_assignment_is_deterministic(
        trucks in prop::collection::vec((offset(), 300.0f64..1500.0), 1..4),
        loads in prop::collection::vec((offset(), 50.0f64..600.0, priority()), 1..6),
    ) {
        let trucks: Vec<_> = trucks
            .into_iter()
            .enumerate()
            .map(|(i, ((dlat, dlon), cap))| truck(&format!("T{i}"), 52.0 + dlat, 4.0 + dlon, cap))
            .collect();
        let loads: Vec<_> = loads
            .into_iter()
            .enumerate()
            .map(|(i, ((dlat, dlon), weight, p))| load(&format!("L{i}"), weight, p, 52.0 + dlat, 4.0 + dlon))
            .collect();
        let fleet = snapshot(trucks.clone(), loads.clone());

        let first = engine().assign(&loads, &trucks, &fleet);
        let second = engine().assign(&loads, &trucks, &fleet);
        prop_assert_eq!(first, second);
    }

    /// Property: a critical load is never squeezed out by a normal one
    #[test]
    fn prop_critical_load_takes_precedence(
        capacity in 500.0f64..1500.0,
        critical_share in 0.2f64..0.9,
        (dlat, dlon) in offset(),
    ) {
        let critical_kg = capacity * critical_share;
        let normal_kg = capacity - critical_kg + 1.0;
        let trucks = vec![truck("T1", 52.0, 4.0, capacity)];
        let loads = vec![
            load("A-normal", normal_kg, LoadPriority::Normal, 52.0 + dlat / 10.0, 4.0 + dlon / 10.0),
            load("B-critical", critical_kg, LoadPriority::Critical, 52.0 + dlat / 10.0, 4.0 + dlon / 10.0),
        ];
        let fleet = snapshot(trucks.clone(), loads.clone());

        let outcome = engine().assign(&loads, &trucks, &fleet);

        prop_assert!(outcome.assignment_for("B-critical").is_some());
        prop_assert_eq!(outcome.rejection_for("A-normal"), Some(RejectionReason::Capacity));
    }
}

#[test]
fn test_critical_and_heavy_normal_load_share_one_truck() {
    let trucks = vec![truck("T1", 52.0, 4.0, 1000.0)];
    let loads = vec![
        load("A", 200.0, LoadPriority::Critical, 52.01, 4.0),
        load("B", 900.0, LoadPriority::Normal, 52.02, 4.0),
    ];
    let fleet = snapshot(trucks.clone(), loads.clone());

    let outcome = engine().assign(&loads, &trucks, &fleet);

    assert_eq!(outcome.assignment_for("A").map(|a| a.truck_id.as_str()), Some("T1"));
    assert_eq!(outcome.rejection_for("B"), Some(RejectionReason::Capacity));
}
