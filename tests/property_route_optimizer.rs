//! Property tests for the nearest-neighbor plus 2-opt route optimizer.

mod common;

use fleet_loop::domain::models::{
    segment_key, Location, RoutingConfig, Stop, TrafficIndex, TrafficLevel,
};
use fleet_loop::services::{OptimizationOutcome, RouteOptimizer};
use proptest::prelude::*;

use common::{now, truck};

fn stops_from(points: &[(f64, f64)]) -> Vec<Stop> {
    points
        .iter()
        .enumerate()
        .map(|(i, (lat, lon))| Stop::waypoint(format!("S{i}"), Location::new(52.0 + lat, 4.0 + lon)))
        .collect()
}

fn points() -> impl Strategy<Value = Vec<(f64, f64)>> {
    prop::collection::vec((-0.5f64..0.5, -0.5f64..0.5), 1..9)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the optimized tour is never longer than visiting stops in input order
    #[test]
    fn prop_never_worse_than_input_order(points in points()) {
        let optimizer = RouteOptimizer::new(RoutingConfig::default());
        let depot = truck("T1", 52.0, 4.0, 1000.0);
        let stops = stops_from(&points);
        let traffic = TrafficIndex::new();

        let naive = optimizer.evaluate(&depot, &stops, &traffic, now());
        let optimized = optimizer.optimize(&depot, &stops, &traffic, now());

        prop_assert!(optimized.distance_km <= naive.distance_km + 1e-6);
        prop_assert_eq!(optimized.ordered_stops.len(), stops.len());
        if optimized.outcome == OptimizationOutcome::NoImprovement {
            prop_assert_eq!(optimized.stop_ids(), naive.stop_ids());
        }
    }

    /// Property: identical inputs give identical tours
    #[test]
    fn prop_optimizer_is_deterministic(points in points(), congested in 0usize..8) {
        let optimizer = RouteOptimizer::new(RoutingConfig::default());
        let depot = truck("T1", 52.0, 4.0, 1000.0);
        let stops = stops_from(&points);
        let mut traffic = TrafficIndex::new();
        if congested + 1 < stops.len() {
            traffic.insert(
                segment_key(&stops[congested].id, &stops[congested + 1].id),
                TrafficLevel::Standstill,
            );
        }

        let first = optimizer.optimize(&depot, &stops, &traffic, now());
        let second = optimizer.optimize(&depot, &stops, &traffic, now());
        prop_assert_eq!(first, second);
    }

    /// Property: a smaller iteration budget never searches past its limit
    #[test]
    fn prop_iteration_budget_respected(points in points(), budget in 0u32..20) {
        let optimizer = RouteOptimizer::new(RoutingConfig {
            two_opt_iteration_budget: budget,
            ..RoutingConfig::default()
        });
        let route = optimizer.optimize(&truck("T1", 52.0, 4.0, 1000.0), &stops_from(&points), &TrafficIndex::new(), now());
        prop_assert!(route.iterations <= budget);
    }
}
