//! Route optimizer.
//!
//! Orders a truck's stops starting from its current position. An initial
//! tour is the better of the given order and a nearest-neighbor tour; it is
//! then improved with 2-opt segment reversals under a fixed iteration budget.
//!
//! Tours are compared lexicographically by (window violations, traffic
//! weighted distance), so a reversal that breaks a feasible window is never
//! accepted and the result is never worse than the input order. The search
//! is fully deterministic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::{
    segment_key, RoutingConfig, Stop, StopKind, TrafficIndex, Truck,
};

const EPSILON: f64 = 1e-9;

/// Whether optimization changed the stop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationOutcome {
    /// A strictly better order was found.
    Improved,
    /// The input order was kept.
    NoImprovement,
}

/// One leg of an evaluated tour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    /// Truck id for the first leg, otherwise the previous stop id.
    pub from_id: String,
    pub to_id: String,
    /// Great-circle distance.
    pub distance_km: f64,
    /// Multiplier from the segment's traffic level, 1.0 when unobserved.
    pub traffic_factor: f64,
    /// Driving time with traffic applied.
    pub travel_min: f64,
    /// Arrival at `to_id`, after any wait for its window to open.
    pub arrival: DateTime<Utc>,
    /// Minutes spent waiting for the window to open.
    pub wait_min: f64,
    /// Arrived after the window closed.
    pub window_violated: bool,
}

/// Optimizer output with timing, fuel and cost estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedRoute {
    /// Stops in the chosen visiting order.
    pub ordered_stops: Vec<Stop>,
    /// One leg per stop, starting from the truck.
    pub legs: Vec<RouteLeg>,
    pub distance_km: f64,
    /// Distance with each leg scaled by its traffic factor; the objective.
    pub weighted_distance_km: f64,
    /// Driving, waiting and service time.
    pub duration_min: f64,
    pub fuel_l: f64,
    /// Fuel, driver and vehicle cost under the routing cost model.
    pub cost: f64,
    /// Legs arriving after their window closed.
    pub window_violations: usize,
    /// No ordering satisfying every window was found.
    pub feasibility_violated: bool,
    pub outcome: OptimizationOutcome,
    /// Candidate reversals evaluated.
    pub iterations: u32,
}

impl OptimizedRoute {
    /// Stop ids in visiting order.
    pub fn stop_ids(&self) -> Vec<&str> {
        self.ordered_stops.iter().map(|s| s.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct TourScore {
    violations: usize,
    weighted_km: f64,
}

impl TourScore {
    fn is_better_than(&self, other: &Self) -> bool {
        self.violations < other.violations
            || (self.violations == other.violations && self.weighted_km < other.weighted_km - EPSILON)
    }
}

/// Precomputed distances, traffic factors and window offsets for one call.
struct TourContext<'a> {
    stops: &'a [Stop],
    /// Node 0 is the truck; node `i + 1` is `stops[i]`.
    distance: Vec<Vec<f64>>,
    factor: Vec<Vec<f64>>,
    /// Window bounds as minutes after departure.
    windows: Vec<Option<(f64, f64)>>,
    /// For delivery stops, the index of the matching pickup stop.
    pickup_of: Vec<Option<usize>>,
    speed_kmh: f64,
    service_minutes: f64,
}

impl<'a> TourContext<'a> {
    fn new(
        config: &RoutingConfig,
        truck: &Truck,
        stops: &'a [Stop],
        traffic: &TrafficIndex,
        departure: DateTime<Utc>,
    ) -> Self {
        let mut ids = Vec::with_capacity(stops.len() + 1);
        let mut locations = Vec::with_capacity(stops.len() + 1);
        ids.push(truck.id.as_str());
        locations.push(truck.location);
        for stop in stops {
            ids.push(stop.id.as_str());
            locations.push(stop.location);
        }

        let n = locations.len();
        let mut distance = vec![vec![0.0; n]; n];
        let mut factor = vec![vec![1.0; n]; n];
        for from in 0..n {
            for to in 0..n {
                if from == to {
                    continue;
                }
                distance[from][to] = locations[from].distance_km(&locations[to]);
                factor[from][to] = traffic
                    .get(&segment_key(ids[from], ids[to]))
                    .map_or(1.0, |level| level.factor(config.standstill_factor));
            }
        }

        let to_minutes = |t: DateTime<Utc>| (t - departure).num_milliseconds() as f64 / 60_000.0;
        let windows = stops
            .iter()
            .map(|s| s.window.map(|w| (to_minutes(w.start), to_minutes(w.end))))
            .collect();

        let pickup_of = stops
            .iter()
            .map(|s| {
                if s.kind != StopKind::Delivery {
                    return None;
                }
                let load_id = s.load_id.as_deref()?;
                stops
                    .iter()
                    .position(|p| p.kind == StopKind::Pickup && p.load_id.as_deref() == Some(load_id))
            })
            .collect();

        Self {
            stops,
            distance,
            factor,
            windows,
            pickup_of,
            speed_kmh: config.average_speed_kmh.max(EPSILON),
            service_minutes: config.service_minutes,
        }
    }

    fn travel_minutes(&self, from: usize, to: usize) -> f64 {
        self.distance[from][to] / self.speed_kmh * 60.0 * self.factor[from][to]
    }

    fn score(&self, order: &[usize]) -> TourScore {
        let mut violations = 0;
        let mut weighted_km = 0.0;
        let mut clock = 0.0;
        let mut node = 0;
        let mut visited = vec![false; self.stops.len()];

        for &idx in order {
            let next = idx + 1;
            weighted_km += self.distance[node][next] * self.factor[node][next];
            let arrival = clock + self.travel_minutes(node, next);
            let mut start = arrival;
            if let Some((open, close)) = self.windows[idx] {
                start = arrival.max(open);
                if arrival > close + EPSILON {
                    violations += 1;
                }
            }
            if let Some(pickup) = self.pickup_of[idx] {
                if !visited[pickup] {
                    violations += 1;
                }
            }
            visited[idx] = true;
            clock = start + self.service_minutes;
            node = next;
        }

        TourScore {
            violations,
            weighted_km,
        }
    }

    /// Greedy tour from the truck, always taking the cheapest weighted edge.
    fn nearest_neighbor(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = (0..self.stops.len()).collect();
        let mut order = Vec::with_capacity(remaining.len());
        let mut node = 0;

        while !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_cost = f64::INFINITY;
            for (pos, &idx) in remaining.iter().enumerate() {
                let cost = self.distance[node][idx + 1] * self.factor[node][idx + 1];
                if cost < best_cost - EPSILON {
                    best_cost = cost;
                    best_pos = pos;
                }
            }
            let idx = remaining.remove(best_pos);
            order.push(idx);
            node = idx + 1;
        }

        order
    }
}

/// Stateless route optimizer parameterized by the routing cost model.
#[derive(Debug, Clone)]
pub struct RouteOptimizer {
    config: RoutingConfig,
}

impl RouteOptimizer {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// The cost model this optimizer prices with.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Improve the visiting order of `stops` for `truck`.
    ///
    /// Never fails: an infeasible stop set returns the best-effort order
    /// with `feasibility_violated` set.
    pub fn optimize(
        &self,
        truck: &Truck,
        stops: &[Stop],
        traffic: &TrafficIndex,
        departure: DateTime<Utc>,
    ) -> OptimizedRoute {
        let ctx = TourContext::new(&self.config, truck, stops, traffic, departure);
        let input: Vec<usize> = (0..stops.len()).collect();
        if stops.len() < 2 {
            return self.build(&ctx, truck, &input, departure, OptimizationOutcome::NoImprovement, 0);
        }

        let mut best = input.clone();
        let mut best_score = ctx.score(&best);

        let greedy = ctx.nearest_neighbor();
        let greedy_score = ctx.score(&greedy);
        if greedy_score.is_better_than(&best_score) {
            best = greedy;
            best_score = greedy_score;
        }

        let budget = self.config.two_opt_iteration_budget;
        let mut iterations = 0_u32;
        let n = best.len();
        let mut has_improvement = true;
        'search: while has_improvement {
            has_improvement = false;
            for i in 0..n - 1 {
                for j in (i + 1)..n {
                    if iterations >= budget {
                        break 'search;
                    }
                    iterations += 1;

                    let mut candidate = best.clone();
                    candidate[i..=j].reverse();
                    let score = ctx.score(&candidate);
                    if score.is_better_than(&best_score) {
                        best = candidate;
                        best_score = score;
                        has_improvement = true;
                    }
                }
            }
        }

        let outcome = if best == input {
            OptimizationOutcome::NoImprovement
        } else {
            OptimizationOutcome::Improved
        };
        tracing::debug!(
            truck_id = %truck.id,
            stops = stops.len(),
            iterations,
            violations = best_score.violations,
            outcome = ?outcome,
            "route optimized"
        );

        self.build(&ctx, truck, &best, departure, outcome, iterations)
    }

    /// Estimate the stops in the given order without reordering.
    pub fn evaluate(
        &self,
        truck: &Truck,
        stops: &[Stop],
        traffic: &TrafficIndex,
        departure: DateTime<Utc>,
    ) -> OptimizedRoute {
        let ctx = TourContext::new(&self.config, truck, stops, traffic, departure);
        let order: Vec<usize> = (0..stops.len()).collect();
        self.build(&ctx, truck, &order, departure, OptimizationOutcome::NoImprovement, 0)
    }

    /// Money cost of driving `distance_km` over `minutes`.
    pub fn cost_of(&self, distance_km: f64, minutes: f64) -> f64 {
        let fuel = distance_km * self.config.fuel_l_per_km;
        let hourly = self.config.driver_cost_per_hour + self.config.vehicle_cost_per_hour;
        fuel * self.config.fuel_price_per_l + minutes / 60.0 * hourly
    }

    /// Free-flow travel minutes for a distance.
    pub fn travel_minutes(&self, distance_km: f64) -> f64 {
        distance_km / self.config.average_speed_kmh.max(EPSILON) * 60.0
    }

    fn build(
        &self,
        ctx: &TourContext<'_>,
        truck: &Truck,
        order: &[usize],
        departure: DateTime<Utc>,
        outcome: OptimizationOutcome,
        iterations: u32,
    ) -> OptimizedRoute {
        let score = ctx.score(order);
        let mut legs = Vec::with_capacity(order.len());
        let mut clock = 0.0;
        let mut node = 0;
        let mut from_id = truck.id.clone();
        let mut distance_km = 0.0;

        for &idx in order {
            let next = idx + 1;
            let stop = &ctx.stops[idx];
            let travel = ctx.travel_minutes(node, next);
            let arrival = clock + travel;
            let (wait, violated) = match ctx.windows[idx] {
                Some((open, close)) => ((open - arrival).max(0.0), arrival > close + EPSILON),
                None => (0.0, false),
            };
            distance_km += ctx.distance[node][next];
            legs.push(RouteLeg {
                from_id: from_id.clone(),
                to_id: stop.id.clone(),
                distance_km: ctx.distance[node][next],
                traffic_factor: ctx.factor[node][next],
                travel_min: travel,
                arrival: departure + Duration::milliseconds((arrival * 60_000.0) as i64),
                wait_min: wait,
                window_violated: violated,
            });
            clock = arrival + wait + ctx.service_minutes;
            node = next;
            from_id.clone_from(&stop.id);
        }

        let fuel_l = distance_km * self.config.fuel_l_per_km;
        OptimizedRoute {
            ordered_stops: order.iter().map(|&i| ctx.stops[i].clone()).collect(),
            legs,
            distance_km,
            weighted_distance_km: score.weighted_km,
            duration_min: clock,
            fuel_l,
            cost: self.cost_of(distance_km, clock),
            window_violations: score.violations,
            feasibility_violated: score.violations > 0,
            outcome,
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        LoadPriority, Load, Location, TimeWindow, TrafficLevel,
    };

    fn departure() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn truck() -> Truck {
        Truck::new("T1", Location::new(0.0, 0.0), 1000.0, departure())
    }

    fn line_stops() -> Vec<Stop> {
        vec![
            Stop::waypoint("P1", Location::new(0.1, 0.0)),
            Stop::waypoint("P2", Location::new(0.2, 0.0)),
            Stop::waypoint("P3", Location::new(0.3, 0.0)),
        ]
    }

    fn optimizer() -> RouteOptimizer {
        RouteOptimizer::new(RoutingConfig::default())
    }

    #[test]
    fn test_free_flow_keeps_optimal_input_order() {
        let route = optimizer().optimize(&truck(), &line_stops(), &TrafficIndex::new(), departure());
        assert_eq!(route.stop_ids(), vec!["P1", "P2", "P3"]);
        assert_eq!(route.outcome, OptimizationOutcome::NoImprovement);
        assert!(!route.feasibility_violated);
        assert!((route.distance_km - 3.0 * 11.1195).abs() < 0.01);
    }

    #[test]
    fn test_reverse_input_is_improved() {
        let mut stops = line_stops();
        stops.reverse();
        let opt = optimizer();
        let naive = opt.evaluate(&truck(), &stops, &TrafficIndex::new(), departure());
        let route = opt.optimize(&truck(), &stops, &TrafficIndex::new(), departure());

        assert_eq!(route.stop_ids(), vec!["P1", "P2", "P3"]);
        assert_eq!(route.outcome, OptimizationOutcome::Improved);
        assert!(route.distance_km < naive.distance_km);
    }

    #[test]
    fn test_standstill_segment_triggers_reordering() {
        let mut traffic = TrafficIndex::new();
        traffic.insert(segment_key("P1", "P2"), TrafficLevel::Standstill);
        let opt = optimizer();
        let naive = opt.evaluate(&truck(), &line_stops(), &traffic, departure());
        let route = opt.optimize(&truck(), &line_stops(), &traffic, departure());

        assert_eq!(route.outcome, OptimizationOutcome::Improved);
        assert_ne!(route.stop_ids(), vec!["P1", "P2", "P3"]);
        assert!(route.weighted_distance_km < naive.weighted_distance_km);
        assert!(!route.feasibility_violated);
    }

    #[test]
    fn test_standstill_without_feasible_alternative_keeps_order() {
        let start = departure();
        let mut stops = line_stops();
        // P1 must be first; P2 only reachable in time directly after P1
        stops[0].window = Some(TimeWindow::new(start, start + Duration::minutes(13)));
        stops[1].window = Some(TimeWindow::new(start, start + Duration::minutes(62)));

        let mut traffic = TrafficIndex::new();
        traffic.insert(segment_key("P1", "P2"), TrafficLevel::Standstill);
        let route = optimizer().optimize(&truck(), &stops, &traffic, start);

        assert_eq!(route.stop_ids(), vec!["P1", "P2", "P3"]);
        assert_eq!(route.outcome, OptimizationOutcome::NoImprovement);
        assert!(!route.feasibility_violated);
    }

    #[test]
    fn test_infeasible_windows_are_flagged_not_raised() {
        let start = departure();
        let mut stops = line_stops();
        // Nothing can reach P3 within five minutes
        stops[2].window = Some(TimeWindow::new(start, start + Duration::minutes(5)));

        let route = optimizer().optimize(&truck(), &stops, &TrafficIndex::new(), start);
        assert!(route.feasibility_violated);
        assert_eq!(route.window_violations, 1);
        assert_eq!(route.ordered_stops.len(), 3);
    }

    #[test]
    fn test_early_arrival_waits_for_window() {
        let start = departure();
        let stops = vec![Stop::waypoint("P1", Location::new(0.1, 0.0))
            .with_window(TimeWindow::new(start + Duration::minutes(60), start + Duration::minutes(90)))];

        let route = optimizer().optimize(&truck(), &stops, &TrafficIndex::new(), start);
        let leg = &route.legs[0];
        assert!((leg.wait_min - (60.0 - leg.travel_min)).abs() < 1e-6);
        assert!((route.duration_min - 75.0).abs() < 1e-6);
    }

    #[test]
    fn test_pickup_precedes_delivery() {
        let load = Load::new(
            "L1",
            100.0,
            LoadPriority::Normal,
            Location::new(0.3, 0.0),
            Location::new(0.1, 0.0),
        );
        let stops = load.stops().to_vec();
        let route = optimizer().optimize(&truck(), &stops, &TrafficIndex::new(), departure());

        // Nearest-first would visit the delivery first
        assert_eq!(route.stop_ids(), vec!["L1-pickup", "L1-delivery"]);
        assert!(!route.feasibility_violated);
    }

    #[test]
    fn test_iteration_budget_bounds_search() {
        let config = RoutingConfig {
            two_opt_iteration_budget: 2,
            ..Default::default()
        };
        let mut stops = line_stops();
        stops.reverse();
        let route = RouteOptimizer::new(config).optimize(&truck(), &stops, &TrafficIndex::new(), departure());
        assert!(route.iterations <= 2);
    }

    #[test]
    fn test_deterministic() {
        let mut traffic = TrafficIndex::new();
        traffic.insert(segment_key("T1", "P2"), TrafficLevel::Heavy);
        let a = optimizer().optimize(&truck(), &line_stops(), &traffic, departure());
        let b = optimizer().optimize(&truck(), &line_stops(), &traffic, departure());
        assert_eq!(a, b);
    }

    #[test]
    fn test_cost_model() {
        let opt = optimizer();
        // 100 km at 0.3 l/km and 1.5 per litre, plus 1h at 35 per hour
        assert!((opt.cost_of(100.0, 60.0) - 80.0).abs() < 1e-9);
    }
}
