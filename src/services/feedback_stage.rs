//! Feedback stage.
//!
//! Compares each executed decision's predicted time and cost with what the
//! fleet feed later observed, nudges the scoring weights by a bounded step,
//! and tracks a rolling success rate. Each decision's outcome is applied at
//! most once.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::models::{
    Decision, FeedbackResult, LearningConfig, LearningUpdate, ObservedOutcome, OutcomeMetrics,
    ScoringWeights, SystemHealth,
};

const DEVIATION_EPSILON: f64 = 1e-6;

/// Learning updates remembered for idempotent replays, oldest evicted first.
const REMEMBERED_UPDATES: usize = 1_000;

/// Owner of the scoring weights between cycles.
#[derive(Debug, Clone)]
pub struct FeedbackStage {
    config: LearningConfig,
    weights: ScoringWeights,
    applied: HashMap<Uuid, LearningUpdate>,
    applied_order: VecDeque<Uuid>,
    recent: VecDeque<bool>,
}

impl FeedbackStage {
    pub fn new(config: LearningConfig, initial_weights: ScoringWeights) -> Self {
        let weights = initial_weights.normalized(config.min_weight);
        Self {
            config,
            weights,
            applied: HashMap::new(),
            applied_order: VecDeque::new(),
            recent: VecDeque::new(),
        }
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    /// Share of recent outcomes that succeeded; 1.0 before any outcome.
    pub fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64
    }

    pub fn health(&self) -> SystemHealth {
        SystemHealth::from_success_rate(self.success_rate())
    }

    /// Reconcile executed decisions with the outcomes observed so far.
    pub fn reconcile(&mut self, decisions: &[Decision], outcomes: &[ObservedOutcome]) -> FeedbackResult {
        let mut metrics = Vec::new();
        let mut updates = Vec::new();
        let mut awaiting_observation = Vec::new();

        for decision in decisions {
            let Some(outcome) = outcomes.iter().find(|o| o.decision_id == decision.id) else {
                awaiting_observation.push(decision.id);
                continue;
            };

            let observed = measure(decision, outcome);
            let update = match self.applied.get(&decision.id) {
                Some(previous) => LearningUpdate {
                    applied: false,
                    ..previous.clone()
                },
                None => {
                    let update = self.learn(&observed);
                    self.remember(decision.id, update.clone());
                    update
                }
            };
            metrics.push(observed);
            updates.push(update);
        }

        if !updates.is_empty() {
            info!(
                observed = metrics.len(),
                applied = updates.iter().filter(|u| u.applied).count(),
                success_rate = self.success_rate(),
                "feedback reconciled"
            );
        }

        FeedbackResult {
            metrics,
            updates,
            weights: self.weights,
            success_rate: self.success_rate(),
            health: self.health(),
            awaiting_observation,
        }
    }

    fn remember(&mut self, decision_id: Uuid, update: LearningUpdate) {
        self.applied.insert(decision_id, update);
        self.applied_order.push_back(decision_id);
        while self.applied_order.len() > REMEMBERED_UPDATES {
            if let Some(evicted) = self.applied_order.pop_front() {
                self.applied.remove(&evicted);
            }
        }
    }

    fn learn(&mut self, metrics: &OutcomeMetrics) -> LearningUpdate {
        let tolerance = self.config.tolerance_pct;
        let step = |deviation_pct: f64| {
            if deviation_pct > tolerance {
                (self.config.learning_rate * deviation_pct / 100.0).min(self.config.max_step)
            } else {
                0.0
            }
        };

        let time_delta = step(metrics.time_deviation_pct);
        let cost_delta = step(metrics.cost_deviation_pct);
        let reliability_delta = if metrics.succeeded {
            0.0
        } else {
            self.config.learning_rate.min(self.config.max_step)
        };
        let magnitude = time_delta.abs() + cost_delta.abs() + reliability_delta.abs();

        if magnitude > 0.0 {
            let nudged = ScoringWeights {
                cost: self.weights.cost + cost_delta,
                time: self.weights.time + time_delta,
                reliability: self.weights.reliability + reliability_delta,
                fuel: self.weights.fuel,
            };
            self.weights = nudged.normalized(self.config.min_weight);
            debug!(
                decision_id = %metrics.decision_id,
                cost_delta,
                time_delta,
                reliability_delta,
                "scoring weights nudged"
            );
        }

        self.recent.push_back(metrics.succeeded);
        while self.recent.len() > self.config.success_window.max(1) {
            self.recent.pop_front();
        }

        LearningUpdate {
            decision_id: metrics.decision_id,
            cost_delta,
            time_delta,
            reliability_delta,
            magnitude,
            applied: true,
        }
    }
}

fn deviation_pct(predicted: f64, actual: f64) -> f64 {
    (actual - predicted) / predicted.max(DEVIATION_EPSILON) * 100.0
}

fn measure(decision: &Decision, outcome: &ObservedOutcome) -> OutcomeMetrics {
    let predicted_time_min = decision.predicted_time_min();
    let predicted_cost = decision.predicted_cost();
    OutcomeMetrics {
        decision_id: decision.id,
        action_type: decision.action_type(),
        predicted_time_min,
        actual_time_min: outcome.actual_time_min,
        predicted_cost,
        actual_cost: outcome.actual_cost,
        time_deviation_pct: deviation_pct(predicted_time_min, outcome.actual_time_min),
        cost_deviation_pct: deviation_pct(predicted_cost, outcome.actual_cost),
        succeeded: outcome.succeeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Action, ApprovalState, Scenario};
    use chrono::Utc;

    fn decision(time: f64, cost: f64) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            issue_id: "I1".into(),
            scenario: Scenario {
                id: "SCEN-I1-WAIT".into(),
                issue_id: "I1".into(),
                name: "wait".into(),
                description: String::new(),
                actions: vec![Action::Wait {
                    truck_id: None,
                    duration_minutes: 15.0,
                }],
                estimated_cost: cost,
                estimated_time_min: time,
                estimated_fuel_l: 1.0,
                reliability: 0.8,
                feasibility_violated: false,
                sequence: 0,
            },
            score: 0.7,
            confidence: 0.8,
            rationale: String::new(),
            requires_oracle_verification: false,
            requires_human_approval: false,
            approval: ApprovalState::NotRequired,
            approval_reason: None,
            created_at: Utc::now(),
        }
    }

    fn outcome(d: &Decision, time: f64, cost: f64, succeeded: bool) -> ObservedOutcome {
        ObservedOutcome {
            decision_id: d.id,
            actual_time_min: time,
            actual_cost: cost,
            succeeded,
            observed_at: Utc::now(),
        }
    }

    fn stage() -> FeedbackStage {
        FeedbackStage::new(LearningConfig::default(), ScoringWeights::default())
    }

    #[test]
    fn test_time_overrun_raises_time_weight() {
        let mut fb = stage();
        let d = decision(60.0, 100.0);
        let before = fb.weights();
        let result = fb.reconcile(&[d.clone()], &[outcome(&d, 90.0, 100.0, true)]);

        assert!((result.metrics[0].time_deviation_pct - 50.0).abs() < 1e-9);
        assert!(result.updates[0].time_delta > 0.0);
        assert_eq!(result.updates[0].cost_delta, 0.0);
        assert!(result.weights.time > before.time);
        assert!((result.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_within_tolerance_changes_nothing() {
        let mut fb = stage();
        let d = decision(60.0, 100.0);
        let result = fb.reconcile(&[d.clone()], &[outcome(&d, 63.0, 105.0, true)]);
        assert_eq!(result.updates[0].magnitude, 0.0);
        assert_eq!(result.weights, ScoringWeights::default().normalized(0.05));
    }

    #[test]
    fn test_step_is_bounded() {
        let mut fb = stage();
        let d = decision(1.0, 1.0);
        let result = fb.reconcile(&[d.clone()], &[outcome(&d, 1000.0, 1000.0, false)]);
        let update = &result.updates[0];
        let max_step = LearningConfig::default().max_step;
        assert!(update.time_delta <= max_step);
        assert!(update.cost_delta <= max_step);
        assert!(update.reliability_delta <= max_step);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut fb = stage();
        let d = decision(60.0, 100.0);
        let obs = outcome(&d, 120.0, 150.0, false);

        let first = fb.reconcile(&[d.clone()], &[obs.clone()]);
        let second = fb.reconcile(&[d.clone()], &[obs]);

        assert!(first.updates[0].applied);
        assert!(!second.updates[0].applied);
        assert_eq!(first.updates[0].magnitude, second.updates[0].magnitude);
        assert_eq!(first.weights, second.weights);
        assert!((first.success_rate - second.success_rate).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_outcome_awaits_observation() {
        let mut fb = stage();
        let d = decision(60.0, 100.0);
        let result = fb.reconcile(&[d.clone()], &[]);
        assert_eq!(result.awaiting_observation, vec![d.id]);
        assert!(result.updates.is_empty());
        assert_eq!(result.health, SystemHealth::Healthy);
    }

    #[test]
    fn test_health_tracks_failures() {
        let mut fb = stage();
        let decisions: Vec<_> = (0..4).map(|_| decision(60.0, 100.0)).collect();
        let outcomes: Vec<_> = decisions
            .iter()
            .enumerate()
            .map(|(i, d)| outcome(d, 60.0, 100.0, i == 0))
            .collect();
        let result = fb.reconcile(&decisions, &outcomes);
        assert!((result.success_rate - 0.25).abs() < 1e-9);
        assert_eq!(result.health, SystemHealth::Critical);
    }

    #[test]
    fn test_zero_prediction_does_not_divide_by_zero() {
        let mut fb = stage();
        let d = decision(0.0, 0.0);
        let result = fb.reconcile(&[d.clone()], &[outcome(&d, 5.0, 5.0, true)]);
        assert!(result.metrics[0].time_deviation_pct.is_finite());
        assert!(result.weights.is_valid());
    }

    #[test]
    fn test_remembered_updates_are_bounded() {
        let mut fb = stage();
        let decisions: Vec<_> = (0..REMEMBERED_UPDATES + 25).map(|_| decision(60.0, 100.0)).collect();
        let outcomes: Vec<_> = decisions.iter().map(|d| outcome(d, 60.0, 100.0, true)).collect();

        fb.reconcile(&decisions, &outcomes);

        assert_eq!(fb.applied.len(), REMEMBERED_UPDATES);
        assert_eq!(fb.applied_order.len(), REMEMBERED_UPDATES);
        assert!(!fb.applied.contains_key(&decisions[0].id));
        assert!(fb.applied.contains_key(&decisions[decisions.len() - 1].id));
    }
}
