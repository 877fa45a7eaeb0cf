//! Predicted-versus-observed outcomes and learning updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::ScoringWeights;
use super::scenario::ActionType;

/// What actually happened after a decision executed, reported by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedOutcome {
    pub decision_id: Uuid,
    /// Measured duration, compared against the scenario estimate.
    pub actual_time_min: f64,
    pub actual_cost: f64,
    /// A failed outcome triggers a rollback of an untouched mutation.
    pub succeeded: bool,
    pub observed_at: DateTime<Utc>,
}

/// Deviation between prediction and observation for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub decision_id: Uuid,
    pub action_type: Option<ActionType>,
    pub predicted_time_min: f64,
    pub actual_time_min: f64,
    pub predicted_cost: f64,
    pub actual_cost: f64,
    /// `(actual - predicted) / predicted * 100`, with `predicted` floored near zero.
    pub time_deviation_pct: f64,
    pub cost_deviation_pct: f64,
    pub succeeded: bool,
}

/// Weight adjustment derived from one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningUpdate {
    pub decision_id: Uuid,
    pub cost_delta: f64,
    pub time_delta: f64,
    pub reliability_delta: f64,
    /// Sum of absolute deltas before renormalization.
    pub magnitude: f64,
    /// False when this outcome was already applied in an earlier call.
    pub applied: bool,
}

/// Aggregate health derived from the rolling success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

impl SystemHealth {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.8 {
            Self::Healthy
        } else if rate >= 0.5 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub metrics: Vec<OutcomeMetrics>,
    pub updates: Vec<LearningUpdate>,
    /// Weights after this pass.
    pub weights: ScoringWeights,
    /// Share of successes over the rolling window.
    pub success_rate: f64,
    pub health: SystemHealth,
    /// Decisions still waiting for an observation.
    pub awaiting_observation: Vec<Uuid>,
}
