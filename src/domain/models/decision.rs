//! Decisions, scoring weights and execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fleet::{Load, Route, Truck};
use super::scenario::{ActionType, Scenario};

/// Weights combining normalized scenario estimates into one score.
///
/// Only the feedback stage changes these between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub cost: f64,
    pub time: f64,
    pub reliability: f64,
    pub fuel: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cost: 0.25,
            time: 0.35,
            reliability: 0.30,
            fuel: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.cost + self.time + self.reliability + self.fuel
    }

    /// Clamp each weight to at least `min_weight` and rescale to sum to 1.
    #[must_use]
    pub fn normalized(&self, min_weight: f64) -> Self {
        let clamped = Self {
            cost: self.cost.max(min_weight),
            time: self.time.max(min_weight),
            reliability: self.reliability.max(min_weight),
            fuel: self.fuel.max(min_weight),
        };
        let total = clamped.sum();
        if total <= 0.0 {
            return Self::default();
        }
        Self {
            cost: clamped.cost / total,
            time: clamped.time / total,
            reliability: clamped.reliability / total,
            fuel: clamped.fuel / total,
        }
    }

    pub fn is_valid(&self) -> bool {
        let all = [self.cost, self.time, self.reliability, self.fuel];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && self.sum() > 0.0
    }
}

/// Human-approval state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    NotRequired,
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Whether a decision in this state may be executed.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Approved)
    }
}

/// The scenario selected for an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    /// Issue this decision resolves; at most one queued approval per issue.
    pub issue_id: String,
    pub scenario: Scenario,
    /// Weighted score in [0, 1]; higher wins.
    pub score: f64,
    /// Scenario reliability scaled by issue confidence.
    pub confidence: f64,
    /// Human-readable reason for the pick.
    pub rationale: String,
    /// Set when the issue came from fallback rules rather than the oracle.
    pub requires_oracle_verification: bool,
    /// Execution waits for an operator.
    pub requires_human_approval: bool,
    pub approval: ApprovalState,
    #[serde(default)]
    pub approval_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn action_type(&self) -> Option<ActionType> {
        self.scenario.action_type()
    }

    /// Estimate the feedback stage compares against.
    pub fn predicted_time_min(&self) -> f64 {
        self.scenario.estimated_time_min
    }

    pub fn predicted_cost(&self) -> f64 {
        self.scenario.estimated_cost
    }
}

/// Score summary of a scenario that was not selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredScenario {
    pub scenario_id: String,
    pub score: f64,
    pub confidence: f64,
}

/// Selection outcome for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub issue_id: String,
    pub selected: Option<Decision>,
    pub alternatives: Vec<ScoredScenario>,
    pub requires_human_approval: bool,
}

/// Records captured before a mutation so it can be undone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreImage {
    pub trucks: Vec<Truck>,
    pub loads: Vec<Load>,
    /// Routes that existed before and were replaced.
    pub routes: Vec<Route>,
    /// Routes created by the mutation, removed on rollback.
    pub created_route_ids: Vec<String>,
}

/// How the executor disposed of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Fleet records were mutated.
    Applied,
    /// Completed without a fleet mutation (wait, notify, escalate).
    Recorded,
    /// Deferred to a later cycle (awaiting approval or entity conflict).
    Deferred,
    /// Discarded at the mutation boundary for violating an invariant.
    Rejected,
    /// Could not be executed (missing entity, bad parameters).
    Failed,
    /// Undone through its pre-image.
    RolledBack,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Recorded => "recorded",
            Self::Deferred => "deferred",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Outcome of executing one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub decision_id: Uuid,
    pub action_type: ActionType,
    pub status: ActionStatus,
    /// Executed without error, a clean rollback included.
    pub success: bool,
    /// Operator-facing summary, or the reason for deferral or rejection.
    pub message: String,
    /// A pre-image was captured.
    pub rollback_possible: bool,
    #[serde(default)]
    pub pre_image: Option<PreImage>,
    pub executed_at: DateTime<Utc>,
}
