//! Control loop phase machine and per-cycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

use super::decision::{ActionResult, Decision};
use super::feedback::FeedbackResult;
use super::fleet::FleetSnapshot;
use super::issue::ReasoningResult;
use super::scenario::Scenario;

/// Phases of one cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Observe,
    Reason,
    Plan,
    Decide,
    Act,
    Feedback,
}

impl LoopPhase {
    /// Every phase, in execution order.
    pub const ALL: [Self; 6] = [
        Self::Observe,
        Self::Reason,
        Self::Plan,
        Self::Decide,
        Self::Act,
        Self::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observe => "observe",
            Self::Reason => "reason",
            Self::Plan => "plan",
            Self::Decide => "decide",
            Self::Act => "act",
            Self::Feedback => "feedback",
        }
    }

    /// Phase that follows this one; feedback wraps to observe.
    pub fn next(&self) -> Self {
        match self {
            Self::Observe => Self::Reason,
            Self::Reason => Self::Plan,
            Self::Plan => Self::Decide,
            Self::Decide => Self::Act,
            Self::Act => Self::Feedback,
            Self::Feedback => Self::Observe,
        }
    }

    /// FEEDBACK closes the cycle.
    pub fn is_last(&self) -> bool {
        *self == Self::Feedback
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Timing and outcome of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: LoopPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The phase, or a store write inside it, hit the phase deadline.
    pub timed_out: bool,
    /// Why the phase degraded, when it did without timing out.
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate state of the in-flight cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLoopState {
    /// Correlation id stamped on every event of the cycle.
    pub cycle_id: Uuid,
    /// 1-based count since the loop was constructed.
    pub cycle_number: u64,
    /// Phase currently running, or the last one reached.
    pub phase: LoopPhase,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Preprocessed OBSERVE output.
    #[serde(default)]
    pub snapshot: Option<FleetSnapshot>,
    #[serde(default)]
    pub reasoning: Option<ReasoningResult>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub action_results: Vec<ActionResult>,
    #[serde(default)]
    pub feedback: Option<FeedbackResult>,
    /// False once a stop was requested or the cycle limit reached.
    pub continue_loop: bool,
    /// A decision of this cycle is parked for operator approval.
    pub requires_human_intervention: bool,
    /// Latest phase error or timeout message.
    #[serde(default)]
    pub error_message: Option<String>,
    /// One record per phase run, in order.
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    /// Persistence fell back to memory for this cycle.
    #[serde(default)]
    pub persistence_degraded: bool,
    /// The cycle stopped early on an immediate operator stop.
    #[serde(default)]
    pub halted: bool,
}

impl ControlLoopState {
    /// A fresh cycle positioned at OBSERVE.
    pub fn new(cycle_number: u64) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            cycle_number,
            phase: LoopPhase::Observe,
            started_at: Utc::now(),
            completed_at: None,
            snapshot: None,
            reasoning: None,
            scenarios: Vec::new(),
            decisions: Vec::new(),
            action_results: Vec::new(),
            feedback: None,
            continue_loop: true,
            requires_human_intervention: false,
            error_message: None,
            phase_history: Vec::new(),
            persistence_degraded: false,
            halted: false,
        }
    }

    /// Move to `next`, which must directly follow the current phase.
    pub fn transition_to(&mut self, next: LoopPhase) -> DomainResult<()> {
        if self.phase.is_last() || self.phase.next() != next {
            return Err(DomainError::InvalidStateTransition {
                from: self.phase.as_str().to_string(),
                to: next.as_str().to_string(),
                reason: "phases advance one step at a time within a cycle".to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Append an error without losing earlier ones.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error_message = Some(match self.error_message.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
    }

    pub fn phase_timed_out(&self, phase: LoopPhase) -> bool {
        self.phase_history
            .iter()
            .any(|r| r.phase == phase && r.timed_out)
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}
