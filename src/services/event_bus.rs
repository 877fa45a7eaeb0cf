//! EventBus service for fleet loop event streaming.
//!
//! Provides a broadcast-based event system with sequence numbering and
//! per-cycle correlation. Publishing never waits on subscribers; slow or
//! absent consumers simply miss events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::domain::models::{
    ActionResult, ActionStatus, ActionType, Decision, LoopPhase, ScoringWeights, SystemHealth,
};

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn zero() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Flat event record: `type` and `data` come from the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    pub id: Uuid,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub correlation_id: Option<Uuid>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    LoopStarted {
        max_cycles: Option<u64>,
        cycle_interval_seconds: u64,
        auto_approve: bool,
    },
    LoopStopped {
        reason: String,
        immediate: bool,
        cycles_completed: u64,
    },
    PhaseTransition {
        cycle_id: Uuid,
        cycle_number: u64,
        from: Option<LoopPhase>,
        to: LoopPhase,
    },
    PhaseTimedOut {
        cycle_id: Uuid,
        phase: LoopPhase,
        timeout_seconds: u64,
    },
    DecisionMade {
        decision_id: Uuid,
        issue_id: String,
        scenario_id: String,
        action_type: Option<ActionType>,
        score: f64,
        confidence: f64,
        requires_human_approval: bool,
        rationale: String,
    },
    ActionExecuted {
        decision_id: Uuid,
        action_type: ActionType,
        status: ActionStatus,
        success: bool,
        message: String,
    },
    DecisionDeferred {
        decision_id: Uuid,
        reason: String,
    },
    DecisionRejected {
        decision_id: Uuid,
        reason: String,
    },
    ApprovalExpired {
        decision_id: Uuid,
        issue_id: String,
    },
    PersistenceDegraded {
        cycle_id: Uuid,
        error: String,
    },
    CycleCompleted {
        cycle_id: Uuid,
        cycle_number: u64,
        issues: usize,
        decisions: usize,
        applied: usize,
        requires_human_intervention: bool,
        health: SystemHealth,
        weights: ScoringWeights,
    },
}

impl EventPayload {
    fn severity(&self) -> EventSeverity {
        match self {
            Self::PhaseTimedOut { .. } | Self::PersistenceDegraded { .. } | Self::ApprovalExpired { .. } => {
                EventSeverity::Warning
            }
            Self::DecisionRejected { .. } => EventSeverity::Warning,
            Self::ActionExecuted { success: false, status, .. } => match status {
                ActionStatus::Deferred => EventSeverity::Info,
                _ => EventSeverity::Error,
            },
            Self::PhaseTransition { .. } => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }

    pub fn decision_made(decision: &Decision) -> Self {
        Self::DecisionMade {
            decision_id: decision.id,
            issue_id: decision.issue_id.clone(),
            scenario_id: decision.scenario.id.clone(),
            action_type: decision.action_type(),
            score: decision.score,
            confidence: decision.confidence,
            requires_human_approval: decision.requires_human_approval,
            rationale: decision.rationale.clone(),
        }
    }

    pub fn action_executed(result: &ActionResult) -> Self {
        Self::ActionExecuted {
            decision_id: result.decision_id,
            action_type: result.action_type,
            status: result.status,
            success: result.success,
            message: result.message.clone(),
        }
    }
}

impl From<EventPayload> for FleetEvent {
    fn from(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: SequenceNumber::zero(), // Will be assigned by EventBus
            timestamp: Utc::now(),
            severity: payload.severity(),
            correlation_id: None,
            payload,
        }
    }
}

/// Configuration for the EventBus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Central event bus for broadcasting events to multiple consumers.
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
    sequence: AtomicU64,
    correlation_context: Arc<RwLock<Option<Uuid>>>,
}

impl EventBus {
    /// Create a new EventBus with the given configuration.
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
            correlation_context: Arc::new(RwLock::new(None)),
        }
    }

    /// Publish an event.
    pub async fn publish(&self, mut event: FleetEvent) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence = SequenceNumber(seq);

        if event.correlation_id.is_none() {
            let ctx = self.correlation_context.read().await;
            event.correlation_id = *ctx;
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Publish a payload with a fresh envelope.
    pub async fn emit(&self, payload: EventPayload) {
        self.publish(payload.into()).await;
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Tag subsequent events with the given cycle id.
    pub async fn start_correlation(&self, id: Uuid) {
        let mut ctx = self.correlation_context.write().await;
        *ctx = Some(id);
    }

    /// End the current correlation context.
    pub async fn end_correlation(&self) {
        let mut ctx = self.correlation_context.write().await;
        *ctx = None;
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
