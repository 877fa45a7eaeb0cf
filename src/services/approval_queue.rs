//! Deferred-decision queue.
//!
//! Decisions that need a human are parked here instead of blocking the loop.
//! An operator approves or rejects them through the command surface; approved
//! ones are picked up by the next ACT phase and unanswered ones expire after
//! the configured TTL.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::models::{ApprovalState, Decision};

/// Errors returned to the operator by [`ApprovalQueue::approve`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("No deferred decision with id {0}")]
    NotFound(Uuid),

    #[error("Decision {id} was already {state}")]
    AlreadyResolved { id: Uuid, state: &'static str },

    #[error("Decision {0} expired before it was approved")]
    Expired(Uuid),

    #[error("Decision {id} was replaced by {by} for the same issue")]
    Superseded { id: Uuid, by: Uuid },
}

#[derive(Debug, Clone)]
struct Deferred {
    decision: Decision,
    deferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Answered(ApprovalState),
    Superseded(Uuid),
}

/// How an id left the queue, kept for one TTL so late answers get a clear error.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    resolution: Resolution,
    at: DateTime<Utc>,
}

/// TTL-bounded queue of decisions awaiting approval.
///
/// Holds at most one pending decision per issue. A newer decision for an
/// issue already waiting replaces the queued one but keeps its deferral
/// time, so an unanswered issue still expires after one TTL.
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    ttl: Duration,
    entries: Vec<Deferred>,
    resolved: HashMap<Uuid, Resolved>,
}

impl ApprovalQueue {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds.min(u64::from(u32::MAX)) as i64),
            entries: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    /// Park a decision and return the one it superseded, if any.
    ///
    /// Re-deferring a queued id is a no-op, and so is deferring a decision
    /// for an issue whose queued decision is already approved.
    pub fn defer(&mut self, mut decision: Decision, now: DateTime<Utc>) -> Option<Decision> {
        if self.entries.iter().any(|e| e.decision.id == decision.id) {
            return None;
        }
        decision.approval = ApprovalState::Pending;

        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.decision.issue_id == decision.issue_id)
        else {
            self.entries.push(Deferred {
                decision,
                deferred_at: now,
            });
            return None;
        };

        if self.entries[idx].decision.approval == ApprovalState::Approved {
            debug!(issue_id = %decision.issue_id, decision_id = %decision.id, "issue already has an approved decision");
            return None;
        }

        let replaced = std::mem::replace(&mut self.entries[idx].decision, decision);
        let by = self.entries[idx].decision.id;
        self.resolve(replaced.id, Resolution::Superseded(by), now);
        debug!(issue_id = %replaced.issue_id, old = %replaced.id, new = %by, "pending decision superseded");
        Some(replaced)
    }

    /// Record an operator's answer.
    pub fn approve(
        &mut self,
        id: Uuid,
        approved: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalState, ApprovalError> {
        if let Some(resolved) = self.resolved.get(&id) {
            return Err(match resolved.resolution {
                Resolution::Superseded(by) => ApprovalError::Superseded { id, by },
                Resolution::Answered(ApprovalState::Expired) => ApprovalError::Expired(id),
                Resolution::Answered(other) => ApprovalError::AlreadyResolved {
                    id,
                    state: other.as_str(),
                },
            });
        }
        let idx = self
            .entries
            .iter()
            .position(|e| e.decision.id == id)
            .ok_or(ApprovalError::NotFound(id))?;

        let entry = &mut self.entries[idx];
        if entry.decision.approval == ApprovalState::Approved {
            return Err(ApprovalError::AlreadyResolved {
                id,
                state: ApprovalState::Approved.as_str(),
            });
        }
        if now - entry.deferred_at > self.ttl {
            self.entries.remove(idx);
            self.resolve(id, Resolution::Answered(ApprovalState::Expired), now);
            return Err(ApprovalError::Expired(id));
        }

        if approved {
            entry.decision.approval = ApprovalState::Approved;
            entry.decision.requires_human_approval = false;
            if reason.is_some() {
                entry.decision.approval_reason = reason;
            }
            info!(decision_id = %id, "decision approved");
            Ok(ApprovalState::Approved)
        } else {
            self.entries.remove(idx);
            self.resolve(id, Resolution::Answered(ApprovalState::Rejected), now);
            info!(decision_id = %id, reason = reason.as_deref().unwrap_or(""), "decision rejected");
            Ok(ApprovalState::Rejected)
        }
    }

    /// Remove and return approved decisions in the order they were deferred.
    pub fn take_approved(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let (approved, waiting): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.decision.approval == ApprovalState::Approved);
        self.entries = waiting;
        approved
            .into_iter()
            .map(|e| {
                self.resolve(e.decision.id, Resolution::Answered(ApprovalState::Approved), now);
                e.decision
            })
            .collect()
    }

    /// Put back an approved decision that was taken but not executed; it is
    /// released again by the next [`take_approved`](Self::take_approved).
    pub fn requeue_approved(&mut self, decision: Decision, now: DateTime<Utc>) {
        if decision.approval != ApprovalState::Approved
            || self.entries.iter().any(|e| e.decision.id == decision.id)
        {
            return;
        }
        self.resolved.remove(&decision.id);
        let (displaced, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| {
            e.decision.issue_id == decision.issue_id && e.decision.approval == ApprovalState::Pending
        });
        self.entries = kept;
        for entry in displaced {
            self.resolve(entry.decision.id, Resolution::Superseded(decision.id), now);
        }
        debug!(decision_id = %decision.id, "approved decision requeued");
        self.entries.insert(
            0,
            Deferred {
                decision,
                deferred_at: now,
            },
        );
    }

    /// Drop pending decisions older than the TTL and return them.
    ///
    /// Resolution records older than the TTL are forgotten here too; an
    /// answer for such an id reports `NotFound`.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let ttl = self.ttl;
        self.resolved.retain(|_, r| now - r.at <= ttl);

        let (expired, live): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.decision.approval == ApprovalState::Pending && now - e.deferred_at > ttl);
        self.entries = live;
        expired
            .into_iter()
            .map(|e| {
                self.resolve(e.decision.id, Resolution::Answered(ApprovalState::Expired), now);
                let mut decision = e.decision;
                decision.approval = ApprovalState::Expired;
                decision
            })
            .collect()
    }

    /// Decisions still waiting for an answer.
    pub fn pending(&self) -> Vec<&Decision> {
        self.entries
            .iter()
            .filter(|e| e.decision.approval == ApprovalState::Pending)
            .map(|e| &e.decision)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&mut self, id: Uuid, resolution: Resolution, at: DateTime<Utc>) {
        self.resolved.insert(id, Resolved { resolution, at });
    }
}
