//! Domain errors for the fleet control loop.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur while deciding or mutating fleet state.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Truck not found: {0}")]
    TruckNotFound(String),

    #[error("Load not found: {0}")]
    LoadNotFound(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Capacity exceeded on truck {truck_id}: {committed_kg:.1} kg committed, capacity {capacity_kg:.1} kg")]
    CapacityExceeded {
        truck_id: String,
        committed_kg: f64,
        capacity_kg: f64,
    },

    #[error("Inconsistent assignment for load {load_id}: {reason}")]
    InconsistentAssignment { load_id: String, reason: String },

    #[error("Conflicting mutation: {entity} {id} was already modified this cycle")]
    ConflictingMutation { entity: String, id: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl DomainError {
    /// Invariant violations reject a decision without failing the cycle.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::InconsistentAssignment { .. }
                | Self::InvalidStateTransition { .. }
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_error_message() {
        let err = DomainError::CapacityExceeded {
            truck_id: "T1".to_string(),
            committed_kg: 1100.0,
            capacity_kg: 1000.0,
        };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded on truck T1: 1100.0 kg committed, capacity 1000.0 kg"
        );
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_store_error_is_not_invariant_violation() {
        assert!(!DomainError::StoreError("down".into()).is_invariant_violation());
    }
}
