//! State store port.
//!
//! The durable record store is an external collaborator reached through
//! load/save calls. The loop treats its failures as retryable and degrades
//! to in-memory operation when they persist.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::{ControlLoopState, Load, Route, Truck};

/// Errors surfaced by store and feed adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Kinds of record the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Truck,
    Load,
    Route,
    Cycle,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truck => "truck",
            Self::Load => "load",
            Self::Route => "route",
            Self::Cycle => "cycle",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum StoredEntity {
    Truck(Truck),
    Load(Load),
    Route(Route),
    Cycle(Box<ControlLoopState>),
}

impl StoredEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Truck(_) => EntityKind::Truck,
            Self::Load(_) => EntityKind::Load,
            Self::Route(_) => EntityKind::Route,
            Self::Cycle(_) => EntityKind::Cycle,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Truck(t) => t.id.clone(),
            Self::Load(l) => l.id.clone(),
            Self::Route(r) => r.id.clone(),
            Self::Cycle(c) => c.cycle_id.to_string(),
        }
    }
}

/// Durable per-entity storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load one record, `Ok(None)` when it does not exist.
    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StoreError>;

    /// Insert or replace a record.
    async fn save(&self, entity: &StoredEntity) -> Result<(), StoreError>;

    /// Remove a record; removing a missing record is not an error.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// All loads currently waiting for a truck.
    async fn query_unassigned_loads(&self) -> Result<Vec<Load>, StoreError>;
}
