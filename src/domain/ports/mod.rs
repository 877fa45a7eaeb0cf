//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - StateStore: durable per-entity records
//! - FleetFeed: telemetry snapshots and observed outcomes
//! - ReasoningOracle: judgment over a structured situation

pub mod fleet_feed;
pub mod reasoning_oracle;
pub mod state_store;

pub use fleet_feed::FleetFeed;
pub use reasoning_oracle::{
    LoadSummary, OracleError, ReasoningOracle, SegmentSummary, Situation, TruckSummary,
};
pub use state_store::{EntityKind, StateStore, StoreError, StoredEntity};
