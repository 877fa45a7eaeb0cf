//! Fleet Loop - logistics control loop for truck fleets
//!
//! Each cycle observes the fleet, reasons about problems, plans candidate
//! scenarios, decides on one per issue, acts on the fleet records and feeds
//! observed outcomes back into the scoring weights.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): fleet models, decision records and ports
//! - **Service Layer** (`services`): the decision stages (reasoning, routing,
//!   assignment, planning, selection, execution, learning)
//! - **Application Layer** (`application`): the cycle orchestrator and its
//!   command surface
//! - **Adapters** (`adapters`): stores, fleet feeds and reasoning oracles
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging, retry
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleet_loop::{ControlLoop, Config, EventBus, InMemoryFleetStore, RuleOnlyOracle};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryFleetStore::from_file("fleet.yaml").await?);
//!     let mut control = ControlLoop::new(
//!         &Config::default(),
//!         store.clone(),
//!         store,
//!         Arc::new(RuleOnlyOracle),
//!         Arc::new(EventBus::default()),
//!     );
//!     let state = control.run_cycle().await;
//!     println!("{} decisions", state.decisions.len());
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::{FileStateStore, FleetFile, HttpOracle, InMemoryFleetStore, RuleOnlyOracle, ScriptedOracle};
pub use application::{CommandError, ControlLoop, LoopService, LoopStatus, StopSignal};
pub use domain::models::{Config, ControlLoopState, FleetSnapshot, Load, LoopPhase, Truck};
pub use domain::ports::{FleetFeed, ReasoningOracle, StateStore};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{EventBus, EventPayload, FleetEvent};
