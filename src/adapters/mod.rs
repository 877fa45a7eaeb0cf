//! Adapters implementing the domain ports.

pub mod file_store;
pub mod memory_store;
pub mod oracles;

pub use file_store::FileStateStore;
pub use memory_store::{FleetFile, InMemoryFleetStore};
pub use oracles::{build_oracle, HttpOracle, RuleOnlyOracle, ScriptedOracle};
