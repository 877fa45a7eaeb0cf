//! Domain layer for the fleet control loop
//!
//! This module contains the fleet models, the decision records produced
//! each cycle, and the ports that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
