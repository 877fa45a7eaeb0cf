//! Application layer: the cycle orchestrator and its command surface.

pub mod control_loop;
pub mod loop_service;

pub use control_loop::{ControlLoop, StopSignal};
pub use loop_service::{CommandError, LoopService, LoopStatus};
