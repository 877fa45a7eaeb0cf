//! Reasoning oracle implementations.

pub mod http;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::DomainResult;
use crate::domain::models::{OracleConfig, OracleKind};
use crate::domain::ports::ReasoningOracle;

pub use http::HttpOracle;
pub use mock::{RuleOnlyOracle, ScriptedOracle};

/// Build the oracle selected by `config.kind`.
pub fn build_oracle(config: &OracleConfig, timeout: Duration) -> DomainResult<Arc<dyn ReasoningOracle>> {
    match config.kind {
        OracleKind::Rules => Ok(Arc::new(RuleOnlyOracle)),
        OracleKind::Http => Ok(Arc::new(HttpOracle::from_config(config, timeout)?)),
    }
}
