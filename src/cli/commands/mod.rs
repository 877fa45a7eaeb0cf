pub mod config;
pub mod run;
pub mod tick;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::adapters::{build_oracle, FileStateStore, InMemoryFleetStore};
use crate::application::ControlLoop;
use crate::domain::models::Config;
use crate::services::EventBus;

/// Wire a control loop over the fleet file at `fleet`.
///
/// With `persist`, cycle records are also journaled as JSON under the
/// configured state directory.
pub(crate) async fn build_loop(
    config: &Config,
    fleet: &Path,
    persist: bool,
) -> Result<(Arc<InMemoryFleetStore>, ControlLoop)> {
    let store = Arc::new(
        InMemoryFleetStore::from_file(fleet)
            .await
            .with_context(|| format!("Failed to load fleet file {}", fleet.display()))?,
    );
    let oracle = build_oracle(
        &config.oracle,
        Duration::from_secs(config.reasoning.oracle_timeout_seconds),
    )
    .context("Failed to build reasoning oracle")?;

    let mut control = ControlLoop::new(
        config,
        store.clone(),
        store.clone(),
        oracle,
        Arc::new(EventBus::default()),
    );
    if persist {
        control = control.with_journal(Arc::new(FileStateStore::new(&config.control.state_dir)));
    }
    Ok((store, control))
}
