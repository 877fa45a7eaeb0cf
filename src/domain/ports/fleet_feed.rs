//! Fleet telemetry port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::{FleetSnapshot, ObservedOutcome};

use super::state_store::StoreError;

/// Supplies current fleet readings on demand.
///
/// Readings are eventually consistent: a mutation saved this cycle may only
/// appear in a later snapshot.
#[async_trait]
pub trait FleetFeed: Send + Sync {
    /// Assemble trucks, loads, routes, traffic and GPS readings.
    async fn snapshot(&self) -> Result<FleetSnapshot, StoreError>;

    /// Observed outcomes for the given decisions; unknown ids are skipped.
    async fn observed_outcomes(
        &self,
        decision_ids: &[Uuid],
    ) -> Result<Vec<ObservedOutcome>, StoreError>;
}
