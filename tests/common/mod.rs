//! Common test utilities for integration tests
//!
//! Provides fleet fixtures and loop wiring shared across integration test
//! files.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleet_loop::adapters::{InMemoryFleetStore, RuleOnlyOracle};
use fleet_loop::application::ControlLoop;
use fleet_loop::domain::models::{
    Config, FleetSnapshot, Load, LoadPriority, Location, ObservedOutcome, RetryConfig, TimeWindow,
    Truck,
};
use fleet_loop::domain::ports::{
    EntityKind, FleetFeed, ReasoningOracle, StateStore, StoreError, StoredEntity,
};
use fleet_loop::services::EventBus;
use uuid::Uuid;

/// Fixed clock for every fixture.
#[allow(dead_code)]
pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Idle truck with a full tank.
#[allow(dead_code)]
pub fn truck(id: &str, latitude: f64, longitude: f64, capacity_kg: f64) -> Truck {
    Truck::new(id, Location::new(latitude, longitude), capacity_kg, now())
}

/// Unassigned load delivered 0.1 degrees north of its pickup.
#[allow(dead_code)]
pub fn load(id: &str, weight_kg: f64, priority: LoadPriority, latitude: f64, longitude: f64) -> Load {
    Load::new(
        id,
        weight_kg,
        priority,
        Location::new(latitude, longitude),
        Location::new(latitude + 0.1, longitude),
    )
}

/// Same as [`load`] with a pickup window closing `minutes` from now.
#[allow(dead_code)]
pub fn load_due(id: &str, weight_kg: f64, priority: LoadPriority, minutes: i64) -> Load {
    let mut load = load(id, weight_kg, priority, 52.01, 4.0);
    load.pickup_window = Some(TimeWindow::new(now(), now() + Duration::minutes(minutes)));
    load
}

#[allow(dead_code)]
pub fn snapshot(trucks: Vec<Truck>, loads: Vec<Load>) -> FleetSnapshot {
    FleetSnapshot {
        taken_at: now(),
        trucks,
        loads,
        ..FleetSnapshot::default()
    }
}

/// Defaults with retries shortened so failing stores do not slow tests.
#[allow(dead_code)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_retries: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    config.control.phase_timeout_seconds = 5;
    config.control.cycle_interval_seconds = 0;
    config
}

/// A loop over an in-memory store seeded with `snapshot`.
#[allow(dead_code)]
pub fn control_loop(
    config: &Config,
    snapshot: FleetSnapshot,
    oracle: Option<Arc<dyn ReasoningOracle>>,
) -> (Arc<InMemoryFleetStore>, ControlLoop) {
    let store = Arc::new(InMemoryFleetStore::from_snapshot(snapshot));
    let oracle = oracle.unwrap_or_else(|| Arc::new(RuleOnlyOracle));
    let control = ControlLoop::new(
        config,
        store.clone(),
        store.clone(),
        oracle,
        Arc::new(EventBus::default()),
    );
    (store, control)
}

/// In-memory store whose snapshots and writes take a fixed extra time.
#[allow(dead_code)]
pub struct SlowStore {
    pub inner: Arc<InMemoryFleetStore>,
    pub snapshot_delay: std::time::Duration,
    pub write_delay: std::time::Duration,
}

#[allow(dead_code)]
impl SlowStore {
    pub fn new(snapshot: FleetSnapshot) -> Self {
        Self {
            inner: Arc::new(InMemoryFleetStore::from_snapshot(snapshot)),
            snapshot_delay: std::time::Duration::ZERO,
            write_delay: std::time::Duration::ZERO,
        }
    }
}

#[async_trait]
impl FleetFeed for SlowStore {
    async fn snapshot(&self) -> Result<FleetSnapshot, StoreError> {
        tokio::time::sleep(self.snapshot_delay).await;
        self.inner.snapshot().await
    }

    async fn observed_outcomes(&self, decision_ids: &[Uuid]) -> Result<Vec<ObservedOutcome>, StoreError> {
        self.inner.observed_outcomes(decision_ids).await
    }
}

#[async_trait]
impl StateStore for SlowStore {
    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StoreError> {
        self.inner.load(kind, id).await
    }

    async fn save(&self, entity: &StoredEntity) -> Result<(), StoreError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.save(entity).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.delete(kind, id).await
    }

    async fn query_unassigned_loads(&self) -> Result<Vec<Load>, StoreError> {
        self.inner.query_unassigned_loads().await
    }
}

/// A loop whose feed, record store and journal are all `store`.
#[allow(dead_code)]
pub fn slow_control_loop(config: &Config, store: Arc<SlowStore>) -> ControlLoop {
    ControlLoop::new(
        config,
        store.clone(),
        store,
        Arc::new(RuleOnlyOracle),
        Arc::new(EventBus::default()),
    )
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
