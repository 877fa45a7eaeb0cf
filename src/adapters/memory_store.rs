//! In-memory fleet store.
//!
//! Serves as both the record store and the telemetry feed for local runs
//! and tests. It is seeded from a fleet file (YAML or JSON) holding trucks,
//! loads, routes, traffic and GPS readings; saved mutations show up in the
//! next snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{
    ControlLoopState, FleetSnapshot, GpsReading, Load, LoadStatus, ObservedOutcome, Route,
    TrafficCondition, Truck,
};
use crate::domain::ports::{EntityKind, FleetFeed, StateStore, StoreError, StoredEntity};

/// On-disk layout of a fleet seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub trucks: Vec<Truck>,
    #[serde(default)]
    pub loads: Vec<Load>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub traffic: Vec<TrafficCondition>,
    #[serde(default)]
    pub gps: Vec<GpsReading>,
}

impl FleetFile {
    /// Parse YAML or JSON; the extension picks the format, YAML otherwise.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, StoreError> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(contents)?)
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| StoreError::Unavailable(format!("invalid fleet file {}: {}", path.display(), e)))
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    trucks: BTreeMap<String, Truck>,
    loads: BTreeMap<String, Load>,
    routes: BTreeMap<String, Route>,
    cycles: HashMap<String, ControlLoopState>,
    traffic: Vec<TrafficCondition>,
    gps: Vec<GpsReading>,
    outcomes: HashMap<Uuid, ObservedOutcome>,
    clock: Option<DateTime<Utc>>,
}

impl Records {
    fn seeded(fleet: FleetFile) -> Self {
        Self {
            trucks: fleet.trucks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            loads: fleet.loads.into_iter().map(|l| (l.id.clone(), l)).collect(),
            routes: fleet.routes.into_iter().map(|r| (r.id.clone(), r)).collect(),
            traffic: fleet.traffic,
            gps: fleet.gps,
            ..Self::default()
        }
    }
}

/// Store and feed backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryFleetStore {
    records: RwLock<Records>,
    fail_writes: AtomicBool,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fleet(fleet: FleetFile) -> Self {
        Self::with_records(Records::seeded(fleet))
    }

    /// Seed from a snapshot, keeping its timestamp as a fixed clock.
    pub fn from_snapshot(snapshot: FleetSnapshot) -> Self {
        let mut records = Records::seeded(FleetFile {
            trucks: snapshot.trucks,
            loads: snapshot.loads,
            routes: snapshot.routes,
            traffic: snapshot.traffic,
            gps: snapshot.gps,
        });
        records.clock = Some(snapshot.taken_at);
        Self::with_records(records)
    }

    fn with_records(records: Records) -> Self {
        Self {
            records: RwLock::new(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let fleet = FleetFile::parse(&contents, path)?;
        debug!(
            path = %path.display(),
            trucks = fleet.trucks.len(),
            loads = fleet.loads.len(),
            "fleet file loaded"
        );
        Ok(Self::from_fleet(fleet))
    }

    /// Pin snapshot time; `None` returns to the wall clock.
    pub async fn set_clock(&self, now: Option<DateTime<Utc>>) {
        self.records.write().await.clock = now;
    }

    /// Replace the current traffic readings.
    pub async fn set_traffic(&self, traffic: Vec<TrafficCondition>) {
        self.records.write().await.traffic = traffic;
    }

    /// Make the outcome of a decision visible to the feedback stage.
    pub async fn record_outcome(&self, outcome: ObservedOutcome) {
        self.records.write().await.outcomes.insert(outcome.decision_id, outcome);
    }

    /// Simulate an unavailable backend for every subsequent write.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn cycle(&self, cycle_id: Uuid) -> Option<ControlLoopState> {
        self.records.read().await.cycles.get(&cycle_id.to_string()).cloned()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store rejected write".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryFleetStore {
    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StoreError> {
        let records = self.records.read().await;
        let entity = match kind {
            EntityKind::Truck => records.trucks.get(id).cloned().map(StoredEntity::Truck),
            EntityKind::Load => records.loads.get(id).cloned().map(StoredEntity::Load),
            EntityKind::Route => records.routes.get(id).cloned().map(StoredEntity::Route),
            EntityKind::Cycle => records
                .cycles
                .get(id)
                .cloned()
                .map(|c| StoredEntity::Cycle(Box::new(c))),
        };
        Ok(entity)
    }

    async fn save(&self, entity: &StoredEntity) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        match entity {
            StoredEntity::Truck(t) => {
                records.trucks.insert(t.id.clone(), t.clone());
            }
            StoredEntity::Load(l) => {
                records.loads.insert(l.id.clone(), l.clone());
            }
            StoredEntity::Route(r) => {
                records.routes.insert(r.id.clone(), r.clone());
            }
            StoredEntity::Cycle(c) => {
                records.cycles.insert(c.cycle_id.to_string(), (**c).clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        match kind {
            EntityKind::Truck => {
                records.trucks.remove(id);
            }
            EntityKind::Load => {
                records.loads.remove(id);
            }
            EntityKind::Route => {
                records.routes.remove(id);
            }
            EntityKind::Cycle => {
                records.cycles.remove(id);
            }
        }
        Ok(())
    }

    async fn query_unassigned_loads(&self) -> Result<Vec<Load>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .loads
            .values()
            .filter(|l| l.status == LoadStatus::Unassigned)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FleetFeed for InMemoryFleetStore {
    async fn snapshot(&self) -> Result<FleetSnapshot, StoreError> {
        let records = self.records.read().await;
        Ok(FleetSnapshot {
            taken_at: records.clock.unwrap_or_else(Utc::now),
            trucks: records.trucks.values().cloned().collect(),
            loads: records.loads.values().cloned().collect(),
            routes: records.routes.values().cloned().collect(),
            traffic: records.traffic.clone(),
            gps: records.gps.clone(),
        })
    }

    async fn observed_outcomes(&self, decision_ids: &[Uuid]) -> Result<Vec<ObservedOutcome>, StoreError> {
        let records = self.records.read().await;
        Ok(decision_ids
            .iter()
            .filter_map(|id| records.outcomes.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{LoadPriority, Location};
    use std::io::Write;

    const FLEET_YAML: &str = r#"
trucks:
  - id: T1
    location: { latitude: 52.0, longitude: 4.0 }
    capacity_kg: 1000
    fuel_level_l: 150
    last_moved_at: 2024-05-01T08:00:00Z
loads:
  - id: L1
    weight_kg: 200
    priority: critical
    pickup: { latitude: 52.01, longitude: 4.0 }
    delivery: { latitude: 52.2, longitude: 4.1 }
"#;

    #[tokio::test]
    async fn test_seed_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(FLEET_YAML.as_bytes()).unwrap();

        let store = InMemoryFleetStore::from_file(file.path()).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();

        assert_eq!(snapshot.trucks.len(), 1);
        assert_eq!(snapshot.trucks[0].fuel_capacity_l, 200.0);
        assert_eq!(snapshot.loads[0].priority, LoadPriority::Critical);
        assert_eq!(snapshot.loads[0].status, LoadStatus::Unassigned);
        assert_eq!(store.query_unassigned_loads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saved_mutation_visible_in_next_snapshot() {
        let store = InMemoryFleetStore::new();
        let mut truck = Truck::new("T1", Location::new(0.0, 0.0), 500.0, Utc::now());
        store.save(&StoredEntity::Truck(truck.clone())).await.unwrap();

        truck.capacity_kg = 800.0;
        store.save(&StoredEntity::Truck(truck)).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.trucks[0].capacity_kg, 800.0);

        store.delete(EntityKind::Truck, "T1").await.unwrap();
        assert!(store.load(EntityKind::Truck, "T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_writes_are_transient() {
        let store = InMemoryFleetStore::new();
        store.fail_writes(true);
        let truck = Truck::new("T1", Location::new(0.0, 0.0), 500.0, Utc::now());
        let err = store.save(&StoredEntity::Truck(truck)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_outcomes_filtered_by_id() {
        let store = InMemoryFleetStore::new();
        let known = Uuid::new_v4();
        store
            .record_outcome(ObservedOutcome {
                decision_id: known,
                actual_time_min: 40.0,
                actual_cost: 90.0,
                succeeded: true,
                observed_at: Utc::now(),
            })
            .await;

        let outcomes = store.observed_outcomes(&[known, Uuid::new_v4()]).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].decision_id, known);
    }
}
