//! Reasoning Oracle Port
//!
//! Abstract judgment-producing capability consumed by the reasoning stage.
//! Implementations may be model-backed services or rule engines; only the
//! structured input and the JSON judgment matter here. The judgment is
//! validated by the caller, never trusted as-is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::{
    FleetSnapshot, LoadPriority, LoadStatus, Location, TrafficLevel, TruckStatus,
};

/// Errors an oracle call can produce.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Oracle call timed out")]
    Timeout,

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle rate limited")]
    RateLimited,

    #[error("Invalid oracle response: {0}")]
    InvalidResponse(String),

    #[error("Oracle rejected request: {0}")]
    Rejected(String),
}

impl OracleError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_) | Self::RateLimited)
    }
}

/// Structured situation description sent to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Situation {
    pub observed_at: DateTime<Utc>,
    pub trucks: Vec<TruckSummary>,
    pub loads: Vec<LoadSummary>,
    pub congested_segments: Vec<SegmentSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruckSummary {
    pub id: String,
    pub status: TruckStatus,
    pub location: Location,
    pub fuel_fraction: f64,
    pub stationary_minutes: f64,
    pub load_ids: Vec<String>,
    pub spare_capacity_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub id: String,
    pub priority: LoadPriority,
    pub status: LoadStatus,
    pub weight_kg: f64,
    pub assigned_truck_id: Option<String>,
    pub minutes_to_deadline: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub segment_id: String,
    pub level: TrafficLevel,
    pub delay_minutes: f64,
    pub incident: Option<String>,
}

impl Situation {
    pub fn from_snapshot(snapshot: &FleetSnapshot) -> Self {
        let now = snapshot.taken_at;
        let trucks = snapshot
            .trucks
            .iter()
            .map(|t| TruckSummary {
                id: t.id.clone(),
                status: t.status,
                location: t.location,
                fuel_fraction: t.fuel_fraction(),
                stationary_minutes: t.stationary_minutes(now),
                load_ids: t.assigned_load_ids.clone(),
                spare_capacity_kg: (t.capacity_kg - snapshot.committed_weight_kg(&t.id)).max(0.0),
            })
            .collect();
        let loads = snapshot
            .loads
            .iter()
            .filter(|l| !matches!(l.status, LoadStatus::Delivered | LoadStatus::Cancelled))
            .map(|l| LoadSummary {
                id: l.id.clone(),
                priority: l.priority,
                status: l.status,
                weight_kg: l.weight_kg,
                assigned_truck_id: l.assigned_truck_id.clone(),
                minutes_to_deadline: l.deadline().map(|d| (d - now).num_seconds() as f64 / 60.0),
            })
            .collect();
        let congested_segments = snapshot
            .traffic
            .iter()
            .filter(|c| c.level.is_congested())
            .map(|c| SegmentSummary {
                segment_id: c.segment_id.clone(),
                level: c.level,
                delay_minutes: c.delay_minutes,
                incident: c.incident.clone(),
            })
            .collect();

        Self {
            observed_at: now,
            trucks,
            loads,
            congested_segments,
        }
    }
}

/// Judgment-producing capability.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Evaluate the situation, answering with JSON shaped by `schema_hint`.
    async fn evaluate(
        &self,
        situation: &Situation,
        schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value, OracleError>;
}
