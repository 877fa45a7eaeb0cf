//! Reasoning stage.
//!
//! Turns a fleet snapshot into a prioritized list of issues. The reasoning
//! oracle is consulted first under a timeout; its JSON judgment must match a
//! strict schema and reference only known trucks and loads. Anything else
//! (error, timeout, malformed or low-confidence judgment) switches to the
//! deterministic rules, whose issues carry a confidence below the oracle's
//! floor. The stage never mutates fleet state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::domain::models::{
    segment_key, sort_issues, FleetSnapshot, Issue, IssueType, JudgmentSource, LoadStatus,
    ReasoningConfig, ReasoningResult, Severity, Truck, TruckStatus,
};
use crate::domain::ports::{OracleError, ReasoningOracle, Situation};
use crate::infrastructure::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Judgment {
    issues: Vec<JudgedIssue>,
    risk_assessment: String,
    recommendations: Vec<String>,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JudgedIssue {
    issue_type: IssueType,
    severity: Severity,
    description: String,
    truck_ids: Vec<String>,
    load_ids: Vec<String>,
}

/// Schema hint sent alongside every situation.
pub fn judgment_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["issues", "risk_assessment", "recommendations", "confidence"],
        "properties": {
            "issues": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["issue_type", "severity", "description", "truck_ids", "load_ids"],
                    "properties": {
                        "issue_type": {
                            "enum": ["stuck_truck", "delay", "traffic", "low_fuel",
                                     "capacity_mismatch", "unassigned_load", "window_risk", "other"]
                        },
                        "severity": { "enum": ["low", "medium", "high", "critical"] },
                        "description": { "type": "string" },
                        "truck_ids": { "type": "array", "items": { "type": "string" } },
                        "load_ids": { "type": "array", "items": { "type": "string" } }
                    }
                }
            },
            "risk_assessment": { "type": "string" },
            "recommendations": { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    })
}

/// Oracle-first issue detection with a rule-based fallback.
pub struct ReasoningStage {
    oracle: Arc<dyn ReasoningOracle>,
    config: ReasoningConfig,
    retry: RetryPolicy,
}

impl ReasoningStage {
    pub fn new(oracle: Arc<dyn ReasoningOracle>, config: ReasoningConfig, retry: RetryPolicy) -> Self {
        Self {
            oracle,
            config,
            retry,
        }
    }

    /// Analyze a snapshot; always returns a result.
    pub async fn analyze(&self, snapshot: &FleetSnapshot) -> ReasoningResult {
        let situation = Situation::from_snapshot(snapshot);
        let schema = judgment_schema();
        let budget = Duration::from_secs(self.config.oracle_timeout_seconds);

        let call = self
            .retry
            .execute(|| self.oracle.evaluate(&situation, &schema));
        let raw = match timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout),
        };

        match raw.and_then(|value| self.validate(value, snapshot)) {
            Ok(result) => {
                info!(
                    oracle = self.oracle.name(),
                    issues = result.issues.len(),
                    confidence = result.confidence,
                    "oracle judgment accepted"
                );
                result
            }
            Err(err) => {
                warn!(oracle = self.oracle.name(), error = %err, "oracle judgment unusable, applying rules");
                self.fallback(snapshot, err.to_string())
            }
        }
    }

    /// Parse and check a raw judgment against the snapshot.
    fn validate(
        &self,
        value: serde_json::Value,
        snapshot: &FleetSnapshot,
    ) -> Result<ReasoningResult, OracleError> {
        let judgment: Judgment = serde_json::from_value(value)
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        if !judgment.confidence.is_finite() || !(0.0..=1.0).contains(&judgment.confidence) {
            return Err(OracleError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                judgment.confidence
            )));
        }
        if judgment.confidence < self.config.oracle_confidence_floor {
            return Err(OracleError::InvalidResponse(format!(
                "confidence {} below floor {}",
                judgment.confidence, self.config.oracle_confidence_floor
            )));
        }

        let mut seen_ids = HashSet::new();
        let mut issues = Vec::with_capacity(judgment.issues.len());
        for (idx, judged) in judgment.issues.into_iter().enumerate() {
            if let Some(unknown) = judged.truck_ids.iter().find(|id| snapshot.truck(id).is_none()) {
                return Err(OracleError::InvalidResponse(format!("unknown truck {unknown}")));
            }
            if let Some(unknown) = judged.load_ids.iter().find(|id| snapshot.load(id).is_none()) {
                return Err(OracleError::InvalidResponse(format!("unknown load {unknown}")));
            }

            let subject = judged
                .truck_ids
                .first()
                .or_else(|| judged.load_ids.first())
                .cloned()
                .unwrap_or_else(|| idx.to_string());
            let mut id = format!("ISSUE-{}-{}", judged.issue_type.tag(), subject);
            if !seen_ids.insert(id.clone()) {
                id = format!("{id}-{idx}");
                seen_ids.insert(id.clone());
            }

            issues.push(Issue {
                id,
                issue_type: judged.issue_type,
                severity: judged.severity,
                description: judged.description,
                truck_ids: judged.truck_ids,
                load_ids: judged.load_ids,
                detected_at: snapshot.taken_at,
                confidence: judgment.confidence,
                source: JudgmentSource::Oracle,
                resolved: false,
            });
        }
        sort_issues(&mut issues);

        Ok(ReasoningResult {
            issues,
            risk_assessment: judgment.risk_assessment,
            recommendations: judgment.recommendations,
            confidence: judgment.confidence,
            source: JudgmentSource::Oracle,
            fallback_reason: None,
        })
    }

    /// Deterministic rule-based detection.
    pub fn fallback(&self, snapshot: &FleetSnapshot, reason: impl Into<String>) -> ReasoningResult {
        let now = snapshot.taken_at;
        let confidence = self.config.fallback_confidence;
        let traffic = snapshot.traffic_index();
        let mut issues = Vec::new();

        let mut issue = |issue_type: IssueType,
                         subject: &str,
                         severity: Severity,
                         description: String,
                         truck_ids: Vec<String>,
                         load_ids: Vec<String>| {
            issues.push(Issue {
                id: format!("ISSUE-{}-{}", issue_type.tag(), subject),
                issue_type,
                severity,
                description,
                truck_ids,
                load_ids,
                detected_at: now,
                confidence,
                source: JudgmentSource::Rules,
                resolved: false,
            });
        };

        for truck in &snapshot.trucks {
            let carries_urgent = carries_time_critical(truck, snapshot);
            let stationary = truck.stationary_minutes(now);
            let moving_expected = !matches!(
                truck.status,
                TruckStatus::Maintenance | TruckStatus::Loading | TruckStatus::Unloading
            );

            if truck.status == TruckStatus::Stuck
                || (moving_expected && truck.is_loaded() && stationary > self.config.stationary_threshold_minutes)
            {
                issue(
                    IssueType::StuckTruck,
                    &truck.id,
                    if carries_urgent { Severity::Critical } else { Severity::High },
                    format!(
                        "Truck {} stationary for {:.0} min with {} load(s)",
                        truck.id,
                        stationary,
                        truck.assigned_load_ids.len()
                    ),
                    vec![truck.id.clone()],
                    truck.assigned_load_ids.clone(),
                );
            } else if truck.status == TruckStatus::Delayed {
                issue(
                    IssueType::Delay,
                    &truck.id,
                    if carries_urgent { Severity::High } else { Severity::Medium },
                    format!("Truck {} reported delayed", truck.id),
                    vec![truck.id.clone()],
                    truck.assigned_load_ids.clone(),
                );
            }

            let fuel = truck.fuel_fraction();
            if fuel < self.config.low_fuel_fraction {
                issue(
                    IssueType::LowFuel,
                    &truck.id,
                    if fuel < self.config.low_fuel_fraction / 2.0 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    format!("Truck {} fuel at {:.0}%", truck.id, fuel * 100.0),
                    vec![truck.id.clone()],
                    Vec::new(),
                );
            }

            let congested = congested_segments_on_route(truck, snapshot, &traffic);
            if congested >= self.config.heavy_segment_threshold {
                issue(
                    IssueType::Traffic,
                    &truck.id,
                    Severity::Medium,
                    format!("{congested} congested segments on truck {}'s route", truck.id),
                    vec![truck.id.clone()],
                    truck.assigned_load_ids.clone(),
                );
            }
        }

        let idle_available = snapshot.trucks.iter().any(|t| t.status == TruckStatus::Idle);
        for load in snapshot.loads.iter().filter(|l| l.status == LoadStatus::Unassigned) {
            let closing = load
                .deadline()
                .map(|d| (d - now).num_seconds() as f64 / 60.0)
                .filter(|minutes| *minutes <= self.config.risk_horizon_minutes);

            if let Some(minutes) = closing {
                issue(
                    IssueType::WindowRisk,
                    &load.id,
                    if load.priority.is_time_critical() {
                        Severity::Critical
                    } else {
                        Severity::High
                    },
                    format!(
                        "Unassigned {} load {} window closes in {:.0} min",
                        load.priority, load.id, minutes
                    ),
                    Vec::new(),
                    vec![load.id.clone()],
                );
            } else if load.priority.is_time_critical() {
                let (issue_type, severity, text) = if idle_available {
                    (IssueType::UnassignedLoad, Severity::Medium, "awaiting dispatch")
                } else {
                    (IssueType::CapacityMismatch, Severity::High, "with no idle truck")
                };
                issue(
                    issue_type,
                    &load.id,
                    severity,
                    format!("Unassigned {} load {} {}", load.priority, load.id, text),
                    Vec::new(),
                    vec![load.id.clone()],
                );
            }
        }

        sort_issues(&mut issues);
        let risk_assessment = summarize(&issues);
        let recommendations = recommend(&issues);

        ReasoningResult {
            issues,
            risk_assessment,
            recommendations,
            confidence,
            source: JudgmentSource::Rules,
            fallback_reason: Some(reason.into()),
        }
    }
}

fn carries_time_critical(truck: &Truck, snapshot: &FleetSnapshot) -> bool {
    truck
        .assigned_load_ids
        .iter()
        .filter_map(|id| snapshot.load(id))
        .any(|l| l.priority.is_time_critical())
}

fn congested_segments_on_route(
    truck: &Truck,
    snapshot: &FleetSnapshot,
    traffic: &crate::domain::models::TrafficIndex,
) -> usize {
    let stops = snapshot.planned_stops(&truck.id);
    let mut from = truck.id.as_str();
    let mut count = 0;
    for stop in &stops {
        if traffic
            .get(&segment_key(from, &stop.id))
            .is_some_and(|level| level.is_congested())
        {
            count += 1;
        }
        from = stop.id.as_str();
    }
    count
}

fn summarize(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "No issues detected by rule-based checks".to_string();
    }
    let critical = issues.iter().filter(|i| i.severity == Severity::Critical).count();
    let high = issues.iter().filter(|i| i.severity == Severity::High).count();
    format!(
        "{} issue(s) detected by rule-based checks ({} critical, {} high)",
        issues.len(),
        critical,
        high
    )
}

fn recommend(issues: &[Issue]) -> Vec<String> {
    let mut seen = HashSet::new();
    issues
        .iter()
        .filter(|i| seen.insert(i.issue_type))
        .map(|i| {
            match i.issue_type {
                IssueType::StuckTruck => "Consider rerouting or reassigning loads from stationary trucks",
                IssueType::Delay => "Notify affected customers of delays",
                IssueType::Traffic => "Reroute around congested segments",
                IssueType::LowFuel => "Schedule refuelling before further dispatch",
                IssueType::CapacityMismatch => "Escalate capacity shortfall for urgent loads",
                IssueType::UnassignedLoad | IssueType::WindowRisk => "Dispatch trucks to at-risk loads",
                IssueType::Other => "Review flagged conditions",
            }
            .to_string()
        })
        .collect()
}
