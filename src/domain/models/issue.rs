//! Issues detected by the reasoning stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a detected problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    StuckTruck,
    Delay,
    Traffic,
    LowFuel,
    CapacityMismatch,
    UnassignedLoad,
    WindowRisk,
    Other,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StuckTruck => "stuck_truck",
            Self::Delay => "delay",
            Self::Traffic => "traffic",
            Self::LowFuel => "low_fuel",
            Self::CapacityMismatch => "capacity_mismatch",
            Self::UnassignedLoad => "unassigned_load",
            Self::WindowRisk => "window_risk",
            Self::Other => "other",
        }
    }

    /// Short tag used in deterministic ids.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StuckTruck => "STUCK",
            Self::Delay => "DELAY",
            Self::Traffic => "TRAFFIC",
            Self::LowFuel => "FUEL",
            Self::CapacityMismatch => "CAPACITY",
            Self::UnassignedLoad => "UNASSIGNED",
            Self::WindowRisk => "WINDOW",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Issue severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an issue or judgment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentSource {
    Oracle,
    Rules,
}

/// A detected problem or opportunity requiring a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// `ISSUE-<TAG>-<subject>`, stable across cycles for the same problem.
    pub id: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub truck_ids: Vec<String>,
    #[serde(default)]
    pub load_ids: Vec<String>,
    pub detected_at: DateTime<Utc>,
    /// Trust in the judgment, in [0, 1]; scales scenario reliability.
    pub confidence: f64,
    pub source: JudgmentSource,
    #[serde(default)]
    pub resolved: bool,
}

impl Issue {
    /// First truck referenced, the one the scenario menu is built around.
    pub fn primary_truck(&self) -> Option<&str> {
        self.truck_ids.first().map(String::as_str)
    }

    pub fn primary_load(&self) -> Option<&str> {
        self.load_ids.first().map(String::as_str)
    }
}

/// Output of the reasoning stage for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResult {
    /// Sorted most severe first.
    pub issues: Vec<Issue>,
    pub risk_assessment: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub confidence: f64,
    pub source: JudgmentSource,
    /// Why the oracle judgment was not used, when the rules ran instead.
    #[serde(default)]
    pub fallback_reason: Option<String>,
}

impl ReasoningResult {
    /// An empty result used when the phase degrades.
    pub fn empty(reason: impl Into<String>) -> Self {
        Self {
            issues: Vec::new(),
            risk_assessment: "no assessment".to_string(),
            recommendations: Vec::new(),
            confidence: 0.0,
            source: JudgmentSource::Rules,
            fallback_reason: Some(reason.into()),
        }
    }

    /// Issues came from the built-in rules.
    pub fn used_fallback(&self) -> bool {
        self.source == JudgmentSource::Rules
    }
}

/// Order issues most severe first, then by id for determinism.
pub fn sort_issues(issues: &mut [Issue]) {
    issues.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, severity: Severity) -> Issue {
        Issue {
            id: id.to_string(),
            issue_type: IssueType::Other,
            severity,
            description: String::new(),
            truck_ids: vec![],
            load_ids: vec![],
            detected_at: Utc::now(),
            confidence: 0.3,
            source: JudgmentSource::Rules,
            resolved: false,
        }
    }

    #[test]
    fn test_sort_issues_by_severity_then_id() {
        let mut issues = vec![
            issue("B", Severity::Medium),
            issue("C", Severity::Critical),
            issue("A", Severity::Medium),
        ];
        sort_issues(&mut issues);
        let ids: Vec<_> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_issue_type_serializes_snake_case() {
        let json = serde_json::to_string(&IssueType::StuckTruck).unwrap();
        assert_eq!(json, "\"stuck_truck\"");
    }
}
