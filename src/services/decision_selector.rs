//! Decision selector.
//!
//! Scores scenarios with the current [`ScoringWeights`] and picks one winner
//! per issue. A score depends only on the scenario's own estimates and the
//! weights passed in.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{
    ActionType, ApprovalState, Decision, DecisionConfig, DecisionResult, Issue, JudgmentSource,
    Scenario, ScoredScenario, ScoringWeights,
};

const SCORE_EPSILON: f64 = 1e-9;

/// Weighted score of one scenario.
pub fn score_scenario(scenario: &Scenario, weights: &ScoringWeights) -> f64 {
    let cost = 1.0 / (1.0 + scenario.estimated_cost / 100.0);
    let time = 1.0 / (1.0 + scenario.estimated_time_min / 60.0);
    let fuel = 1.0 / (1.0 + scenario.estimated_fuel_l / 10.0);
    weights.cost * cost + weights.time * time + weights.fuel * fuel + weights.reliability * scenario.reliability
}

/// Picks and flags decisions.
#[derive(Debug, Clone)]
pub struct DecisionSelector {
    config: DecisionConfig,
    auto_approve: bool,
}

impl DecisionSelector {
    pub fn new(config: DecisionConfig, auto_approve: bool) -> Self {
        Self {
            config,
            auto_approve,
        }
    }

    pub fn set_auto_approve(&mut self, auto_approve: bool) {
        self.auto_approve = auto_approve;
    }

    /// One result per issue that has scenarios, in first-seen issue order.
    ///
    /// `issues` supplies each issue's source so rule-derived decisions can be
    /// flagged for oracle verification.
    pub fn select(
        &self,
        scenarios: &[Scenario],
        issues: &[Issue],
        weights: &ScoringWeights,
    ) -> Vec<DecisionResult> {
        let mut order: Vec<&str> = Vec::new();
        let mut grouped: HashMap<&str, Vec<&Scenario>> = HashMap::new();
        for scenario in scenarios {
            let entry = grouped.entry(scenario.issue_id.as_str()).or_default();
            if entry.is_empty() {
                order.push(scenario.issue_id.as_str());
            }
            entry.push(scenario);
        }

        order
            .into_iter()
            .map(|issue_id| {
                let issue = issues.iter().find(|i| i.id == issue_id);
                let group = grouped.remove(issue_id).unwrap_or_default();
                self.select_for_issue(issue_id, issue, group, weights)
            })
            .collect()
    }

    fn select_for_issue(
        &self,
        issue_id: &str,
        issue: Option<&Issue>,
        group: Vec<&Scenario>,
        weights: &ScoringWeights,
    ) -> DecisionResult {
        let mut scored: Vec<(&Scenario, f64)> = group
            .into_iter()
            .filter(|s| s.estimates_valid())
            .map(|s| (s, score_scenario(s, weights)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| rank(a, *sa, b, *sb));

        let mut ranked = scored.into_iter();
        let Some((winner, score)) = ranked.next() else {
            return DecisionResult {
                issue_id: issue_id.to_string(),
                selected: None,
                alternatives: Vec::new(),
                requires_human_approval: false,
            };
        };
        let alternatives = ranked
            .map(|(s, score)| ScoredScenario {
                scenario_id: s.id.clone(),
                score,
                confidence: s.reliability,
            })
            .collect();

        let decision = self.decide(winner, score, issue);
        debug!(
            issue_id,
            scenario_id = %winner.id,
            score,
            approval = decision.approval.as_str(),
            "scenario selected"
        );

        DecisionResult {
            issue_id: issue_id.to_string(),
            requires_human_approval: decision.requires_human_approval,
            selected: Some(decision),
            alternatives,
        }
    }

    fn decide(&self, scenario: &Scenario, score: f64, issue: Option<&Issue>) -> Decision {
        let confidence = scenario.reliability;
        let low_confidence = confidence < self.config.approval_threshold;
        let high_impact = self.is_high_impact(scenario);

        let mut reasons = Vec::new();
        if low_confidence {
            reasons.push(format!(
                "confidence {confidence:.2} below {:.2}",
                self.config.approval_threshold
            ));
        }
        if high_impact {
            reasons.push("high-impact action".to_string());
        }

        let requires_approval = !reasons.is_empty();
        let approval = if !requires_approval {
            ApprovalState::NotRequired
        } else if self.auto_approve && !high_impact {
            ApprovalState::Approved
        } else {
            ApprovalState::Pending
        };

        Decision {
            id: Uuid::new_v4(),
            issue_id: scenario.issue_id.clone(),
            rationale: format!(
                "Selected {}: score={score:.3}, reliability={:.2}, cost={:.1}, time={:.0} min",
                scenario.name, scenario.reliability, scenario.estimated_cost, scenario.estimated_time_min
            ),
            scenario: scenario.clone(),
            score,
            confidence,
            requires_oracle_verification: issue.map_or(true, |i| i.source == JudgmentSource::Rules),
            requires_human_approval: approval == ApprovalState::Pending,
            approval,
            approval_reason: requires_approval.then(|| reasons.join(", ")),
            created_at: Utc::now(),
        }
    }

    fn is_high_impact(&self, scenario: &Scenario) -> bool {
        match scenario.action_type() {
            Some(ActionType::Escalate) => true,
            Some(ActionType::Reassign | ActionType::Dispatch) => scenario
                .primary_action()
                .and_then(|a| a.load_priority())
                .is_some_and(|p| p >= self.config.high_impact_priority),
            _ => false,
        }
    }
}

/// Higher score first, then lower cost, then menu order.
fn rank(a: &Scenario, score_a: f64, b: &Scenario, score_b: f64) -> Ordering {
    if (score_a - score_b).abs() > SCORE_EPSILON {
        return score_b.total_cmp(&score_a);
    }
    if (a.estimated_cost - b.estimated_cost).abs() > SCORE_EPSILON {
        return a.estimated_cost.total_cmp(&b.estimated_cost);
    }
    a.sequence.cmp(&b.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Action, IssueType, LoadPriority, Severity};

    fn scenario(issue: &str, seq: usize, action: Action, cost: f64, time: f64, reliability: f64) -> Scenario {
        Scenario {
            id: format!("SCEN-{issue}-{seq}"),
            issue_id: issue.to_string(),
            name: format!("option {seq}"),
            description: String::new(),
            actions: vec![action],
            estimated_cost: cost,
            estimated_time_min: time,
            estimated_fuel_l: 5.0,
            reliability,
            feasibility_violated: false,
            sequence: seq,
        }
    }

    fn wait() -> Action {
        Action::Wait {
            truck_id: Some("T1".into()),
            duration_minutes: 30.0,
        }
    }

    fn issue(id: &str, source: JudgmentSource) -> Issue {
        Issue {
            id: id.into(),
            issue_type: IssueType::StuckTruck,
            severity: Severity::High,
            description: String::new(),
            truck_ids: vec!["T1".into()],
            load_ids: vec![],
            detected_at: Utc::now(),
            confidence: 0.9,
            source,
            resolved: false,
        }
    }

    fn selector() -> DecisionSelector {
        DecisionSelector::new(DecisionConfig::default(), false)
    }

    #[test]
    fn test_picks_highest_score_per_issue() {
        let scenarios = vec![
            scenario("I1", 0, wait(), 100.0, 90.0, 0.7),
            scenario("I1", 1, wait(), 40.0, 30.0, 0.9),
            scenario("I2", 0, wait(), 10.0, 10.0, 0.8),
        ];
        let results = selector().select(
            &scenarios,
            &[issue("I1", JudgmentSource::Oracle), issue("I2", JudgmentSource::Oracle)],
            &ScoringWeights::default(),
        );

        assert_eq!(results.len(), 2);
        let first = results[0].selected.as_ref().unwrap();
        assert_eq!(first.scenario.id, "SCEN-I1-1");
        assert_eq!(results[0].alternatives.len(), 1);
        assert!(!first.requires_human_approval);
        assert!(!first.requires_oracle_verification);
    }

    #[test]
    fn test_ties_break_on_cost_then_order() {
        let a = scenario("I1", 0, wait(), 50.0, 30.0, 0.8);
        let mut b = scenario("I1", 1, wait(), 50.0, 30.0, 0.8);
        b.id = "SCEN-I1-B".into();

        let results = selector().select(&[b.clone(), a.clone()], &[], &ScoringWeights::default());
        assert_eq!(results[0].selected.as_ref().unwrap().scenario.id, a.id);

        // Same score but cheaper: zero the cost weight so cost cannot move the score.
        let weights = ScoringWeights {
            cost: 0.0,
            time: 0.5,
            reliability: 0.5,
            fuel: 0.0,
        };
        let mut cheap = b.clone();
        cheap.estimated_cost = 10.0;
        let results = selector().select(&[a.clone(), cheap.clone()], &[], &weights);
        assert_eq!(results[0].selected.as_ref().unwrap().scenario.id, cheap.id);
    }

    #[test]
    fn test_low_confidence_requires_approval() {
        let results = selector().select(
            &[scenario("I1", 0, wait(), 10.0, 10.0, 0.4)],
            &[issue("I1", JudgmentSource::Rules)],
            &ScoringWeights::default(),
        );
        let decision = results[0].selected.as_ref().unwrap();
        assert!(results[0].requires_human_approval);
        assert_eq!(decision.approval, ApprovalState::Pending);
        assert!(decision.requires_oracle_verification);
    }

    #[test]
    fn test_auto_approve_skips_only_low_confidence() {
        let auto = DecisionSelector::new(DecisionConfig::default(), true);
        let low = auto.select(&[scenario("I1", 0, wait(), 10.0, 10.0, 0.4)], &[], &ScoringWeights::default());
        assert_eq!(low[0].selected.as_ref().unwrap().approval, ApprovalState::Approved);
        assert!(!low[0].requires_human_approval);

        let critical_reassign = Action::Reassign {
            load_id: "L1".into(),
            from_truck_id: Some("T1".into()),
            to_truck_id: "T2".into(),
            load_priority: LoadPriority::Critical,
        };
        let high = auto.select(
            &[scenario("I1", 0, critical_reassign, 10.0, 10.0, 0.95)],
            &[],
            &ScoringWeights::default(),
        );
        assert_eq!(high[0].selected.as_ref().unwrap().approval, ApprovalState::Pending);
        assert!(high[0].requires_human_approval);
    }

    #[test]
    fn test_escalation_always_needs_approval() {
        let escalate = Action::Escalate {
            reason: "no trucks".into(),
        };
        let results = selector().select(
            &[scenario("I1", 0, escalate, 0.0, 15.0, 0.9)],
            &[],
            &ScoringWeights::default(),
        );
        assert!(results[0].requires_human_approval);
    }

    #[test]
    fn test_invalid_estimates_are_skipped() {
        let mut bad = scenario("I1", 0, wait(), 10.0, 10.0, 0.9);
        bad.estimated_cost = f64::NAN;
        let results = selector().select(&[bad], &[], &ScoringWeights::default());
        assert!(results[0].selected.is_none());
    }

    #[test]
    fn test_score_uses_only_scenario_fields() {
        let s = scenario("I1", 0, wait(), 100.0, 60.0, 0.5);
        let w = ScoringWeights::default();
        let expected = 0.25 * 0.5 + 0.35 * 0.5 + 0.10 * (1.0 / 1.5) + 0.30 * 0.5;
        assert!((score_scenario(&s, &w) - expected).abs() < 1e-12);
    }
}
