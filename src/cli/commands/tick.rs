//! `fleet-loop tick`: run one cycle and report it.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::build_loop;
use crate::application::LoopService;
use crate::cli::output::{list_table, output, truncate, CommandOutput};
use crate::domain::models::{ActionStatus, Config, ControlLoopState};

#[derive(Args, Debug)]
pub struct TickArgs {
    /// Fleet file (YAML or JSON) seeding trucks, loads, routes and traffic
    #[arg(short, long)]
    pub fleet: PathBuf,

    /// Execute low-confidence decisions without waiting for approval
    #[arg(long)]
    pub auto_approve: bool,

    /// Journal the cycle record under the configured state directory
    #[arg(long)]
    pub persist: bool,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct CycleReport(pub ControlLoopState);

impl CommandOutput for CycleReport {
    fn to_human(&self) -> String {
        let state = &self.0;
        let mut lines = vec![format!("Cycle {} ({})", state.cycle_number, state.cycle_id)];

        if let Some(reasoning) = &state.reasoning {
            let source = if reasoning.used_fallback() { "rules" } else { "oracle" };
            lines.push(format!(
                "Reasoning: {} issues via {} (confidence {:.2})",
                reasoning.issues.len(),
                source,
                reasoning.confidence
            ));
            lines.push(format!("Risk: {}", reasoning.risk_assessment));
        }
        if let Some(error) = &state.error_message {
            lines.push(format!("Errors: {error}"));
        }
        if state.persistence_degraded {
            lines.push("Persistence degraded; results held in memory only".to_string());
        }

        if state.decisions.is_empty() {
            lines.push("No decisions.".to_string());
        } else {
            let mut table = list_table(&["Decision", "Issue", "Action", "Score", "Approval", "Result"]);
            for decision in &state.decisions {
                let result = state
                    .action_results
                    .iter()
                    .find(|r| r.decision_id == decision.id)
                    .map_or("-", |r| r.status.as_str());
                table.add_row(vec![
                    decision.id.to_string(),
                    decision.issue_id.clone(),
                    truncate(&decision.scenario.name, 40),
                    format!("{:.3}", decision.score),
                    decision.approval.as_str().to_string(),
                    result.to_string(),
                ]);
            }
            lines.push(table.to_string());
        }

        let applied = state
            .action_results
            .iter()
            .filter(|r| r.status == ActionStatus::Applied)
            .count();
        lines.push(format!(
            "{} scenarios, {} decisions, {} applied{}",
            state.scenarios.len(),
            state.decisions.len(),
            applied,
            if state.requires_human_intervention {
                ", approval required"
            } else {
                ""
            }
        ));
        lines.join("\n")
    }
}

pub async fn execute(args: TickArgs, config: &Config, json_mode: bool) -> Result<()> {
    let mut config = config.clone();
    config.control.auto_approve |= args.auto_approve;

    let (_store, control) = build_loop(&config, &args.fleet, args.persist).await?;
    let service = LoopService::new(control, config.control.clone());
    let state = service.tick().await?;
    output(&CycleReport(state), json_mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cycle_report() {
        let report = CycleReport(ControlLoopState::new(1));
        let human = report.to_human();
        assert!(human.starts_with("Cycle 1"));
        assert!(human.contains("No decisions."));
        assert_eq!(report.to_json()["cycle_number"], 1);
    }
}
