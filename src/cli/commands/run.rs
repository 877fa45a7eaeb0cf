//! `fleet-loop run`: drive the loop and take operator commands from stdin.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use uuid::Uuid;

use super::build_loop;
use crate::adapters::InMemoryFleetStore;
use crate::application::{LoopService, LoopStatus};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, ObservedOutcome};
use crate::services::{EventPayload, FleetEvent};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Fleet file (YAML or JSON) seeding trucks, loads, routes and traffic
    #[arg(short, long)]
    pub fleet: PathBuf,

    /// Stop after this many cycles
    #[arg(long)]
    pub max_cycles: Option<u64>,

    /// Seconds between cycles
    #[arg(long)]
    pub interval: Option<u64>,

    /// Execute low-confidence decisions without waiting for approval
    #[arg(long)]
    pub auto_approve: bool,

    /// Journal cycle records under the configured state directory
    #[arg(long)]
    pub persist: bool,
}

/// A line typed by the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Approve(Uuid, Option<String>),
    Reject(Uuid, Option<String>),
    Stop { immediate: bool },
    Status,
    Outcome(ObservedOutcome),
}

impl OperatorCommand {
    /// Parse `approve <id> [reason]`, `reject <id> [reason]`, `stop [now]`,
    /// `status` or `outcome <id> <minutes> <cost> ok|fail`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let rest: Vec<&str> = words.collect();
        let reason = |from: usize| {
            let text = rest.get(from..).map(|w| w.join(" ")).unwrap_or_default();
            (!text.is_empty()).then_some(text)
        };

        match verb {
            "approve" | "reject" => {
                let id = parse_id(rest.first())?;
                Ok(if verb == "approve" {
                    Self::Approve(id, reason(1))
                } else {
                    Self::Reject(id, reason(1))
                })
            }
            "stop" => match rest.as_slice() {
                [] => Ok(Self::Stop { immediate: false }),
                ["now"] => Ok(Self::Stop { immediate: true }),
                _ => Err("usage: stop [now]".to_string()),
            },
            "status" => Ok(Self::Status),
            "outcome" => {
                let [id, minutes, cost, verdict] = rest.as_slice() else {
                    return Err("usage: outcome <decision-id> <minutes> <cost> ok|fail".to_string());
                };
                let succeeded = match *verdict {
                    "ok" => true,
                    "fail" => false,
                    other => return Err(format!("expected ok or fail, got {other}")),
                };
                Ok(Self::Outcome(ObservedOutcome {
                    decision_id: parse_id(Some(id))?,
                    actual_time_min: parse_number(minutes)?,
                    actual_cost: parse_number(cost)?,
                    succeeded,
                    observed_at: Utc::now(),
                }))
            }
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn parse_id(word: Option<&&str>) -> Result<Uuid, String> {
    let word = word.ok_or_else(|| "missing decision id".to_string())?;
    Uuid::parse_str(word).map_err(|e| format!("invalid decision id {word}: {e}"))
}

fn parse_number(word: &str) -> Result<f64, String> {
    word.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| format!("expected a non-negative number, got {word}"))
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    command: &'static str,
    ok: bool,
    message: String,
}

impl CommandOutput for CommandResponse {
    fn to_human(&self) -> String {
        if self.ok {
            self.message.clone()
        } else {
            format!("{} failed: {}", self.command, self.message)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct StatusOutput(LoopStatus);

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let s = &self.0;
        let w = &s.weights;
        format!(
            "running={} cycles={} health={} success_rate={:.2} pending_approvals={} degraded={}\n\
             weights: cost={:.3} time={:.3} reliability={:.3} fuel={:.3}",
            s.running,
            s.cycles_completed,
            s.health.as_str(),
            s.success_rate,
            s.pending_approvals,
            s.persistence_degraded,
            w.cost,
            w.time,
            w.reliability,
            w.fuel,
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct EventOutput(FleetEvent);

impl CommandOutput for EventOutput {
    fn to_human(&self) -> String {
        describe(&self.0.payload).unwrap_or_default()
    }
}

/// One-line summary of the events an operator acts on.
fn describe(payload: &EventPayload) -> Option<String> {
    let line = match payload {
        EventPayload::CycleCompleted {
            cycle_number,
            issues,
            decisions,
            applied,
            health,
            ..
        } => format!(
            "cycle {cycle_number}: {issues} issues, {decisions} decisions, {applied} applied, health {}",
            health.as_str()
        ),
        EventPayload::DecisionDeferred { decision_id, reason } => {
            format!("decision {decision_id} awaiting approval: {reason}")
        }
        EventPayload::DecisionRejected { decision_id, reason } => {
            format!("decision {decision_id} rejected: {reason}")
        }
        EventPayload::ApprovalExpired { decision_id, .. } => {
            format!("decision {decision_id} expired without approval")
        }
        EventPayload::PersistenceDegraded { error, .. } => {
            format!("persistence degraded, continuing in memory: {error}")
        }
        EventPayload::LoopStopped {
            reason,
            cycles_completed,
            ..
        } => format!("loop stopped after {cycles_completed} cycles: {reason}"),
        _ => return None,
    };
    Some(line)
}

pub async fn execute(args: RunArgs, config: &Config, json_mode: bool) -> Result<()> {
    let (store, control) = build_loop(config, &args.fleet, args.persist).await?;
    let service = LoopService::new(control, config.control.clone());
    let mut events = service.subscribe();

    service
        .start(
            args.max_cycles,
            args.interval,
            args.auto_approve.then_some(true),
        )
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let stopped = matches!(event.payload, EventPayload::LoopStopped { .. });
                    if json_mode || describe(&event.payload).is_some() {
                        output(&EventOutput(event), json_mode);
                    }
                    if stopped {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => handle_line(&service, &store, &line, json_mode).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = service.stop(Some("interrupted".to_string()), true).await {
                    warn!(error = %e, "interrupt received while loop not running");
                    break;
                }
            }
        }
    }

    service.wait().await?;
    output(&StatusOutput(service.status().await), json_mode);
    Ok(())
}

async fn handle_line(service: &LoopService, store: &InMemoryFleetStore, line: &str, json_mode: bool) {
    let response = match OperatorCommand::parse(line) {
        Err(message) => CommandResponse {
            command: "parse",
            ok: false,
            message,
        },
        Ok(OperatorCommand::Status) => {
            output(&StatusOutput(service.status().await), json_mode);
            return;
        }
        Ok(OperatorCommand::Approve(id, reason)) => respond(
            "approve",
            service.approve(id, true, reason).await.map(|_| format!("decision {id} approved")),
        ),
        Ok(OperatorCommand::Reject(id, reason)) => respond(
            "reject",
            service.approve(id, false, reason).await.map(|_| format!("decision {id} rejected")),
        ),
        Ok(OperatorCommand::Stop { immediate }) => respond(
            "stop",
            service
                .stop(Some("operator stop".to_string()), immediate)
                .await
                .map(|()| if immediate { "stopping now" } else { "stopping after this cycle" }.to_string()),
        ),
        Ok(OperatorCommand::Outcome(outcome)) => {
            let id = outcome.decision_id;
            store.record_outcome(outcome).await;
            CommandResponse {
                command: "outcome",
                ok: true,
                message: format!("outcome recorded for decision {id}"),
            }
        }
    };
    output(&response, json_mode);
}

fn respond<E: std::fmt::Display>(command: &'static str, result: Result<String, E>) -> CommandResponse {
    match result {
        Ok(message) => CommandResponse {
            command,
            ok: true,
            message,
        },
        Err(e) => CommandResponse {
            command,
            ok: false,
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_approve_with_reason() {
        let id = Uuid::new_v4();
        let cmd = OperatorCommand::parse(&format!("approve {id} looks fine")).unwrap();
        assert_eq!(cmd, OperatorCommand::Approve(id, Some("looks fine".into())));
    }

    #[test]
    fn test_parse_reject_without_reason() {
        let id = Uuid::new_v4();
        assert_eq!(
            OperatorCommand::parse(&format!("reject {id}")).unwrap(),
            OperatorCommand::Reject(id, None)
        );
    }

    #[test]
    fn test_parse_stop_variants() {
        assert_eq!(
            OperatorCommand::parse("stop").unwrap(),
            OperatorCommand::Stop { immediate: false }
        );
        assert_eq!(
            OperatorCommand::parse("stop now").unwrap(),
            OperatorCommand::Stop { immediate: true }
        );
        assert!(OperatorCommand::parse("stop later").is_err());
    }

    #[test]
    fn test_parse_outcome() {
        let id = Uuid::new_v4();
        match OperatorCommand::parse(&format!("outcome {id} 42.5 120 fail")).unwrap() {
            OperatorCommand::Outcome(o) => {
                assert_eq!(o.decision_id, id);
                assert!((o.actual_time_min - 42.5).abs() < f64::EPSILON);
                assert!(!o.succeeded);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(OperatorCommand::parse(&format!("outcome {id} -1 120 ok")).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OperatorCommand::parse("approve not-a-uuid").is_err());
        assert!(OperatorCommand::parse("launch").is_err());
        assert!(OperatorCommand::parse("   ").is_err());
    }

    #[test]
    fn test_describe_skips_noise() {
        let payload = EventPayload::DecisionDeferred {
            decision_id: Uuid::nil(),
            reason: "high-impact action".into(),
        };
        assert!(describe(&payload).unwrap().contains("awaiting approval"));
        let noise = EventPayload::LoopStarted {
            max_cycles: None,
            cycle_interval_seconds: 5,
            auto_approve: false,
        };
        assert!(describe(&noise).is_none());
    }
}
