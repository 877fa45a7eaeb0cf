//! Command surface for the control loop.
//!
//! `LoopService` owns the background task that runs cycles on a timer and
//! exposes the operator commands: start, stop, approve and status. A single
//! cycle can also be run in the foreground with `tick` while the loop is idle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::select;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use super::control_loop::{ControlLoop, StopSignal};
use crate::domain::models::{
    ApprovalState, ControlLoopState, LoopConfig, ScoringWeights, SystemHealth,
};
use crate::services::{ApprovalError, ApprovalQueue, EventBus, EventPayload, FleetEvent};

/// Why a command was refused.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("The control loop is already running")]
    AlreadyRunning,

    #[error("The control loop is not running")]
    NotRunning,

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("Control loop task failed: {0}")]
    TaskFailed(String),
}

/// Point-in-time view of the loop for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub cycles_completed: u64,
    pub health: SystemHealth,
    pub success_rate: f64,
    pub weights: ScoringWeights,
    pub pending_approvals: usize,
    pub persistence_degraded: bool,
    pub last_cycle_id: Option<Uuid>,
    pub stop_reason: Option<String>,
}

impl LoopStatus {
    fn idle(control: &ControlLoop) -> Self {
        Self {
            running: false,
            cycles_completed: control.cycles_completed(),
            health: control.health(),
            success_rate: control.success_rate(),
            weights: control.weights(),
            pending_approvals: 0,
            persistence_degraded: false,
            last_cycle_id: None,
            stop_reason: None,
        }
    }

    fn record_cycle(&mut self, control: &ControlLoop, state: &ControlLoopState) {
        self.cycles_completed = control.cycles_completed();
        self.health = control.health();
        self.success_rate = control.success_rate();
        self.weights = control.weights();
        self.persistence_degraded = state.persistence_degraded;
        self.last_cycle_id = Some(state.cycle_id);
    }
}

/// Owns a [`ControlLoop`] and runs it on demand.
pub struct LoopService {
    defaults: LoopConfig,
    bus: Arc<EventBus>,
    approvals: Arc<Mutex<ApprovalQueue>>,
    stop: Arc<StopSignal>,
    status: Arc<RwLock<LoopStatus>>,
    idle: Mutex<Option<ControlLoop>>,
    running: Mutex<Option<JoinHandle<ControlLoop>>>,
}

impl LoopService {
    /// `defaults` supplies the run parameters `start` leaves unset.
    pub fn new(control: ControlLoop, defaults: LoopConfig) -> Self {
        Self {
            defaults,
            bus: control.bus(),
            approvals: control.approvals(),
            stop: control.stop_signal(),
            status: Arc::new(RwLock::new(LoopStatus::idle(&control))),
            idle: Mutex::new(Some(control)),
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.bus.subscribe()
    }

    /// Start cycling in the background.
    pub async fn start(
        &self,
        max_cycles: Option<u64>,
        cycle_interval_seconds: Option<u64>,
        auto_approve: Option<bool>,
    ) -> Result<(), CommandError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CommandError::AlreadyRunning);
        }
        if let Some(finished) = running.take() {
            self.reclaim(finished).await?;
        }
        let mut control = self.idle.lock().await.take().ok_or(CommandError::AlreadyRunning)?;

        let max_cycles = max_cycles.or(self.defaults.max_cycles);
        let interval = cycle_interval_seconds.unwrap_or(self.defaults.cycle_interval_seconds);
        let auto_approve = auto_approve.unwrap_or(self.defaults.auto_approve);
        control.begin_run(max_cycles, auto_approve);

        {
            let mut status = self.status.write().await;
            status.running = true;
            status.stop_reason = None;
        }
        info!(?max_cycles, interval, auto_approve, "control loop starting");
        self.bus
            .emit(EventPayload::LoopStarted {
                max_cycles,
                cycle_interval_seconds: interval,
                auto_approve,
            })
            .await;

        *running = Some(tokio::spawn(drive(
            control,
            Duration::from_secs(interval),
            Arc::clone(&self.status),
            Arc::clone(&self.approvals),
        )));
        Ok(())
    }

    /// Ask the running loop to stop.
    ///
    /// A graceful stop lets the current cycle finish; an immediate stop ends
    /// it after the phase in progress. Either way no mutation is left half
    /// applied.
    pub async fn stop(&self, reason: Option<String>, immediate: bool) -> Result<(), CommandError> {
        let running = self.running.lock().await;
        if !running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CommandError::NotRunning);
        }
        let reason = reason.unwrap_or_else(|| "operator stop".to_string());
        info!(reason = %reason, immediate, "stop requested");
        self.status.write().await.stop_reason = Some(reason);
        self.stop.request(immediate);
        Ok(())
    }

    /// Wait for the background run to end.
    pub async fn wait(&self) -> Result<(), CommandError> {
        let handle = self.running.lock().await.take();
        match handle {
            Some(handle) => self.reclaim(handle).await,
            None => Ok(()),
        }
    }

    async fn reclaim(&self, handle: JoinHandle<ControlLoop>) -> Result<(), CommandError> {
        let control = handle
            .await
            .map_err(|e| CommandError::TaskFailed(e.to_string()))?;
        *self.idle.lock().await = Some(control);
        Ok(())
    }

    /// Answer a deferred decision.
    pub async fn approve(
        &self,
        decision_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Result<ApprovalState, CommandError> {
        let state = self
            .approvals
            .lock()
            .await
            .approve(decision_id, approved, reason.clone(), Utc::now())?;

        if state == ApprovalState::Rejected {
            self.bus
                .emit(EventPayload::DecisionRejected {
                    decision_id,
                    reason: reason.unwrap_or_else(|| "rejected by operator".to_string()),
                })
                .await;
        }
        self.status.write().await.pending_approvals = self.approvals.lock().await.len();
        Ok(state)
    }

    pub async fn status(&self) -> LoopStatus {
        let mut status = self.status.read().await.clone();
        status.pending_approvals = self.approvals.lock().await.len();
        status
    }

    /// Run one cycle in the foreground. Refused while a run is active.
    pub async fn tick(&self) -> Result<ControlLoopState, CommandError> {
        let running = self.running.lock().await;
        if running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CommandError::AlreadyRunning);
        }
        drop(running);
        self.wait().await?;

        let mut idle = self.idle.lock().await;
        let control = idle.as_mut().ok_or(CommandError::AlreadyRunning)?;
        let state = control.run_cycle().await;
        self.status.write().await.record_cycle(control, &state);
        Ok(state)
    }
}

async fn drive(
    mut control: ControlLoop,
    interval: Duration,
    status: Arc<RwLock<LoopStatus>>,
    approvals: Arc<Mutex<ApprovalQueue>>,
) -> ControlLoop {
    let stop = control.stop_signal();
    let bus = control.bus();
    let mut wake = stop.subscribe();

    loop {
        let state = control.run_cycle().await;
        {
            let mut status = status.write().await;
            status.record_cycle(&control, &state);
            status.pending_approvals = approvals.lock().await.len();
        }
        if !state.continue_loop || stop.is_requested() {
            break;
        }

        select! {
            () = sleep(interval) => {}
            woke = wake.recv() => {
                if let Err(e) = woke {
                    warn!(error = %e, "stop channel closed");
                }
            }
        }
        if stop.is_requested() {
            break;
        }
    }

    let immediate = stop.is_immediate();
    let reason = {
        let mut status = status.write().await;
        status.running = false;
        status
            .stop_reason
            .get_or_insert_with(|| "max cycles reached".to_string())
            .clone()
    };
    info!(reason = %reason, cycles = control.cycles_completed(), "control loop stopped");
    bus.emit(EventPayload::LoopStopped {
        reason,
        immediate,
        cycles_completed: control.cycles_completed(),
    })
    .await;
    control
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryFleetStore, RuleOnlyOracle};
    use crate::domain::models::{Config, FleetSnapshot, RetryConfig};

    fn service(max_cycles: Option<u64>) -> LoopService {
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        config.control.max_cycles = max_cycles;
        config.control.cycle_interval_seconds = 0;
        let store = Arc::new(InMemoryFleetStore::from_snapshot(FleetSnapshot {
            taken_at: Utc::now(),
            ..FleetSnapshot::default()
        }));
        let control = ControlLoop::new(
            &config,
            store.clone(),
            store,
            Arc::new(RuleOnlyOracle),
            Arc::new(EventBus::default()),
        );
        LoopService::new(control, config.control)
    }

    #[tokio::test]
    async fn test_run_stops_after_max_cycles() {
        let service = service(Some(3));
        service.start(None, None, None).await.unwrap();
        service.wait().await.unwrap();

        let status = service.status().await;
        assert!(!status.running);
        assert_eq!(status.cycles_completed, 3);
        assert_eq!(status.stop_reason.as_deref(), Some("max cycles reached"));
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let service = service(None);
        service.start(None, Some(60), None).await.unwrap();
        assert!(matches!(
            service.start(None, None, None).await,
            Err(CommandError::AlreadyRunning)
        ));

        service.stop(Some("test".into()), false).await.unwrap();
        service.wait().await.unwrap();
        assert_eq!(service.status().await.stop_reason.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_refused() {
        let service = service(None);
        assert!(matches!(service.stop(None, true).await, Err(CommandError::NotRunning)));
    }

    #[tokio::test]
    async fn test_loop_can_restart_after_stop() {
        let service = service(Some(1));
        service.start(None, None, None).await.unwrap();
        service.wait().await.unwrap();
        service.start(Some(2), None, None).await.unwrap();
        service.wait().await.unwrap();
        assert_eq!(service.status().await.cycles_completed, 3);
    }

    #[tokio::test]
    async fn test_approve_unknown_decision_fails() {
        let service = service(None);
        let err = service.approve(Uuid::new_v4(), true, None).await.unwrap_err();
        assert!(matches!(err, CommandError::Approval(ApprovalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tick_runs_single_cycle() {
        let service = service(None);
        let state = service.tick().await.unwrap();
        assert!(state.is_complete());
        assert_eq!(service.status().await.last_cycle_id, Some(state.cycle_id));
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let service = service(Some(1));
        let mut events = service.subscribe();
        service.start(None, None, None).await.unwrap();
        service.wait().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.payload);
        }
        assert!(matches!(kinds.first(), Some(EventPayload::LoopStarted { .. })));
        assert!(matches!(kinds.last(), Some(EventPayload::LoopStopped { cycles_completed: 1, .. })));
        assert!(kinds
            .iter()
            .any(|p| matches!(p, EventPayload::CycleCompleted { cycle_number: 1, .. })));
    }
}
