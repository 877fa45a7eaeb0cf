//! Control loop orchestrator.
//!
//! Drives one cycle through OBSERVE, REASON, PLAN, DECIDE, ACT and FEEDBACK.
//! Each phase gets one deadline, shared by its work and by every store write
//! it makes (its journal entry included), so a cycle never runs longer than
//! six phase timeouts. An overrunning phase is recorded as timed out and the
//! cycle moves on with empty inputs. Store failures degrade the cycle to
//! in-memory operation instead of stopping it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    ActionResult, ActionStatus, ApprovalState, Config, ControlLoopState, Decision, FleetSnapshot,
    FleetState, Issue, LoopConfig, LoopPhase, PhaseRecord, PreImage, ScoringWeights, SystemHealth,
};
use crate::domain::ports::{
    EntityKind, FleetFeed, ReasoningOracle, StateStore, StoreError, StoredEntity,
};
use crate::infrastructure::retry::RetryPolicy;
use crate::services::{
    ActionExecutor, ApprovalQueue, DecisionSelector, EventBus, EventPayload, FeedbackStage,
    LoadAssignmentEngine, ObservationPreprocessor, ReasoningStage, RouteOptimizer, ScenarioPlanner,
};

/// Executed decisions kept waiting for an observed outcome.
const MAX_AWAITING_OUTCOMES: usize = 1_000;

/// Operator stop request shared between the command surface and the loop.
#[derive(Debug)]
pub struct StopSignal {
    requested: AtomicBool,
    immediate: AtomicBool,
    tx: broadcast::Sender<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            requested: AtomicBool::new(false),
            immediate: AtomicBool::new(false),
            tx,
        }
    }
}

impl StopSignal {
    pub fn request(&self, immediate: bool) {
        if immediate {
            self.immediate.store(true, Ordering::SeqCst);
        }
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate(&self) -> bool {
        self.is_requested() && self.immediate.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
        self.immediate.store(false, Ordering::SeqCst);
    }

    /// Wakes on every later `request`.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// Share of a phase budget held back for undoing a failed write.
const COMPENSATION_SHARE: u32 = 4;

/// Deadline of the phase in progress.
#[derive(Debug, Clone, Copy)]
struct PhaseClock {
    deadline: Instant,
    /// A journal write already used up the budget.
    overran: bool,
}

impl PhaseClock {
    fn start(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            overran: false,
        }
    }
}

/// One store write and the write that reverses it.
#[derive(Debug, Clone)]
enum StoreWrite {
    Save(StoredEntity),
    Delete(EntityKind, String),
}

#[derive(Debug, Clone)]
struct StagedWrite {
    write: StoreWrite,
    undo: Option<StoreWrite>,
}

/// An applied mutation and the records it produced.
#[derive(Debug, Clone)]
struct AppliedMutation {
    result: ActionResult,
    post_image: Vec<StoredEntity>,
}

/// Owns the decision stages and runs cycles one at a time.
pub struct ControlLoop {
    config: LoopConfig,
    feed: Arc<dyn FleetFeed>,
    store: Arc<dyn StateStore>,
    journal: Arc<dyn StateStore>,
    observation: ObservationPreprocessor,
    reasoning: ReasoningStage,
    planner: Arc<ScenarioPlanner>,
    selector: DecisionSelector,
    executor: ActionExecutor,
    feedback: FeedbackStage,
    approvals: Arc<Mutex<ApprovalQueue>>,
    bus: Arc<EventBus>,
    stop: Arc<StopSignal>,
    retry: RetryPolicy,
    cycle_number: u64,
    run_cycles: u64,
    max_cycles: Option<u64>,
    awaiting: Vec<Decision>,
    applied: HashMap<Uuid, AppliedMutation>,
    clock: PhaseClock,
}

impl ControlLoop {
    /// Wire the stages from `config`. Fleet records and cycle records both go
    /// to `store` unless a separate journal is set.
    pub fn new(
        config: &Config,
        feed: Arc<dyn FleetFeed>,
        store: Arc<dyn StateStore>,
        oracle: Arc<dyn ReasoningOracle>,
        bus: Arc<EventBus>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let optimizer = RouteOptimizer::new(config.routing.clone());
        let assignment = LoadAssignmentEngine::new(optimizer.clone(), config.assignment.clone());

        Self {
            config: config.control.clone(),
            feed,
            journal: Arc::clone(&store),
            store,
            observation: ObservationPreprocessor::new(config.observation.clone()),
            reasoning: ReasoningStage::new(oracle, config.reasoning.clone(), retry.clone()),
            planner: Arc::new(ScenarioPlanner::new(optimizer.clone(), assignment)),
            selector: DecisionSelector::new(config.decision.clone(), config.control.auto_approve),
            executor: ActionExecutor::new(optimizer),
            feedback: FeedbackStage::new(config.learning.clone(), config.decision.weights),
            approvals: Arc::new(Mutex::new(ApprovalQueue::new(config.control.approval_ttl_seconds))),
            bus,
            stop: Arc::new(StopSignal::default()),
            retry,
            cycle_number: 0,
            run_cycles: 0,
            max_cycles: config.control.max_cycles,
            awaiting: Vec::new(),
            applied: HashMap::new(),
            clock: PhaseClock::start(Duration::from_secs(config.control.phase_timeout_seconds.max(1))),
        }
    }

    /// Journal cycle records somewhere other than the fleet store.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn StateStore>) -> Self {
        self.journal = journal;
        self
    }

    /// Reset run bookkeeping before a new run.
    pub fn begin_run(&mut self, max_cycles: Option<u64>, auto_approve: bool) {
        self.run_cycles = 0;
        self.max_cycles = max_cycles;
        self.selector.set_auto_approve(auto_approve);
        self.stop.reset();
    }

    pub fn approvals(&self) -> Arc<Mutex<ApprovalQueue>> {
        Arc::clone(&self.approvals)
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn weights(&self) -> ScoringWeights {
        self.feedback.weights()
    }

    pub fn health(&self) -> SystemHealth {
        self.feedback.health()
    }

    pub fn success_rate(&self) -> f64 {
        self.feedback.success_rate()
    }

    /// Cycles run since construction.
    pub fn cycles_completed(&self) -> u64 {
        self.cycle_number
    }

    fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.config.phase_timeout_seconds.max(1))
    }

    /// Record writes stop here so a failed one can still be undone before
    /// the phase deadline.
    fn write_deadline(&self) -> Instant {
        let reserve = self.phase_timeout() / COMPENSATION_SHARE;
        self.clock
            .deadline
            .checked_sub(reserve)
            .unwrap_or(self.clock.deadline)
    }

    /// Run one full cycle and return its final state.
    pub async fn run_cycle(&mut self) -> ControlLoopState {
        self.cycle_number += 1;
        self.run_cycles += 1;
        let mut state = ControlLoopState::new(self.cycle_number);

        self.bus.start_correlation(state.cycle_id).await;
        self.executor.begin_cycle();
        self.expire_approvals().await;

        self.drive_phases(&mut state).await;
        self.complete(&mut state).await;

        self.bus.end_correlation().await;
        state
    }

    async fn drive_phases(&mut self, state: &mut ControlLoopState) {
        self.enter(state, LoopPhase::Observe).await;
        let snapshot = self.observe(state).await;
        if self.halted(state) {
            return;
        }

        self.enter(state, LoopPhase::Reason).await;
        let issues = self.reason(state, &snapshot).await;
        if self.halted(state) {
            return;
        }

        self.enter(state, LoopPhase::Plan).await;
        self.plan(state, &snapshot, &issues).await;
        if self.halted(state) {
            return;
        }

        self.enter(state, LoopPhase::Decide).await;
        self.decide(state, &issues).await;
        if self.halted(state) {
            return;
        }

        self.enter(state, LoopPhase::Act).await;
        let mut fleet = self.act(state, &snapshot).await;
        if self.halted(state) {
            return;
        }

        self.enter(state, LoopPhase::Feedback).await;
        self.reconcile(state, &mut fleet).await;
    }

    /// An immediate stop ends the cycle after the current phase.
    fn halted(&self, state: &mut ControlLoopState) -> bool {
        if !state.halted && self.stop.is_immediate() {
            info!(cycle_id = %state.cycle_id, phase = %state.phase, "immediate stop, skipping rest of cycle");
            state.halted = true;
        }
        state.halted
    }

    async fn enter(&mut self, state: &mut ControlLoopState, phase: LoopPhase) {
        self.clock = PhaseClock::start(self.phase_timeout());
        let from = if phase == LoopPhase::Observe {
            None
        } else {
            let from = state.phase;
            if let Err(e) = state.transition_to(phase) {
                state.record_error(e.to_string());
            }
            Some(from)
        };

        info!(cycle_id = %state.cycle_id, cycle = state.cycle_number, phase = %phase, "phase transition");
        self.bus
            .emit(EventPayload::PhaseTransition {
                cycle_id: state.cycle_id,
                cycle_number: state.cycle_number,
                from,
                to: phase,
            })
            .await;
        if let Err(PersistFailure::TimedOut) = self.persist_cycle(state).await {
            self.clock.overran = true;
        }
    }

    async fn finish(
        &self,
        state: &mut ControlLoopState,
        phase: LoopPhase,
        started_at: DateTime<Utc>,
        timed_out: bool,
        mut error: Option<String>,
    ) {
        let timed_out = timed_out || self.clock.overran;
        if timed_out {
            let message = format!(
                "{} phase timed out after {}s",
                phase,
                self.config.phase_timeout_seconds
            );
            warn!(cycle_id = %state.cycle_id, phase = %phase, "{}", message);
            self.bus
                .emit(EventPayload::PhaseTimedOut {
                    cycle_id: state.cycle_id,
                    phase,
                    timeout_seconds: self.config.phase_timeout_seconds,
                })
                .await;
            state.record_error(message.clone());
            error = Some(message);
        } else if let Some(ref e) = error {
            warn!(cycle_id = %state.cycle_id, phase = %phase, error = %e, "phase degraded");
            state.record_error(format!("{phase}: {e}"));
        }

        state.phase_history.push(PhaseRecord {
            phase,
            started_at,
            finished_at: Utc::now(),
            timed_out,
            error,
        });
    }

    async fn observe(&mut self, state: &mut ControlLoopState) -> FleetSnapshot {
        let started_at = Utc::now();
        let outcome = timeout_at(self.clock.deadline, self.retry.execute(|| self.feed.snapshot())).await;

        let (snapshot, timed_out, error) = match outcome {
            Ok(Ok(mut snapshot)) => {
                let report = self.observation.prepare(&mut snapshot);
                debug!(
                    cycle_id = %state.cycle_id,
                    positions = report.positions_applied,
                    stuck = report.marked_stuck.len(),
                    dropped = report.dropped(),
                    "observations preprocessed"
                );
                (snapshot, false, None)
            }
            Ok(Err(e)) => (empty_snapshot(), false, Some(format!("fleet feed unavailable: {e}"))),
            Err(_) => (empty_snapshot(), true, None),
        };
        debug!(
            cycle_id = %state.cycle_id,
            trucks = snapshot.trucks.len(),
            loads = snapshot.loads.len(),
            "fleet observed"
        );
        state.snapshot = Some(snapshot.clone());
        self.finish(state, LoopPhase::Observe, started_at, timed_out, error).await;
        snapshot
    }

    async fn reason(&mut self, state: &mut ControlLoopState, snapshot: &FleetSnapshot) -> Vec<Issue> {
        let started_at = Utc::now();
        match timeout_at(self.clock.deadline, self.reasoning.analyze(snapshot)).await {
            Ok(result) => {
                let issues = result.issues.clone();
                info!(
                    cycle_id = %state.cycle_id,
                    issues = issues.len(),
                    fallback = result.used_fallback(),
                    confidence = result.confidence,
                    "reasoning complete"
                );
                state.reasoning = Some(result);
                self.finish(state, LoopPhase::Reason, started_at, false, None).await;
                issues
            }
            Err(_) => {
                self.finish(state, LoopPhase::Reason, started_at, true, None).await;
                Vec::new()
            }
        }
    }

    async fn plan(&mut self, state: &mut ControlLoopState, snapshot: &FleetSnapshot, issues: &[Issue]) {
        let started_at = Utc::now();
        let shared = Arc::new(snapshot.clone());
        let planning = self.planner.plan_all(issues, shared, self.config.plan_workers);

        let timed_out = match timeout_at(self.clock.deadline, planning).await {
            Ok(scenarios) => {
                for s in &scenarios {
                    debug!(
                        scenario_id = %s.id,
                        cost = s.estimated_cost,
                        time_min = s.estimated_time_min,
                        fuel_l = s.estimated_fuel_l,
                        reliability = s.reliability,
                        "scenario planned"
                    );
                }
                state.scenarios = scenarios;
                false
            }
            Err(_) => true,
        };
        self.finish(state, LoopPhase::Plan, started_at, timed_out, None).await;
    }

    async fn decide(&mut self, state: &mut ControlLoopState, issues: &[Issue]) {
        let started_at = Utc::now();
        let results = self
            .selector
            .select(&state.scenarios, issues, &self.feedback.weights());

        for result in results {
            let Some(decision) = result.selected else {
                continue;
            };
            info!(
                cycle_id = %state.cycle_id,
                decision_id = %decision.id,
                issue_id = %decision.issue_id,
                scenario_id = %decision.scenario.id,
                score = decision.score,
                approval = decision.approval.as_str(),
                "decision made"
            );
            self.bus.emit(EventPayload::decision_made(&decision)).await;
            state.decisions.push(decision);
        }
        self.finish(state, LoopPhase::Decide, started_at, false, None).await;
    }

    /// Execute released approvals, then this cycle's decisions.
    ///
    /// A decision for an issue that a released approval already serves is
    /// dropped. Decisions left unexecuted at the deadline or on an immediate
    /// stop go back to the approval queue when they were waiting there.
    async fn act(&mut self, state: &mut ControlLoopState, snapshot: &FleetSnapshot) -> FleetState {
        let started_at = Utc::now();
        let mut fleet = FleetState::from_snapshot(snapshot);
        let released = self.approvals.lock().await.take_approved(started_at);
        let served: HashSet<String> = released.iter().map(|d| d.issue_id.clone()).collect();

        let mut queue: VecDeque<Decision> = released.into();
        for decision in &state.decisions {
            if served.contains(&decision.issue_id) {
                debug!(
                    decision_id = %decision.id,
                    issue_id = %decision.issue_id,
                    "issue already served by an approved decision"
                );
                continue;
            }
            queue.push_back(decision.clone());
        }
        let mut timed_out = false;

        while let Some(decision) = queue.pop_front() {
            if self.stop.is_immediate() {
                info!(cycle_id = %state.cycle_id, "immediate stop during act, remaining decisions not executed");
                queue.push_front(decision);
                break;
            }
            if Instant::now() >= self.write_deadline() {
                timed_out = true;
                queue.push_front(decision);
                break;
            }

            let now = Utc::now();
            let result = self.executor.execute(&mut fleet, &decision, now);
            match result.status {
                ActionStatus::Deferred if decision.approval == ApprovalState::Pending => {
                    let replaced = self.approvals.lock().await.defer(decision.clone(), now);
                    if let Some(replaced) = replaced {
                        info!(
                            issue_id = %decision.issue_id,
                            replaced = %replaced.id,
                            decision_id = %decision.id,
                            "pending decision replaced by a newer one"
                        );
                    }
                    self.bus
                        .emit(EventPayload::DecisionDeferred {
                            decision_id: decision.id,
                            reason: decision
                                .approval_reason
                                .clone()
                                .unwrap_or_else(|| "awaiting approval".to_string()),
                        })
                        .await;
                }
                ActionStatus::Deferred => {
                    self.bus
                        .emit(EventPayload::DecisionDeferred {
                            decision_id: decision.id,
                            reason: result.message.clone(),
                        })
                        .await;
                }
                ActionStatus::Applied => {
                    let (saves, deletes) = result
                        .pre_image
                        .as_ref()
                        .map(|pre| post_image(&fleet, pre))
                        .unwrap_or_default();
                    let prior = result.pre_image.as_ref().map(restore_image).unwrap_or_default().0;
                    let writes = stage_writes(&saves, &deletes, &prior);
                    if let Err(PersistFailure::TimedOut) = self.persist_records(state, &writes).await {
                        timed_out = true;
                    }
                    self.applied.insert(
                        decision.id,
                        AppliedMutation {
                            result: result.clone(),
                            post_image: saves,
                        },
                    );
                    self.awaiting.push(decision.clone());
                }
                ActionStatus::Recorded => self.awaiting.push(decision.clone()),
                ActionStatus::Rejected => {
                    self.bus
                        .emit(EventPayload::DecisionRejected {
                            decision_id: decision.id,
                            reason: result.message.clone(),
                        })
                        .await;
                }
                ActionStatus::Failed | ActionStatus::RolledBack => {}
            }

            self.bus.emit(EventPayload::action_executed(&result)).await;
            state.action_results.push(result);
        }

        if !queue.is_empty() {
            self.return_unexecuted(state, queue).await;
        }

        state.requires_human_intervention = state
            .decisions
            .iter()
            .any(|d| d.requires_human_approval && d.approval == ApprovalState::Pending);
        self.finish(state, LoopPhase::Act, started_at, timed_out, None).await;
        fleet
    }

    /// Approved decisions are requeued and pending ones parked; the rest are
    /// raised again by a later cycle's reasoning.
    async fn return_unexecuted(&self, state: &ControlLoopState, queue: VecDeque<Decision>) {
        info!(cycle_id = %state.cycle_id, remaining = queue.len(), "decisions left unexecuted");
        let now = Utc::now();
        let mut approvals = self.approvals.lock().await;
        for decision in queue {
            match decision.approval {
                ApprovalState::Approved => approvals.requeue_approved(decision, now),
                ApprovalState::Pending => {
                    approvals.defer(decision, now);
                }
                _ => debug!(decision_id = %decision.id, "unexecuted decision dropped"),
            }
        }
    }

    async fn reconcile(&mut self, state: &mut ControlLoopState, fleet: &mut FleetState) {
        let started_at = Utc::now();
        let ids: Vec<Uuid> = self.awaiting.iter().map(|d| d.id).collect();

        let (outcomes, timed_out, error) = if ids.is_empty() {
            (Vec::new(), false, None)
        } else {
            let fetch = self.retry.execute(|| self.feed.observed_outcomes(&ids));
            match timeout_at(self.clock.deadline, fetch).await {
                Ok(Ok(outcomes)) => (outcomes, false, None),
                Ok(Err(e)) => (Vec::new(), false, Some(format!("outcome feed unavailable: {e}"))),
                Err(_) => (Vec::new(), true, None),
            }
        };

        let result = self.feedback.reconcile(&self.awaiting, &outcomes);

        for outcome in &outcomes {
            let mutation = self.applied.remove(&outcome.decision_id);
            if let (false, Some(mutation)) = (outcome.succeeded, mutation) {
                self.correct(state, fleet, mutation).await;
            }
        }

        let observed: HashSet<Uuid> = outcomes.iter().map(|o| o.decision_id).collect();
        self.awaiting.retain(|d| !observed.contains(&d.id));
        if self.awaiting.len() > MAX_AWAITING_OUTCOMES {
            let excess = self.awaiting.len() - MAX_AWAITING_OUTCOMES;
            for dropped in self.awaiting.drain(..excess) {
                self.applied.remove(&dropped.id);
            }
        }

        state.feedback = Some(result);
        self.finish(state, LoopPhase::Feedback, started_at, timed_out, error).await;
    }

    /// Undo a mutation whose observed outcome failed, provided its records
    /// are still exactly as the mutation left them.
    async fn correct(&mut self, state: &mut ControlLoopState, fleet: &mut FleetState, mutation: AppliedMutation) {
        let decision_id = mutation.result.decision_id;
        let unchanged = mutation
            .post_image
            .iter()
            .all(|record| current_record(fleet, record).as_ref() == Some(record));
        if !unchanged {
            info!(decision_id = %decision_id, "failed action not rolled back, records changed since it was applied");
            return;
        }

        match self.executor.rollback(fleet, &mutation.result, Utc::now()) {
            Ok(rolled_back) => {
                if let Some(pre) = mutation.result.pre_image.as_ref() {
                    let (saves, deletes) = restore_image(pre);
                    let writes = stage_writes(&saves, &deletes, &mutation.post_image);
                    if self.persist_records(state, &writes).await.is_err() {
                        warn!(decision_id = %decision_id, "rollback kept in memory only");
                    }
                }
                self.bus.emit(EventPayload::action_executed(&rolled_back)).await;
                state.action_results.push(rolled_back);
            }
            Err(e) => warn!(decision_id = %decision_id, error = %e, "rollback failed"),
        }
    }

    async fn complete(&mut self, state: &mut ControlLoopState) {
        state.completed_at = Some(Utc::now());
        let limit_reached = self.max_cycles.is_some_and(|max| self.run_cycles >= max);
        state.continue_loop = !(self.stop.is_requested() || limit_reached);

        let issues = state.reasoning.as_ref().map_or(0, |r| r.issues.len());
        let applied = state
            .action_results
            .iter()
            .filter(|r| r.status == ActionStatus::Applied)
            .count();
        info!(
            cycle_id = %state.cycle_id,
            cycle = state.cycle_number,
            issues,
            decisions = state.decisions.len(),
            applied,
            halted = state.halted,
            continue_loop = state.continue_loop,
            "cycle completed"
        );
        self.bus
            .emit(EventPayload::CycleCompleted {
                cycle_id: state.cycle_id,
                cycle_number: state.cycle_number,
                issues,
                decisions: state.decisions.len(),
                applied,
                requires_human_intervention: state.requires_human_intervention,
                health: self.feedback.health(),
                weights: self.feedback.weights(),
            })
            .await;
        // A failure has already degraded persistence and been reported.
        let _ = self.persist_cycle(state).await;
    }

    async fn expire_approvals(&self) {
        let expired = self.approvals.lock().await.purge_expired(Utc::now());
        for decision in expired {
            warn!(decision_id = %decision.id, issue_id = %decision.issue_id, "deferred decision expired");
            self.bus
                .emit(EventPayload::ApprovalExpired {
                    decision_id: decision.id,
                    issue_id: decision.issue_id,
                })
                .await;
        }
    }

    async fn persist_cycle(&self, state: &mut ControlLoopState) -> Result<(), PersistFailure> {
        if state.persistence_degraded {
            return Ok(());
        }
        let record = StoredEntity::Cycle(Box::new(state.clone()));
        let write = self.retry.execute(|| self.journal.save(&record));
        let failure = match timeout_at(self.clock.deadline, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => PersistFailure::Store(e.to_string()),
            Err(_) => PersistFailure::TimedOut,
        };
        let message = match &failure {
            PersistFailure::Store(e) => e.clone(),
            PersistFailure::TimedOut => "cycle journal write timed out".to_string(),
        };
        self.degrade(state, message).await;
        Err(failure)
    }

    /// Apply `writes` in order. On failure the writes that may have landed
    /// are undone newest first, so the store keeps either every record of a
    /// mutation or none of them.
    async fn persist_records(&self, state: &mut ControlLoopState, writes: &[StagedWrite]) -> Result<(), PersistFailure> {
        if state.persistence_degraded || writes.is_empty() {
            return Ok(());
        }

        let mut completed = 0;
        let outcome = timeout_at(self.write_deadline(), async {
            for staged in writes {
                self.apply(&staged.write).await?;
                completed += 1;
            }
            Ok::<(), StoreError>(())
        })
        .await;

        let (failure, attempted) = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => (PersistFailure::Store(e.to_string()), completed),
            // The write in flight may have landed before it was cancelled.
            Err(_) => (PersistFailure::TimedOut, (completed + 1).min(writes.len())),
        };
        self.compensate(&writes[..attempted]).await;

        let message = match &failure {
            PersistFailure::Store(e) => e.clone(),
            PersistFailure::TimedOut => "fleet store write timed out".to_string(),
        };
        self.degrade(state, message).await;
        Err(failure)
    }

    async fn compensate(&self, attempted: &[StagedWrite]) {
        if attempted.is_empty() {
            return;
        }
        let undo = async {
            for staged in attempted.iter().rev() {
                if let Some(write) = &staged.undo {
                    self.apply(write).await?;
                }
            }
            Ok::<(), StoreError>(())
        };
        match timeout_at(self.clock.deadline, undo).await {
            Ok(Ok(())) => debug!(writes = attempted.len(), "partial store write undone"),
            Ok(Err(e)) => error!(error = %e, "store left partially written, undo failed"),
            Err(_) => error!("store left partially written, undo timed out"),
        }
    }

    async fn apply(&self, write: &StoreWrite) -> Result<(), StoreError> {
        match write {
            StoreWrite::Save(entity) => self.retry.execute(|| self.store.save(entity)).await,
            StoreWrite::Delete(kind, id) => {
                let kind = *kind;
                self.retry.execute(|| self.store.delete(kind, id)).await
            }
        }
    }

    async fn degrade(&self, state: &mut ControlLoopState, error: String) {
        warn!(cycle_id = %state.cycle_id, error = %error, "persistence degraded to in-memory operation");
        state.persistence_degraded = true;
        self.bus
            .emit(EventPayload::PersistenceDegraded {
                cycle_id: state.cycle_id,
                error,
            })
            .await;
    }
}

#[derive(Debug)]
enum PersistFailure {
    Store(String),
    TimedOut,
}

fn empty_snapshot() -> FleetSnapshot {
    FleetSnapshot {
        taken_at: Utc::now(),
        ..FleetSnapshot::default()
    }
}

/// Records written by a mutation: the current versions of everything in
/// the pre-image plus created routes, and the replaced routes that are gone.
fn post_image(fleet: &FleetState, pre: &PreImage) -> (Vec<StoredEntity>, Vec<String>) {
    let mut saves = Vec::new();
    let mut deletes = Vec::new();

    for truck in &pre.trucks {
        if let Some(current) = fleet.trucks.get(&truck.id) {
            saves.push(StoredEntity::Truck(current.clone()));
        }
    }
    for load in &pre.loads {
        if let Some(current) = fleet.loads.get(&load.id) {
            saves.push(StoredEntity::Load(current.clone()));
        }
    }
    let route_ids = pre.routes.iter().map(|r| &r.id).chain(pre.created_route_ids.iter());
    for id in route_ids {
        match fleet.routes.get(id) {
            Some(route) => saves.push(StoredEntity::Route(route.clone())),
            None => deletes.push(id.clone()),
        }
    }
    saves.dedup_by(|a, b| a.kind() == b.kind() && a.id() == b.id());
    (saves, deletes)
}

/// Records that put the store back to the pre-image.
fn restore_image(pre: &PreImage) -> (Vec<StoredEntity>, Vec<String>) {
    let saves = pre
        .trucks
        .iter()
        .cloned()
        .map(StoredEntity::Truck)
        .chain(pre.loads.iter().cloned().map(StoredEntity::Load))
        .chain(pre.routes.iter().cloned().map(StoredEntity::Route))
        .collect();
    (saves, pre.created_route_ids.clone())
}

/// Saves first, then deletes, each undone by putting back the matching
/// record from `prior` or by deleting what did not exist before.
fn stage_writes(saves: &[StoredEntity], deletes: &[String], prior: &[StoredEntity]) -> Vec<StagedWrite> {
    let before = |kind: EntityKind, id: &str| prior.iter().find(|r| r.kind() == kind && r.id() == id).cloned();

    let mut writes: Vec<StagedWrite> = saves
        .iter()
        .map(|entity| {
            let (kind, id) = (entity.kind(), entity.id());
            let undo = match before(kind, &id) {
                Some(previous) => StoreWrite::Save(previous),
                None => StoreWrite::Delete(kind, id),
            };
            StagedWrite {
                write: StoreWrite::Save(entity.clone()),
                undo: Some(undo),
            }
        })
        .collect();
    writes.extend(deletes.iter().map(|route_id| StagedWrite {
        write: StoreWrite::Delete(EntityKind::Route, route_id.clone()),
        undo: before(EntityKind::Route, route_id).map(StoreWrite::Save),
    }));
    writes
}

fn current_record(fleet: &FleetState, record: &StoredEntity) -> Option<StoredEntity> {
    let id = record.id();
    match record.kind() {
        EntityKind::Truck => fleet.trucks.get(&id).cloned().map(StoredEntity::Truck),
        EntityKind::Load => fleet.loads.get(&id).cloned().map(StoredEntity::Load),
        EntityKind::Route => fleet.routes.get(&id).cloned().map(StoredEntity::Route),
        EntityKind::Cycle => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryFleetStore, RuleOnlyOracle};
    use crate::domain::models::{Load, LoadPriority, LoadStatus, Location, RetryConfig, Truck};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Record store that rejects one numbered write.
    struct FlakyStore {
        inner: Arc<InMemoryFleetStore>,
        writes: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryFleetStore>, fail_on: usize) -> Self {
            Self {
                inner,
                writes: AtomicUsize::new(0),
                fail_on,
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(StoreError::Unavailable(format!("write {n} rejected")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StoreError> {
            self.inner.load(kind, id).await
        }

        async fn save(&self, entity: &StoredEntity) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save(entity).await
        }

        async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete(kind, id).await
        }

        async fn query_unassigned_loads(&self) -> Result<Vec<Load>, StoreError> {
            self.inner.query_unassigned_loads().await
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        config.control.phase_timeout_seconds = 5;
        config
    }

    fn fleet() -> FleetSnapshot {
        let truck = Truck::new("T1", Location::new(52.0, 4.0), 1000.0, now());
        let mut urgent = Load::new(
            "L1",
            200.0,
            LoadPriority::Urgent,
            Location::new(52.01, 4.0),
            Location::new(52.2, 4.1),
        );
        urgent.pickup_window = Some(crate::domain::models::TimeWindow::new(
            now(),
            now() + chrono::Duration::minutes(90),
        ));
        FleetSnapshot {
            taken_at: now(),
            trucks: vec![truck],
            loads: vec![urgent],
            ..FleetSnapshot::default()
        }
    }

    fn control(store: Arc<InMemoryFleetStore>, config: &Config) -> ControlLoop {
        ControlLoop::new(
            config,
            store.clone(),
            store,
            Arc::new(RuleOnlyOracle),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_cycle_visits_every_phase_in_order() {
        let store = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        let mut control = control(store.clone(), &config());

        let state = control.run_cycle().await;

        let phases: Vec<_> = state.phase_history.iter().map(|r| r.phase).collect();
        assert_eq!(phases, LoopPhase::ALL.to_vec());
        assert_eq!(state.phase, LoopPhase::Feedback);
        assert!(state.is_complete());
        assert!(state.continue_loop);
        assert!(state.error_message.is_none());
        assert!(store.cycle(state.cycle_id).await.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_applied_and_persisted() {
        let store = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        let mut control = control(store.clone(), &config());

        let state = control.run_cycle().await;

        assert_eq!(state.decisions.len(), 1);
        assert!(state
            .action_results
            .iter()
            .any(|r| r.status == ActionStatus::Applied));
        let snapshot = store.snapshot().await.unwrap();
        let load = snapshot.load("L1").unwrap();
        assert_eq!(load.status, LoadStatus::Assigned);
        assert_eq!(load.assigned_truck_id.as_deref(), Some("T1"));
        assert!(snapshot.route_for("T1").is_some());
    }

    #[tokio::test]
    async fn test_max_cycles_stops_loop() {
        let store = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        let mut config = config();
        config.control.max_cycles = Some(2);
        let mut control = control(store, &config);

        assert!(control.run_cycle().await.continue_loop);
        assert!(!control.run_cycle().await.continue_loop);
        assert_eq!(control.cycles_completed(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_without_stalling() {
        let store = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        store.fail_writes(true);
        let mut control = control(store.clone(), &config());
        let mut events = control.bus().subscribe();

        let state = control.run_cycle().await;

        assert!(state.persistence_degraded);
        assert!(state.is_complete());
        assert_eq!(state.phase, LoopPhase::Feedback);

        let mut degraded_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.payload, EventPayload::PersistenceDegraded { .. }) {
                degraded_events += 1;
            }
        }
        assert_eq!(degraded_events, 1);
    }

    #[tokio::test]
    async fn test_immediate_stop_halts_after_current_phase() {
        let store = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        let mut control = control(store.clone(), &config());
        control.stop_signal().request(true);

        let state = control.run_cycle().await;

        assert!(state.halted);
        assert!(!state.continue_loop);
        assert_eq!(state.phase, LoopPhase::Observe);
        assert!(state.action_results.is_empty());
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.load("L1").unwrap().status, LoadStatus::Unassigned);
    }

    #[test]
    fn test_post_image_deletes_replaced_routes() {
        let mut fleet = FleetState::from_snapshot(&fleet());
        let truck = fleet.trucks["T1"].clone();
        let pre = PreImage {
            trucks: vec![truck],
            loads: Vec::new(),
            routes: vec![crate::domain::models::Route {
                id: "RT-old".into(),
                truck_id: "T1".into(),
                stops: Vec::new(),
                distance_km: 0.0,
                duration_min: 0.0,
                fuel_l: 0.0,
                created_at: now(),
                started_at: None,
                progress: Vec::new(),
            }],
            created_route_ids: Vec::new(),
        };
        fleet.trucks.get_mut("T1").unwrap().status = crate::domain::models::TruckStatus::EnRoute;

        let (saves, deletes) = post_image(&fleet, &pre);
        assert_eq!(saves.len(), 1);
        assert!(matches!(&saves[0], StoredEntity::Truck(t) if t.status == crate::domain::models::TruckStatus::EnRoute));
        assert_eq!(deletes, vec!["RT-old".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_record_write_leaves_store_unchanged() {
        let records = Arc::new(InMemoryFleetStore::from_snapshot(fleet()));
        let mut config = config();
        config.retry.max_retries = 0;
        let mut control = ControlLoop::new(
            &config,
            records.clone(),
            Arc::new(FlakyStore::new(records.clone(), 2)),
            Arc::new(RuleOnlyOracle),
            Arc::new(EventBus::default()),
        )
        .with_journal(Arc::new(InMemoryFleetStore::new()));

        let state = control.run_cycle().await;

        assert!(state.persistence_degraded);
        assert!(state
            .action_results
            .iter()
            .any(|r| r.status == ActionStatus::Applied));
        let stored = records.snapshot().await.unwrap();
        assert_eq!(stored.truck("T1").unwrap().status, crate::domain::models::TruckStatus::Idle);
        assert_eq!(stored.load("L1").unwrap().status, LoadStatus::Unassigned);
        assert!(stored.route_for("T1").is_none());
    }

    #[test]
    fn test_staged_writes_undo_to_prior_records() {
        let fleet = FleetState::from_snapshot(&fleet());
        let before = StoredEntity::Truck(fleet.trucks["T1"].clone());
        let mut moved = fleet.trucks["T1"].clone();
        moved.status = crate::domain::models::TruckStatus::EnRoute;
        let created = crate::domain::models::Route {
            id: "RT-new".into(),
            truck_id: "T1".into(),
            stops: Vec::new(),
            distance_km: 0.0,
            duration_min: 0.0,
            fuel_l: 0.0,
            created_at: now(),
            started_at: None,
            progress: Vec::new(),
        };
        let mut replaced = created.clone();
        replaced.id = "RT-old".into();

        let writes = stage_writes(
            &[StoredEntity::Truck(moved), StoredEntity::Route(created)],
            &["RT-old".to_string()],
            &[before.clone(), StoredEntity::Route(replaced.clone())],
        );

        assert_eq!(writes.len(), 3);
        assert!(matches!(&writes[0].undo, Some(StoreWrite::Save(e)) if *e == before));
        assert!(matches!(&writes[1].undo, Some(StoreWrite::Delete(EntityKind::Route, id)) if id == "RT-new"));
        assert!(matches!(&writes[2].write, StoreWrite::Delete(EntityKind::Route, id) if id == "RT-old"));
        assert!(matches!(&writes[2].undo, Some(StoreWrite::Save(StoredEntity::Route(r))) if r.id == "RT-old"));
    }
}
