//! # Task orchestrator
//!
//! Turns submitted tasks into execution plans and drives them phase by phase:
//!
//! ```text
//! submit_task ─► analyze ─► plan ─┬─► awaiting approval ──(decision)──┐
//!                                 ├─► blocked on dependencies ──(ready)┤
//!                                 └───────────────────────────────────►┴─► driver
//!
//! driver: open phase ─► assign slots ─► wait on slots ─► checkpoint ─► next phase
//! ```
//!
//! Every in-flight task has one [`Execution`] behind its own lock. Slots are
//! claimed under that lock before any agent is reserved, and agents are
//! reserved with a compare-and-set on the directory, so a slot never has two
//! holders. Work handed out is reported back by agents through the
//! [`TaskStore`], which the driver polls.

/// Task complexity estimation
pub mod analysis;
/// Load snapshots and rebalancing
pub mod balance;
/// Per-task slot bookkeeping
pub mod execution;
/// Execution plans and checkpoints
pub mod plan;
/// Task definition and lifecycle
pub mod task;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentDirectory, AgentStatus, PerformanceStore};
use crate::bus::{MessageBus, MessageContent, SendOptions};
use crate::config::OrchestratorConfig;
use crate::consensus::{
    ConsensusEngine, ConsensusProposal, ConsensusResult, DecisionAction, DecisionHandler, NewProposal,
    ProposalPayload, ProposalStatus,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::scheduler::{Scheduler, SingleFlight, TickFuture};
use crate::store::{AssignmentKey, AssignmentRecord, AssignmentStatus, TaskStore};
use crate::types::{AgentId, Priority, TaskId};

pub use analysis::{ComplexityEstimate, HeuristicAnalyzer, TaskAnalyzer};
pub use balance::{LeastLoadedBalancer, LoadBalancer, LoadSnapshot, Reassignment, UnassignedSlot};
pub use execution::{Execution, SlotKey, SlotState};
pub use plan::{AssignmentSpec, Checkpoint, ExecutionPlan, ExecutionPlanner, PhaseOutcome, PhasePlan};
pub use task::{Task, TaskStatus, TaskStrategy};

/// Message kind handing an assignment to an agent
pub const ASSIGNMENT_MESSAGE: &str = "task.assignment";
/// Message kind telling an agent its task was cancelled
pub const CANCELLED_MESSAGE: &str = "task.cancelled";
/// Message kind telling an agent its slot moved to another agent
pub const REASSIGNED_MESSAGE: &str = "task.reassigned";

const CHECKPOINT_REVIEW: &str = "checkpoint_review";

type SharedExecution = Arc<Mutex<Execution>>;

/// Injected collaborators of the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    /// Agent lookup and reservation
    pub directory: Arc<dyn AgentDirectory>,
    /// Agent track records
    pub performance: Arc<dyn PerformanceStore>,
    /// Task and assignment persistence
    pub store: Arc<dyn TaskStore>,
    /// Complexity estimation
    pub analyzer: Arc<dyn TaskAnalyzer>,
    /// Rebalancing policy
    pub balancer: Arc<dyn LoadBalancer>,
}

impl Collaborators {
    /// Uses [`HeuristicAnalyzer`] and [`LeastLoadedBalancer`]
    pub fn new(
        directory: Arc<dyn AgentDirectory>,
        performance: Arc<dyn PerformanceStore>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            directory,
            performance,
            store,
            analyzer: Arc::new(HeuristicAnalyzer::default()),
            balancer: Arc::new(LeastLoadedBalancer),
        }
    }

    /// Replace the analyzer
    pub fn with_analyzer(mut self, analyzer: Arc<dyn TaskAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Replace the balancer
    pub fn with_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiting {
    Approval,
    Dependencies,
}

/// A planned task that has not started yet
struct StagedTask {
    task: Task,
    plan: ExecutionPlan,
    waiting: Waiting,
}

enum Dependencies {
    Ready,
    Waiting,
    Failed(TaskId),
}

/// Plans tasks into phases and drives them through agents
pub struct TaskOrchestrator {
    me: Weak<Self>,
    identity: AgentId,
    config: OrchestratorConfig,
    bus: Arc<MessageBus>,
    events: EventBus,
    consensus: Arc<ConsensusEngine>,
    directory: Arc<dyn AgentDirectory>,
    performance: Arc<dyn PerformanceStore>,
    store: Arc<dyn TaskStore>,
    analyzer: Arc<dyn TaskAnalyzer>,
    balancer: Arc<dyn LoadBalancer>,
    planner: ExecutionPlanner,
    executions: RwLock<HashMap<TaskId, SharedExecution>>,
    /// Priority ordered, highest first
    pending: Mutex<Vec<StagedTask>>,
    distribute_flight: SingleFlight,
    progress_flight: SingleFlight,
    rebalance_flight: SingleFlight,
    scheduler: Scheduler,
}

impl TaskOrchestrator {
    /// Build the orchestrator and register it as the consensus engine's
    /// decision handler
    pub fn new(
        config: OrchestratorConfig,
        bus: Arc<MessageBus>,
        consensus: Arc<ConsensusEngine>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let events = bus.events().clone();
        let orchestrator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity: AgentId::system("orchestrator"),
            planner: ExecutionPlanner::new(&config),
            scheduler: Scheduler::new("orchestrator", events.clone()),
            config,
            bus,
            events,
            consensus,
            directory: collaborators.directory,
            performance: collaborators.performance,
            store: collaborators.store,
            analyzer: collaborators.analyzer,
            balancer: collaborators.balancer,
            executions: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            distribute_flight: SingleFlight::new(),
            progress_flight: SingleFlight::new(),
            rebalance_flight: SingleFlight::new(),
        });
        let weak: Weak<TaskOrchestrator> = Arc::downgrade(&orchestrator);
        let handler: Weak<dyn DecisionHandler> = weak;
        orchestrator.consensus.set_decision_handler(handler);
        orchestrator
    }

    pub fn identity(&self) -> &AgentId {
        &self.identity
    }

    fn execution(&self, task_id: TaskId) -> Option<SharedExecution> {
        self.executions.read().get(&task_id).cloned()
    }

    /// Running executions, highest priority first
    fn running(&self) -> Vec<(TaskId, SharedExecution)> {
        let mut running: Vec<_> = self
            .executions
            .read()
            .iter()
            .map(|(id, exec)| (*id, Arc::clone(exec)))
            .collect();
        running.sort_by_cached_key(|(_, exec)| std::cmp::Reverse(exec.lock().task.priority));
        running
    }

    // === Submission ===

    /// Plan a task and start it, or park it until it is approved or its
    /// dependencies complete
    #[instrument(skip_all, fields(task_id = %task.id, strategy = ?task.strategy))]
    pub async fn submit_task(&self, mut task: Task) -> CoreResult<TaskId> {
        if task.description.trim().is_empty() {
            return Err(CoreError::Validation("task description is empty".into()));
        }
        if self.execution(task.id).is_some() || self.pending.lock().iter().any(|p| p.task.id == task.id) {
            return Err(CoreError::Validation(format!("task {} was already submitted", task.id)));
        }
        for dep in &task.dependencies {
            if *dep == task.id {
                return Err(CoreError::Validation(format!("task {dep} depends on itself")));
            }
            if self.store.task_status(*dep).await?.is_none() {
                return Err(CoreError::NotFound(format!("dependency {dep} of task {}", task.id)));
            }
        }

        let estimate = self.analyzer.analyze(&task).await?;
        let plan = self.planner.plan(&task, &estimate)?;
        task.status = TaskStatus::Pending;
        self.store.save_task(&task).await?;
        info!(
            phases = plan.phases.len(),
            strategy = ?plan.strategy,
            complexity = estimate.complexity,
            "Execution plan ready"
        );

        let task_id = task.id;
        if task.requires_consensus {
            self.request_approval(task, plan).await?;
        } else {
            self.launch(task, plan).await?;
        }
        Ok(task_id)
    }

    async fn request_approval(&self, task: Task, plan: ExecutionPlan) -> CoreResult<()> {
        let task_id = task.id;
        let payload = ProposalPayload::new(format!("approve task: {}", task.description), DecisionAction::ApproveTask)
            .with_content(MessageContent::Json(json!({
                "task_id": task_id,
                "description": task.description,
                "priority": task.priority,
                "phases": plan.phase_names(),
            })));
        let proposal = NewProposal::new(task.swarm_id.clone(), payload).for_task(task_id);

        self.store
            .update_task_status(task_id, TaskStatus::AwaitingApproval, None)
            .await?;
        self.stage(StagedTask {
            task,
            plan,
            waiting: Waiting::Approval,
        });

        match self.consensus.create_proposal(proposal).await {
            Ok(proposal_id) => {
                info!(%task_id, %proposal_id, "Task awaiting approval");
                Ok(())
            }
            Err(e) => {
                self.take_staged(task_id, Waiting::Approval);
                self.fail_task(task_id, &e).await;
                Err(e)
            }
        }
    }

    /// Start the task now, or park it until its dependencies complete
    async fn launch(&self, task: Task, plan: ExecutionPlan) -> CoreResult<()> {
        let task_id = task.id;
        match self.dependency_state(&task).await? {
            Dependencies::Ready => self.start_execution(task, plan).await,
            Dependencies::Waiting => {
                self.store.update_task_status(task_id, TaskStatus::Blocked, None).await?;
                info!(%task_id, dependencies = task.dependencies.len(), "Task blocked on dependencies");
                self.stage(StagedTask {
                    task,
                    plan,
                    waiting: Waiting::Dependencies,
                });
                Ok(())
            }
            Dependencies::Failed(dep) => {
                let err = CoreError::Validation(format!("dependency {dep} did not complete"));
                self.fail_task(task_id, &err).await;
                Err(err)
            }
        }
    }

    async fn dependency_state(&self, task: &Task) -> CoreResult<Dependencies> {
        let mut waiting = false;
        for dep in &task.dependencies {
            match self.store.task_status(*dep).await? {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed | TaskStatus::Cancelled) => return Ok(Dependencies::Failed(*dep)),
                Some(_) => waiting = true,
                None => return Err(CoreError::task_not_found(dep)),
            }
        }
        Ok(if waiting {
            Dependencies::Waiting
        } else {
            Dependencies::Ready
        })
    }

    fn stage(&self, staged: StagedTask) {
        let mut pending = self.pending.lock();
        let at = pending
            .iter()
            .position(|p| p.task.priority < staged.task.priority)
            .unwrap_or(pending.len());
        pending.insert(at, staged);
    }

    fn take_staged(&self, task_id: TaskId, waiting: Waiting) -> Option<StagedTask> {
        let mut pending = self.pending.lock();
        let at = pending
            .iter()
            .position(|p| p.task.id == task_id && p.waiting == waiting)?;
        Some(pending.remove(at))
    }

    /// Start blocked tasks whose dependencies have completed. Returns how many left the pending list.
    pub async fn release_pending(&self) -> CoreResult<usize> {
        let blocked: Vec<Task> = self
            .pending
            .lock()
            .iter()
            .filter(|p| p.waiting == Waiting::Dependencies)
            .map(|p| p.task.clone())
            .collect();

        let mut released = 0;
        for task in blocked {
            if matches!(self.dependency_state(&task).await?, Dependencies::Waiting) {
                continue;
            }
            let Some(staged) = self.take_staged(task.id, Waiting::Dependencies) else {
                continue;
            };
            released += 1;
            if let Err(e) = self.launch(staged.task, staged.plan).await {
                warn!(task_id = %task.id, error = %e, "Failed to start unblocked task");
            }
        }
        Ok(released)
    }

    async fn start_execution(&self, task: Task, plan: ExecutionPlan) -> CoreResult<()> {
        let task_id = task.id;
        let Some(this) = self.me.upgrade() else {
            return Err(CoreError::Cancelled("orchestrator is shutting down".into()));
        };
        let mut execution = Execution::new(task, plan);
        execution.started_at = Some(Instant::now());
        let exec = Arc::new(Mutex::new(execution));
        {
            let mut executions = self.executions.write();
            if executions.contains_key(&task_id) {
                return Err(CoreError::Validation(format!("task {task_id} is already running")));
            }
            executions.insert(task_id, Arc::clone(&exec));
        }

        if let Err(e) = self.store.update_task_status(task_id, TaskStatus::Running, None).await {
            self.executions.write().remove(&task_id);
            return Err(e.into());
        }
        info!(%task_id, "Task started");
        tokio::spawn(async move {
            let result = this.execute_task(&exec).await;
            this.finish_task(task_id, result).await;
        });
        Ok(())
    }

    // === Execution ===

    async fn execute_task(&self, exec: &SharedExecution) -> CoreResult<()> {
        let (task_id, strategy, phases) = {
            let e = exec.lock();
            (e.task.id, e.plan.strategy, e.total_phases())
        };
        debug!(%task_id, ?strategy, phases, "Executing plan");

        if strategy == TaskStrategy::Parallel {
            let outcomes = join_all((0..phases).map(|index| self.run_phase(exec, index))).await;
            for outcome in outcomes {
                self.check_phase(exec, outcome?, strategy).await?;
            }
            return Ok(());
        }

        for index in 0..phases {
            let cancelled = exec.lock().cancel.is_cancelled();
            if cancelled {
                return Err(CoreError::Cancelled(format!("task {task_id}")));
            }
            let outcome = self.run_phase(exec, index).await?;
            self.check_phase(exec, outcome, strategy).await?;
        }
        Ok(())
    }

    async fn run_phase(&self, exec: &SharedExecution, index: usize) -> CoreResult<PhaseOutcome> {
        let (task_id, cancel) = {
            let mut e = exec.lock();
            e.open_phase(index);
            (e.task.id, e.cancel.clone())
        };
        self.assign_agents_to_phase(task_id, index).await?;

        let slots = exec.lock().phase_slots(index);
        join_all(slots.into_iter().map(|key| self.wait_for_slot(exec, key))).await;
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("task {task_id}")));
        }
        Ok(exec.lock().outcome(index))
    }

    /// Score a finished phase against its checkpoint
    async fn check_phase(&self, exec: &SharedExecution, outcome: PhaseOutcome, strategy: TaskStrategy) -> CoreResult<()> {
        let (task_id, checkpoint, progress) = {
            let e = exec.lock();
            let checkpoint = e
                .plan
                .phases
                .get(outcome.index)
                .map(|p| p.checkpoint.clone())
                .ok_or_else(|| CoreError::NotFound(format!("phase {} of task {}", outcome.index, e.task.id)))?;
            let progress = (e.completed_phases + 1) as f64 / e.total_phases().max(1) as f64;
            (e.task.id, checkpoint, progress)
        };

        if !checkpoint.progress_reached(progress) {
            warn!(%task_id, phase = %outcome.phase, progress, required = checkpoint.required_progress, "Checkpoint reached ahead of earlier phases");
            return Err(CoreError::PlanFailure {
                task_id,
                phase: outcome.phase,
                score: progress,
                threshold: checkpoint.required_progress,
            });
        }

        let score = checkpoint.evaluate(&outcome);
        let threshold = checkpoint.failure_threshold;
        if !checkpoint.passes(score) {
            warn!(%task_id, phase = %outcome.phase, score, threshold, "Checkpoint failed");
            return Err(CoreError::PlanFailure {
                task_id,
                phase: outcome.phase,
                score,
                threshold,
            });
        }
        if strategy == TaskStrategy::Consensus && score < threshold + self.config.checkpoint_review_margin {
            self.review_checkpoint(exec, &outcome.phase, score, threshold).await?;
        }

        exec.lock().completed_phases += 1;
        info!(%task_id, phase = %outcome.phase, score, success_rate = outcome.success_rate(), "Checkpoint passed");
        self.events.publish(CoreEvent::CheckpointPassed {
            task_id,
            phase: outcome.phase,
            score,
        });
        Ok(())
    }

    async fn review_checkpoint(&self, exec: &SharedExecution, phase: &str, score: f64, threshold: f64) -> CoreResult<()> {
        let (task_id, swarm_id, cancel) = {
            let e = exec.lock();
            (e.task.id, e.task.swarm_id.clone(), e.cancel.clone())
        };
        let payload = ProposalPayload::new(
            format!("review checkpoint '{phase}'"),
            DecisionAction::Custom {
                name: CHECKPOINT_REVIEW.to_string(),
            },
        )
        .with_content(MessageContent::Json(json!({
            "task_id": task_id,
            "phase": phase,
            "score": score,
            "threshold": threshold,
        })));
        let proposal_id = self
            .consensus
            .create_proposal(NewProposal::new(swarm_id, payload).for_task(task_id))
            .await?;
        info!(%task_id, phase, score, %proposal_id, "Borderline checkpoint sent to review");

        let status = tokio::select! {
            status = self.consensus.wait_for_outcome(proposal_id, self.config.review_timeout) => status?,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled(format!("task {task_id}"))),
        };
        match status {
            ProposalStatus::Achieved => Ok(()),
            ProposalStatus::Failed(reason) => Err(CoreError::ConsensusRejected(format!(
                "review of checkpoint '{phase}' failed ({})",
                reason.as_str()
            ))),
            ProposalStatus::Active => Err(CoreError::Timeout(format!("review of checkpoint '{phase}'"))),
        }
    }

    /// Wait for one slot to finish, bounded by its assignment timeout
    async fn wait_for_slot(&self, exec: &SharedExecution, key: SlotKey) {
        let (task_id, phase, timeout, cancel) = {
            let e = exec.lock();
            let timeout = e.spec(key).map_or(self.config.assignment_timeout, |s| s.timeout);
            (e.task.id, e.phase_name(key.0).to_string(), timeout, e.cancel.clone())
        };
        let record_key = AssignmentKey::new(task_id, phase, key.1);
        let deadline = Instant::now() + timeout;

        loop {
            let holder = exec.lock().assigned_agent(key).cloned();
            match holder {
                Some(agent) => match self.store.assignment(&record_key).await {
                    Ok(Some(record)) if record.agent_id == agent && record.status.is_terminal() => {
                        self.settle_slot(exec, key, agent, record).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(assignment = %record_key, error = %e, "Failed to read assignment"),
                },
                None => {
                    let finished = exec.lock().slot(key).map_or(true, SlotState::is_terminal);
                    if finished {
                        return;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let timed_out = {
                    let mut e = exec.lock();
                    let holder = e.assigned_agent(key).cloned();
                    e.finish(key, SlotState::TimedOut).then_some(holder)
                };
                if let Some(holder) = timed_out {
                    warn!(assignment = %record_key, agent = ?holder, ?timeout, "Assignment timed out");
                    if let Some(agent) = holder {
                        self.settle_agent(&agent, false).await;
                    }
                }
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline.min(now + self.config.completion_poll_interval)) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn settle_slot(&self, exec: &SharedExecution, key: SlotKey, agent: AgentId, record: AssignmentRecord) {
        let success = record.status == AssignmentStatus::Completed;
        let state = if success {
            SlotState::Completed {
                agent: agent.clone(),
                has_output: record.output.is_some(),
            }
        } else {
            let reason = record
                .output
                .as_ref()
                .and_then(|o| o.get("error"))
                .and_then(|e| e.as_str())
                .unwrap_or("assignment failed")
                .to_string();
            SlotState::Failed(reason)
        };
        let finished = exec.lock().finish(key, state);
        if finished {
            debug!(assignment = %record.key, %agent, success, "Assignment finished");
            self.settle_agent(&agent, success).await;
        }
    }

    async fn settle_agent(&self, agent: &AgentId, success: bool) {
        if let Err(e) = self.performance.record_outcome(agent, success).await {
            warn!(%agent, error = %e, "Failed to record agent outcome");
        }
        self.release_agent(agent).await;
    }

    async fn release_agent(&self, agent: &AgentId) {
        if let Err(e) = self.directory.release(agent).await {
            warn!(%agent, error = %e, "Failed to release agent");
        }
    }

    async fn finish_task(&self, task_id: TaskId, result: CoreResult<()>) {
        let removed = self.executions.write().remove(&task_id);
        let Some(exec) = removed else {
            debug!(%task_id, "Execution already discarded");
            return;
        };
        let (holders, started_at) = {
            let e = exec.lock();
            e.cancel.cancel();
            (e.assigned_agents(), e.started_at)
        };
        for agent in &holders {
            self.release_agent(agent).await;
        }

        match result {
            Ok(()) => {
                let duration_ms = started_at.map_or(0, |t| t.elapsed().as_millis() as u64);
                if let Err(e) = self.store.update_task_status(task_id, TaskStatus::Completed, None).await {
                    error!(%task_id, error = %e, "Failed to persist task completion");
                }
                if let Err(e) = self.store.record_progress(task_id, 1.0).await {
                    warn!(%task_id, error = %e, "Failed to persist task progress");
                }
                info!(%task_id, duration_ms, "Task completed");
                self.events.publish(CoreEvent::TaskCompleted { task_id, duration_ms });
            }
            Err(CoreError::Cancelled(_)) => self.mark_cancelled(task_id).await,
            Err(e) => self.fail_task(task_id, &e).await,
        }
    }

    async fn fail_task(&self, task_id: TaskId, err: &CoreError) {
        error!(%task_id, reason = err.reason(), error = %err, "Task failed");
        if let Err(e) = self
            .store
            .update_task_status(task_id, TaskStatus::Failed, Some(err.to_string()))
            .await
        {
            error!(%task_id, error = %e, "Failed to persist task failure");
        }
        self.events.publish(CoreEvent::TaskFailed {
            task_id,
            reason: err.reason().to_string(),
            error: err.to_string(),
        });
    }

    async fn mark_cancelled(&self, task_id: TaskId) {
        if let Err(e) = self.store.update_task_status(task_id, TaskStatus::Cancelled, None).await {
            error!(%task_id, error = %e, "Failed to persist task cancellation");
        }
        info!(%task_id, "Task cancelled");
        self.events.publish(CoreEvent::TaskCancelled { task_id });
    }

    // === Assignment ===

    /// Hand every queued slot of an opened phase to the best idle agent.
    /// Slots without a candidate stay queued. Returns how many were assigned.
    #[instrument(skip(self))]
    pub async fn assign_agents_to_phase(&self, task_id: TaskId, phase: usize) -> CoreResult<usize> {
        let exec = self.execution(task_id).ok_or_else(|| CoreError::task_not_found(&task_id))?;
        let claimed = exec.lock().claim_queued(Some(phase));
        self.assign_claimed(task_id, &exec, claimed).await
    }

    async fn assign_claimed(
        &self,
        task_id: TaskId,
        exec: &SharedExecution,
        claimed: Vec<(SlotKey, AssignmentSpec)>,
    ) -> CoreResult<usize> {
        let mut assigned = 0;
        let mut claimed = claimed.into_iter();
        while let Some((key, spec)) = claimed.next() {
            match self.assign_slot(task_id, exec, key, &spec).await {
                Ok(true) => assigned += 1,
                Ok(false) => {
                    debug!(%task_id, ?key, "No idle agent for slot, leaving it queued");
                    exec.lock().unclaim(key);
                }
                Err(e) => {
                    let mut guard = exec.lock();
                    guard.unclaim(key);
                    for (rest, _) in claimed.by_ref() {
                        guard.unclaim(rest);
                    }
                    return Err(e);
                }
            }
        }
        Ok(assigned)
    }

    async fn assign_slot(
        &self,
        task_id: TaskId,
        exec: &SharedExecution,
        key: SlotKey,
        spec: &AssignmentSpec,
    ) -> CoreResult<bool> {
        let candidates = self.directory.find_idle(&spec.required_capabilities).await?;
        let mut ranked = Vec::with_capacity(candidates.len());
        for agent in candidates {
            let rate = self.performance.success_rate(&agent.id).await?.unwrap_or(0.5);
            ranked.push((rate, agent.id));
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (_, agent) in ranked {
            if !self.directory.try_reserve(&agent, task_id).await? {
                continue;
            }
            let bound = exec.lock().assign(key, agent.clone());
            if !bound {
                self.release_agent(&agent).await;
                return Ok(false);
            }
            if let Err(e) = self.dispatch(task_id, exec, key, &agent).await {
                exec.lock().requeue(key);
                self.release_agent(&agent).await;
                return Err(e);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Record an assignment and tell the agent about it
    async fn dispatch(&self, task_id: TaskId, exec: &SharedExecution, key: SlotKey, agent: &AgentId) -> CoreResult<()> {
        let (phase, spec, description, priority) = {
            let e = exec.lock();
            let spec = e
                .spec(key)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("slot {key:?} of task {task_id}")))?;
            (e.phase_name(key.0).to_string(), spec, e.task.description.clone(), e.task.priority)
        };

        self.store
            .put_assignment(AssignmentRecord {
                key: AssignmentKey::new(task_id, phase.clone(), key.1),
                agent_id: agent.clone(),
                status: AssignmentStatus::Dispatched,
                output: None,
                updated_at: Utc::now(),
            })
            .await?;

        let content = MessageContent::Json(json!({
            "task_id": task_id,
            "phase": phase,
            "slot": key.1,
            "role": spec.role,
            "description": description,
            "responsibilities": spec.responsibilities,
            "expected_output": spec.expected_output,
            "timeout_ms": spec.timeout.as_millis() as u64,
        }));
        self.notify(ASSIGNMENT_MESSAGE, content, vec![agent.clone()], priority);

        info!(%task_id, %phase, slot = key.1, %agent, "Assignment dispatched");
        self.events.publish(CoreEvent::TaskAssigned {
            task_id,
            phase,
            slot: key.1,
            agent_id: agent.clone(),
        });
        Ok(())
    }

    fn notify(&self, kind: &str, content: MessageContent, agents: Vec<AgentId>, priority: Priority) {
        if agents.is_empty() {
            return;
        }
        let opts = SendOptions::default().with_priority(priority);
        if let Err(e) = self
            .bus
            .send_message(kind, content, self.identity.clone(), agents, opts)
        {
            warn!(kind, error = %e, "Failed to notify agents");
        }
    }

    // === Cancellation ===

    /// Stop a task, release its agents and tell them to drop the work.
    /// Completions reported afterwards are ignored.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: TaskId) -> CoreResult<()> {
        let removed = self.executions.write().remove(&task_id);
        let (holders, priority) = match removed {
            Some(exec) => {
                let e = exec.lock();
                e.cancel.cancel();
                (e.assigned_agents(), e.task.priority)
            }
            None => {
                let staged = self
                    .take_staged(task_id, Waiting::Approval)
                    .or_else(|| self.take_staged(task_id, Waiting::Dependencies))
                    .ok_or_else(|| CoreError::task_not_found(&task_id))?;
                (Vec::new(), staged.task.priority)
            }
        };

        self.notify(
            CANCELLED_MESSAGE,
            MessageContent::Json(json!({ "task_id": task_id })),
            holders.clone(),
            priority,
        );
        for agent in &holders {
            self.release_agent(agent).await;
        }
        self.mark_cancelled(task_id).await;
        Ok(())
    }

    // === Load balancing ===

    /// Current agent load and the queued slots nobody holds
    pub async fn load_snapshot(&self) -> CoreResult<LoadSnapshot> {
        let agents = self.directory.list_agents().await?;
        let mut snapshot = LoadSnapshot {
            total_agents: agents.len(),
            ..Default::default()
        };
        for agent in agents {
            match agent.status {
                AgentStatus::Busy => snapshot.busy += 1,
                AgentStatus::Offline => snapshot.offline += 1,
                AgentStatus::Idle => snapshot.idle_agents.push(agent),
            }
        }

        for (task_id, exec) in self.running() {
            let e = exec.lock();
            for key in e.queued_slots() {
                if let Some(spec) = e.spec(key) {
                    snapshot.unassigned.push(UnassignedSlot {
                        task_id,
                        phase: e.phase_name(key.0).to_string(),
                        phase_index: key.0,
                        slot: key.1,
                        required_capabilities: spec.required_capabilities.clone(),
                        priority: e.task.priority,
                    });
                }
            }
        }
        Ok(snapshot)
    }

    /// Move work onto idle agents when the swarm is overloaded. Returns the
    /// number of reassignments applied; concurrent calls are skipped.
    #[instrument(skip(self))]
    pub async fn rebalance(&self) -> CoreResult<usize> {
        let Some(_permit) = self.rebalance_flight.try_begin() else {
            debug!("Rebalance already running");
            return Ok(0);
        };

        let snapshot = self.load_snapshot().await?;
        let load_factor = snapshot.load_factor();
        if !snapshot.wants_rebalance(self.config.load_factor_threshold) {
            debug!(load_factor, unassigned = snapshot.unassigned.len(), "No rebalance needed");
            return Ok(0);
        }

        let moves = self.balancer.plan(&snapshot).await?;
        let mut applied = 0;
        for reassignment in &moves {
            if self.apply_reassignment(reassignment).await? {
                applied += 1;
            }
        }
        info!(load_factor, proposed = moves.len(), applied, "Rebalanced");
        Ok(applied)
    }

    async fn apply_reassignment(&self, m: &Reassignment) -> CoreResult<bool> {
        let Some(exec) = self.execution(m.task_id) else {
            return Ok(false);
        };
        let key = (m.phase_index, m.slot);
        let claimed = {
            let mut e = exec.lock();
            match &m.from {
                Some(from) => e.reclaim(key, from),
                None => e.claim(key),
            }
        };
        if !claimed {
            debug!(task_id = %m.task_id, ?key, "Slot changed before reassignment, skipping");
            return Ok(false);
        }

        let reserved = match self.directory.try_reserve(&m.to, m.task_id).await {
            Ok(reserved) => reserved,
            Err(e) => {
                self.restore_or_release(&exec, key, m.from.as_ref()).await;
                return Err(e.into());
            }
        };
        if !reserved {
            self.restore_or_release(&exec, key, m.from.as_ref()).await;
            return Ok(false);
        }
        let bound = exec.lock().assign(key, m.to.clone());
        if !bound {
            self.release_agent(&m.to).await;
            self.restore_or_release(&exec, key, m.from.as_ref()).await;
            return Ok(false);
        }

        if let Some(from) = &m.from {
            self.release_agent(from).await;
            let priority = exec.lock().task.priority;
            self.notify(
                REASSIGNED_MESSAGE,
                MessageContent::Json(json!({
                    "task_id": m.task_id,
                    "phase_index": m.phase_index,
                    "slot": m.slot,
                    "to": m.to,
                })),
                vec![from.clone()],
                priority,
            );
        }
        if let Err(e) = self.dispatch(m.task_id, &exec, key, &m.to).await {
            exec.lock().requeue(key);
            self.release_agent(&m.to).await;
            return Err(e);
        }
        info!(task_id = %m.task_id, ?key, from = ?m.from, to = %m.to, "Slot reassigned");
        Ok(true)
    }

    /// Hand a reclaimed slot back to its previous holder. If the execution was
    /// cancelled meanwhile, the holder is released instead.
    async fn restore_or_release(&self, exec: &SharedExecution, key: SlotKey, holder: Option<&AgentId>) {
        let restored = restore_slot(&mut exec.lock(), key, holder);
        if let (false, Some(agent)) = (restored, holder) {
            debug!(%agent, ?key, "Slot gone while reassigning, releasing previous holder");
            self.release_agent(agent).await;
        }
    }

    // === Background loops ===

    /// Retry queued slots and start unblocked tasks
    async fn distribute(&self) -> CoreResult<()> {
        let Some(_permit) = self.distribute_flight.try_begin() else {
            return Ok(());
        };
        let released = self.release_pending().await?;
        let mut assigned = 0;
        for (task_id, exec) in self.running() {
            let claimed = exec.lock().claim_queued(None);
            if claimed.is_empty() {
                continue;
            }
            assigned += self.assign_claimed(task_id, &exec, claimed).await?;
        }
        if released > 0 || assigned > 0 {
            debug!(released, assigned, "Distributed work");
        }
        Ok(())
    }

    /// Persist and publish progress that changed since the last tick
    async fn monitor_progress(&self) -> CoreResult<()> {
        let Some(_permit) = self.progress_flight.try_begin() else {
            return Ok(());
        };
        for (task_id, exec) in self.running() {
            let changed = {
                let mut e = exec.lock();
                let progress = e.progress();
                if (progress - e.last_published_progress).abs() < f64::EPSILON {
                    None
                } else {
                    e.last_published_progress = progress;
                    Some((progress, e.completed_phases, e.total_phases()))
                }
            };
            let Some((progress, completed_phases, total_phases)) = changed else {
                continue;
            };
            self.store.record_progress(task_id, progress).await?;
            debug!(%task_id, progress, "Progress updated");
            self.events.publish(CoreEvent::ProgressUpdate {
                task_id,
                progress,
                completed_phases,
                total_phases,
            });
        }
        Ok(())
    }

    /// Start the distributor, progress monitor and load balancer loops
    pub fn start(&self) {
        let weak = self.me.clone();
        self.scheduler
            .spawn_loop("task-distributor", self.config.distributor_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(orchestrator) => orchestrator.distribute().await,
                        None => Ok(()),
                    }
                })
            });

        let weak = self.me.clone();
        self.scheduler
            .spawn_loop("progress-monitor", self.config.progress_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(orchestrator) => orchestrator.monitor_progress().await,
                        None => Ok(()),
                    }
                })
            });

        let weak = self.me.clone();
        self.scheduler
            .spawn_loop("load-balancer", self.config.balancer_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(orchestrator) => orchestrator.rebalance().await.map(|_| ()),
                        None => Ok(()),
                    }
                })
            });

        info!("Task orchestrator started");
    }

    /// Stop the loops and abandon in-flight executions
    pub async fn shutdown(&self) {
        for (_, exec) in self.running() {
            exec.lock().cancel.cancel();
        }
        self.scheduler.shutdown().await;
    }

    // === Queries ===

    /// Stored status of a task
    pub async fn task_status(&self, task_id: TaskId) -> CoreResult<TaskStatus> {
        self.store
            .task_status(task_id)
            .await?
            .ok_or_else(|| CoreError::task_not_found(&task_id))
    }

    /// Plan of a running or staged task
    pub fn execution_plan(&self, task_id: TaskId) -> Option<ExecutionPlan> {
        if let Some(exec) = self.execution(task_id) {
            return Some(exec.lock().plan.clone());
        }
        self.pending
            .lock()
            .iter()
            .find(|p| p.task.id == task_id)
            .map(|p| p.plan.clone())
    }

    /// Completed phases over total phases of a running task
    pub fn progress(&self, task_id: TaskId) -> Option<f64> {
        self.execution(task_id).map(|exec| exec.lock().progress())
    }

    /// Slot states of a running task, empty if it is not running
    pub fn slot_states(&self, task_id: TaskId) -> Vec<(SlotKey, SlotState)> {
        self.execution(task_id)
            .map(|exec| exec.lock().slots().map(|(k, s)| (*k, s.clone())).collect())
            .unwrap_or_default()
    }

    /// Tasks currently executing
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.running().into_iter().map(|(id, _)| id).collect()
    }

    /// Tasks staged for approval or dependencies
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.pending.lock().iter().map(|p| p.task.id).collect()
    }

    fn reprioritize(&self, task_id: TaskId, priority: Priority) -> bool {
        if let Some(exec) = self.execution(task_id) {
            exec.lock().task.priority = priority;
            return true;
        }
        let mut pending = self.pending.lock();
        let Some(at) = pending.iter().position(|p| p.task.id == task_id) else {
            return false;
        };
        let mut staged = pending.remove(at);
        drop(pending);
        staged.task.priority = priority;
        self.stage(staged);
        true
    }
}

fn restore_slot(e: &mut Execution, key: SlotKey, holder: Option<&AgentId>) -> bool {
    match holder {
        Some(agent) => e.assign(key, agent.clone()),
        None => {
            e.unclaim(key);
            true
        }
    }
}

#[async_trait]
impl DecisionHandler for TaskOrchestrator {
    async fn handle_decision(
        &self,
        proposal: &ConsensusProposal,
        status: ProposalStatus,
        result: &ConsensusResult,
    ) -> CoreResult<()> {
        let Some(task_id) = proposal.task_id else {
            return Ok(());
        };
        if !status.is_terminal() {
            return Ok(());
        }
        debug!(%task_id, proposal_id = %proposal.id, %status, ratio = result.final_ratio, "Decision received");

        let staged = self.take_staged(task_id, Waiting::Approval);
        match (staged, status, &proposal.proposal.action) {
            (Some(_), ProposalStatus::Achieved, DecisionAction::CancelTask) => {
                info!(%task_id, "Task cancelled by decision");
                self.mark_cancelled(task_id).await;
                Ok(())
            }
            (Some(mut staged), ProposalStatus::Achieved, DecisionAction::ModifyTask { priority }) => {
                if let Some(priority) = priority {
                    staged.task.priority = *priority;
                    self.store.save_task(&staged.task).await?;
                }
                info!(%task_id, "Task approved with changes");
                self.launch(staged.task, staged.plan).await
            }
            (Some(staged), ProposalStatus::Achieved, _) => {
                info!(%task_id, "Task approved");
                self.launch(staged.task, staged.plan).await
            }
            (Some(_), ProposalStatus::Failed(reason), _) => {
                let err = CoreError::ConsensusRejected(format!(
                    "approval {} failed ({})",
                    proposal.id,
                    reason.as_str()
                ));
                self.fail_task(task_id, &err).await;
                Ok(())
            }
            (None, ProposalStatus::Achieved, DecisionAction::CancelTask) => self.cancel_task(task_id).await,
            (None, ProposalStatus::Achieved, DecisionAction::ModifyTask { priority: Some(priority) }) => {
                if self.reprioritize(task_id, *priority) {
                    info!(%task_id, ?priority, "Task reprioritized by decision");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInfo, InMemoryAgentDirectory, InMemoryPerformanceStore};
    use crate::bus::Mailbox;
    use crate::config::{BusConfig, ConsensusConfig};
    use crate::consensus::ConsensusVote;
    use crate::store::{InMemoryProposalStore, InMemoryTaskStore};
    use std::time::Duration;

    struct Harness {
        orchestrator: Arc<TaskOrchestrator>,
        consensus: Arc<ConsensusEngine>,
        bus: Arc<MessageBus>,
        directory: Arc<InMemoryAgentDirectory>,
        performance: Arc<InMemoryPerformanceStore>,
        store: Arc<InMemoryTaskStore>,
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            assignment_timeout: Duration::from_secs(5),
            completion_poll_interval: Duration::from_millis(5),
            review_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn harness_with(config: OrchestratorConfig, balancer: Option<Arc<dyn LoadBalancer>>) -> Harness {
        harness_over(config, balancer, |directory| directory as Arc<dyn AgentDirectory>)
    }

    /// Harness whose orchestrator sees the directory through `wrap`
    fn harness_over(
        config: OrchestratorConfig,
        balancer: Option<Arc<dyn LoadBalancer>>,
        wrap: impl FnOnce(Arc<InMemoryAgentDirectory>) -> Arc<dyn AgentDirectory>,
    ) -> Harness {
        let bus = MessageBus::new(BusConfig::default(), EventBus::default());
        let directory = Arc::new(InMemoryAgentDirectory::new());
        let performance = Arc::new(InMemoryPerformanceStore::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let consensus = ConsensusEngine::new(
            ConsensusConfig::default(),
            Arc::clone(&bus),
            directory.clone(),
            performance.clone(),
            Arc::new(InMemoryProposalStore::new()),
        );
        let mut collaborators = Collaborators::new(wrap(directory.clone()), performance.clone(), store.clone());
        if let Some(balancer) = balancer {
            collaborators = collaborators.with_balancer(balancer);
        }
        let orchestrator = TaskOrchestrator::new(config, Arc::clone(&bus), Arc::clone(&consensus), collaborators);
        Harness {
            orchestrator,
            consensus,
            bus,
            directory,
            performance,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), None)
    }

    impl Harness {
        fn agent(&self, name: &str) -> AgentId {
            let id = AgentId::new("swarm", name);
            self.directory.register(AgentInfo::new(id.clone(), "worker"));
            id
        }

        fn capable_agent(&self, name: &str, caps: &[&str]) -> AgentId {
            let id = AgentId::new("swarm", name);
            self.directory
                .register(AgentInfo::new(id.clone(), "worker").with_capabilities(caps.iter().copied()));
            id
        }

        fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
            self.store.task(task_id).map(|t| t.status)
        }

        fn has_queued_slot(&self, task_id: TaskId) -> bool {
            self.orchestrator
                .slot_states(task_id)
                .iter()
                .any(|(_, s)| *s == SlotState::Queued)
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn kinds(mailbox: &mut Mailbox) -> Vec<String> {
        mailbox.drain().into_iter().map(|d| d.message.kind).collect()
    }

    #[tokio::test]
    async fn test_sequential_phase_b_waits_for_checkpoint_a() {
        let h = harness();
        h.agent("w1");
        let mut events = h.bus.events().subscribe();
        let task_id = h
            .orchestrator
            .submit_task(Task::new("write the report").with_phases(["A", "B"]))
            .await
            .unwrap();

        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        let first = h.store.dispatched(task_id).remove(0);
        assert_eq!(first.key.phase, "A");
        assert!(h.store.assignments_for(task_id).iter().all(|r| r.key.phase == "A"));
        assert!(h.orchestrator.slot_states(task_id).iter().all(|(k, _)| k.0 == 0));

        h.store.complete_assignment(&first.key, Some(json!({"summary": "done"})));
        eventually(|| h.store.dispatched(task_id).iter().any(|r| r.key.phase == "B")).await;

        h.orchestrator.monitor_progress().await.unwrap();
        assert_eq!(h.store.progress(task_id), Some(0.5));

        let second = h.store.dispatched(task_id).remove(0);
        h.store.complete_assignment(&second.key, Some(json!({})));
        eventually(|| h.status(task_id) == Some(TaskStatus::Completed)).await;

        let events = events.drain();
        let passed_a = events
            .iter()
            .position(|e| matches!(e, CoreEvent::CheckpointPassed { phase, .. } if phase == "A"))
            .unwrap();
        let assigned_b = events
            .iter()
            .position(|e| matches!(e, CoreEvent::TaskAssigned { phase, .. } if phase == "B"))
            .unwrap();
        assert!(passed_a < assigned_b);
        assert!(events.iter().any(|e| matches!(e, CoreEvent::TaskCompleted { task_id: id, .. } if *id == task_id)));
        assert!(events.iter().any(|e| matches!(e, CoreEvent::ProgressUpdate { progress, .. } if *progress == 0.5)));
        assert!(h.orchestrator.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_assignment_hands_slot_out_once() {
        let h = harness();
        let task_id = h
            .orchestrator
            .submit_task(Task::new("solo job").with_phases(["solo"]))
            .await
            .unwrap();
        // no agents yet, so the only slot stays queued
        eventually(|| h.has_queued_slot(task_id)).await;

        let agents: Vec<_> = (0..3).map(|i| h.agent(&format!("w{i}"))).collect();
        let attempts = join_all((0..8).map(|_| h.orchestrator.assign_agents_to_phase(task_id, 0))).await;
        let assigned: usize = attempts.into_iter().map(|r| r.unwrap()).sum();

        assert_eq!(assigned, 1);
        assert_eq!(h.store.dispatched(task_id).len(), 1);
        let busy = agents
            .iter()
            .filter(|a| h.directory.status(a) == Some(AgentStatus::Busy))
            .count();
        assert_eq!(busy, 1);
    }

    #[tokio::test]
    async fn test_unopened_phase_gets_no_assignments() {
        let h = harness();
        let task_id = h
            .orchestrator
            .submit_task(Task::new("two step").with_phases(["A", "B"]))
            .await
            .unwrap();
        h.agent("late");
        assert_eq!(h.orchestrator.assign_agents_to_phase(task_id, 1).await.unwrap(), 0);
        assert!(h.store.dispatched(task_id).iter().all(|r| r.key.phase == "A"));
    }

    #[tokio::test]
    async fn test_best_success_rate_wins() {
        let h = harness();
        let weak = h.agent("weak");
        let strong = h.agent("strong");
        h.performance.seed(weak, 1, 10);
        h.performance.seed(strong.clone(), 9, 10);

        let task_id = h.orchestrator.submit_task(Task::new("pick well").with_phases(["only"])).await.unwrap();
        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        assert_eq!(h.store.dispatched(task_id)[0].agent_id, strong);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_aborts_task() {
        let h = harness();
        let worker = h.agent("w1");
        let mut events = h.bus.events().subscribe();
        let task_id = h
            .orchestrator
            .submit_task(Task::new("doomed").with_phases(["A", "B"]))
            .await
            .unwrap();

        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        let record = h.store.dispatched(task_id).remove(0);
        h.store.fail_assignment(&record.key, "compiler crashed");
        eventually(|| h.status(task_id) == Some(TaskStatus::Failed)).await;

        assert!(h.store.assignments_for(task_id).iter().all(|r| r.key.phase == "A"));
        assert_eq!(h.directory.status(&worker), Some(AgentStatus::Idle));
        assert_eq!(h.performance.success_rate(&worker).await.unwrap(), Some(0.0));
        let stored = h.store.task(task_id).unwrap();
        assert!(stored.error.unwrap().contains("'A'"));
        assert!(events.drain().iter().any(|e| matches!(
            e,
            CoreEvent::TaskFailed { reason, .. } if reason == "checkpoint_failure"
        )));
    }

    #[tokio::test]
    async fn test_parallel_phases_dispatch_together() {
        let h = harness();
        h.agent("w1");
        h.agent("w2");
        let task_id = h
            .orchestrator
            .submit_task(Task::new("fan out").with_strategy(TaskStrategy::Parallel).with_phases(["A", "B"]))
            .await
            .unwrap();

        eventually(|| h.store.dispatched(task_id).len() == 2).await;
        let dispatched = h.store.dispatched(task_id);
        let mut phases: Vec<_> = dispatched.iter().map(|r| r.key.phase.as_str()).collect();
        phases.sort();
        assert_eq!(phases, vec!["A", "B"]);
        assert_eq!(h.status(task_id), Some(TaskStatus::Running));

        for record in &dispatched {
            h.store.complete_assignment(&record.key, Some(json!({})));
        }
        eventually(|| h.status(task_id) == Some(TaskStatus::Completed)).await;
    }

    #[tokio::test]
    async fn test_simple_adaptive_task_runs_parallel_and_fails_on_bad_phase() {
        let h = harness();
        h.agent("w1");
        h.agent("w2");
        let mut events = h.bus.events().subscribe();
        let task_id = h
            .orchestrator
            .submit_task(Task::new("tiny job").with_strategy(TaskStrategy::Adaptive).with_phases(["A", "B"]))
            .await
            .unwrap();
        assert_eq!(h.orchestrator.execution_plan(task_id).unwrap().strategy, TaskStrategy::Parallel);

        eventually(|| h.store.dispatched(task_id).len() == 2).await;
        for record in h.store.dispatched(task_id) {
            if record.key.phase == "A" {
                h.store.fail_assignment(&record.key, "bad input");
            } else {
                h.store.complete_assignment(&record.key, Some(json!({})));
            }
        }
        eventually(|| h.status(task_id) == Some(TaskStatus::Failed)).await;

        assert!(h.store.task(task_id).unwrap().error.unwrap().contains("'A'"));
        assert!(events.drain().iter().any(|e| matches!(
            e,
            CoreEvent::TaskFailed { reason, .. } if reason == "checkpoint_failure"
        )));
    }

    #[tokio::test]
    async fn test_assignment_timeout_counts_as_failure() {
        let h = harness_with(
            OrchestratorConfig {
                assignment_timeout: Duration::from_millis(50),
                ..test_config()
            },
            None,
        );
        let worker = h.agent("sleepy");
        let task_id = h.orchestrator.submit_task(Task::new("never done").with_phases(["A"])).await.unwrap();

        eventually(|| h.status(task_id) == Some(TaskStatus::Failed)).await;
        assert_eq!(h.directory.status(&worker), Some(AgentStatus::Idle));
        assert_eq!(h.performance.success_rate(&worker).await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_cancel_notifies_and_releases_agents() {
        let h = harness();
        let worker = h.agent("w1");
        let mut inbox = h.bus.connect(worker.clone());
        let mut events = h.bus.events().subscribe();
        let task_id = h.orchestrator.submit_task(Task::new("long job").with_phases(["A"])).await.unwrap();
        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        let record = h.store.dispatched(task_id).remove(0);

        h.orchestrator.cancel_task(task_id).await.unwrap();
        assert_eq!(kinds(&mut inbox), vec![ASSIGNMENT_MESSAGE, CANCELLED_MESSAGE]);
        assert_eq!(h.directory.status(&worker), Some(AgentStatus::Idle));
        assert_eq!(h.status(task_id), Some(TaskStatus::Cancelled));
        assert!(h.orchestrator.execution_plan(task_id).is_none());

        // a late completion is ignored
        h.store.complete_assignment(&record.key, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.status(task_id), Some(TaskStatus::Cancelled));
        let cancelled = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::TaskCancelled { .. }))
            .count();
        assert_eq!(cancelled, 1);

        assert_eq!(h.orchestrator.cancel_task(task_id).await.unwrap_err().reason(), "not_found");
    }

    #[tokio::test]
    async fn test_approval_starts_task() {
        let h = harness();
        let voters = [h.agent("v1"), h.agent("v2")];
        let task_id = h
            .orchestrator
            .submit_task(Task::new("risky migration").in_swarm("swarm").with_phases(["A"]).needing_approval())
            .await
            .unwrap();
        assert_eq!(h.status(task_id), Some(TaskStatus::AwaitingApproval));
        assert!(h.store.dispatched(task_id).is_empty());
        assert_eq!(h.orchestrator.pending_tasks(), vec![task_id]);

        let proposal_id = h.consensus.active_proposals()[0];
        for voter in &voters {
            h.consensus
                .submit_vote(ConsensusVote::new(proposal_id, voter.clone(), true))
                .await
                .unwrap();
        }
        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        assert_eq!(h.status(task_id), Some(TaskStatus::Running));
        assert!(h.orchestrator.pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_approval_fails_task() {
        let h = harness();
        let voter = h.agent("v1");
        let task_id = h
            .orchestrator
            .submit_task(Task::new("risky migration").in_swarm("swarm").needing_approval())
            .await
            .unwrap();
        let proposal_id = h.consensus.active_proposals()[0];
        h.consensus
            .submit_vote(ConsensusVote::new(proposal_id, voter, false))
            .await
            .unwrap();

        assert_eq!(h.status(task_id), Some(TaskStatus::Failed));
        assert!(h.store.task(task_id).unwrap().error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_blocked_task_starts_after_dependency() {
        let h = harness();
        h.agent("w1");
        let first = h.orchestrator.submit_task(Task::new("first").with_phases(["only"])).await.unwrap();
        let second = h
            .orchestrator
            .submit_task(Task::new("second").with_phases(["only"]).depends_on(first))
            .await
            .unwrap();
        assert_eq!(h.status(second), Some(TaskStatus::Blocked));
        assert_eq!(h.orchestrator.release_pending().await.unwrap(), 0);

        eventually(|| h.store.dispatched(first).len() == 1).await;
        let record = h.store.dispatched(first).remove(0);
        h.store.complete_assignment(&record.key, Some(json!({})));
        eventually(|| h.status(first) == Some(TaskStatus::Completed)).await;

        assert_eq!(h.orchestrator.release_pending().await.unwrap(), 1);
        eventually(|| h.store.dispatched(second).len() == 1).await;
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let h = harness();
        let err = h.orchestrator.submit_task(Task::new("  ")).await.unwrap_err();
        assert_eq!(err.reason(), "validation");
        let err = h
            .orchestrator
            .submit_task(Task::new("orphan").depends_on(TaskId::new()))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[tokio::test]
    async fn test_rebalance_fills_queued_slot() {
        let h = harness_with(
            OrchestratorConfig {
                load_factor_threshold: 0.5,
                ..test_config()
            },
            None,
        );
        for i in 0..3 {
            let busy = h.agent(&format!("busy{i}"));
            h.directory.set_status(&busy, AgentStatus::Busy);
        }
        let gpu = h.capable_agent("gpu", &["gpu"]);
        h.directory.set_status(&gpu, AgentStatus::Offline);

        let task_id = h
            .orchestrator
            .submit_task(Task::new("render").requiring(["gpu"]).with_phases(["render"]))
            .await
            .unwrap();
        eventually(|| h.has_queued_slot(task_id)).await;

        h.directory.set_status(&gpu, AgentStatus::Idle);
        assert_eq!(h.orchestrator.rebalance().await.unwrap(), 1);
        assert_eq!(h.store.dispatched(task_id)[0].agent_id, gpu);
        assert_eq!(h.directory.status(&gpu), Some(AgentStatus::Busy));
        assert_eq!(h.orchestrator.rebalance().await.unwrap(), 0);
    }

    #[derive(Default)]
    struct ScriptedBalancer {
        moves: Mutex<Vec<Reassignment>>,
    }

    #[async_trait]
    impl LoadBalancer for ScriptedBalancer {
        async fn plan(&self, _snapshot: &LoadSnapshot) -> anyhow::Result<Vec<Reassignment>> {
            Ok(std::mem::take(&mut *self.moves.lock()))
        }
    }

    #[tokio::test]
    async fn test_reassignment_notifies_both_agents() {
        let balancer = Arc::new(ScriptedBalancer::default());
        let h = harness_with(
            OrchestratorConfig {
                load_factor_threshold: 0.0,
                ..test_config()
            },
            Some(balancer.clone()),
        );
        let from = h.agent("a");
        let mut from_inbox = h.bus.connect(from.clone());
        let running = h.orchestrator.submit_task(Task::new("job").with_phases(["x"])).await.unwrap();
        eventually(|| h.store.dispatched(running).len() == 1).await;

        // queued work keeps the snapshot eligible for rebalancing
        let queued = h
            .orchestrator
            .submit_task(Task::new("needs gpu").requiring(["gpu"]).with_phases(["x"]))
            .await
            .unwrap();
        eventually(|| h.has_queued_slot(queued)).await;

        let to = h.agent("b");
        let mut to_inbox = h.bus.connect(to.clone());
        balancer.moves.lock().push(Reassignment {
            task_id: running,
            phase_index: 0,
            slot: 0,
            from: Some(from.clone()),
            to: to.clone(),
        });

        assert_eq!(h.orchestrator.rebalance().await.unwrap(), 1);
        assert_eq!(h.directory.status(&from), Some(AgentStatus::Idle));
        assert_eq!(h.directory.status(&to), Some(AgentStatus::Busy));
        assert_eq!(kinds(&mut from_inbox), vec![ASSIGNMENT_MESSAGE, REASSIGNED_MESSAGE]);
        assert_eq!(kinds(&mut to_inbox), vec![ASSIGNMENT_MESSAGE]);
        assert_eq!(h.store.dispatched(running)[0].agent_id, to);
    }

    /// Pauses `try_reserve` for one agent until the test lets it through
    struct PausingDirectory {
        inner: Arc<InMemoryAgentDirectory>,
        paused: AgentId,
        reached: tokio::sync::Notify,
        resume: tokio::sync::Notify,
    }

    #[async_trait]
    impl AgentDirectory for PausingDirectory {
        async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
            self.inner.list_agents().await
        }

        async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentInfo>> {
            self.inner.get_agent(id).await
        }

        async fn try_reserve(&self, id: &AgentId, task_id: TaskId) -> anyhow::Result<bool> {
            if *id == self.paused {
                self.reached.notify_one();
                self.resume.notified().await;
            }
            self.inner.try_reserve(id, task_id).await
        }

        async fn release(&self, id: &AgentId) -> anyhow::Result<()> {
            self.inner.release(id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_reassignment_frees_both_agents() {
        let balancer = Arc::new(ScriptedBalancer::default());
        let to = AgentId::new("swarm", "b");
        let mut pausing = None;
        let h = harness_over(
            OrchestratorConfig {
                load_factor_threshold: 0.0,
                ..test_config()
            },
            Some(balancer.clone()),
            |inner| {
                let directory = Arc::new(PausingDirectory {
                    inner,
                    paused: to.clone(),
                    reached: tokio::sync::Notify::new(),
                    resume: tokio::sync::Notify::new(),
                });
                pausing = Some(Arc::clone(&directory));
                directory as Arc<dyn AgentDirectory>
            },
        );
        let pausing = pausing.unwrap();

        let from = h.agent("a");
        let running = h.orchestrator.submit_task(Task::new("job").with_phases(["x"])).await.unwrap();
        eventually(|| h.store.dispatched(running).len() == 1).await;
        let queued = h
            .orchestrator
            .submit_task(Task::new("needs gpu").requiring(["gpu"]).with_phases(["x"]))
            .await
            .unwrap();
        eventually(|| h.has_queued_slot(queued)).await;

        h.agent("b");
        balancer.moves.lock().push(Reassignment {
            task_id: running,
            phase_index: 0,
            slot: 0,
            from: Some(from.clone()),
            to: to.clone(),
        });

        let orchestrator = Arc::clone(&h.orchestrator);
        let rebalance = tokio::spawn(async move { orchestrator.rebalance().await });
        pausing.reached.notified().await;
        h.orchestrator.cancel_task(running).await.unwrap();
        pausing.resume.notify_one();

        assert_eq!(rebalance.await.unwrap().unwrap(), 0);
        assert_eq!(h.directory.status(&from), Some(AgentStatus::Idle));
        assert_eq!(h.directory.status(&to), Some(AgentStatus::Idle));
        assert_eq!(h.status(running), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_borderline_checkpoint_goes_to_review() {
        let h = harness_with(
            OrchestratorConfig {
                checkpoint_review_margin: 0.35,
                ..test_config()
            },
            None,
        );
        let worker = h.agent("w1");
        let task_id = h
            .orchestrator
            .submit_task(
                Task::new("careful change")
                    .in_swarm("swarm")
                    .with_strategy(TaskStrategy::Consensus)
                    .with_phases(["A"]),
            )
            .await
            .unwrap();
        eventually(|| h.store.dispatched(task_id).len() == 1).await;
        let record = h.store.dispatched(task_id).remove(0);
        // no output: score 0.8, inside the review margin
        h.store.complete_assignment(&record.key, None);

        eventually(|| !h.consensus.active_proposals().is_empty()).await;
        let review = h.consensus.active_proposals()[0];
        assert_eq!(h.status(task_id), Some(TaskStatus::Running));
        h.consensus
            .submit_vote(ConsensusVote::new(review, worker, true))
            .await
            .unwrap();
        eventually(|| h.status(task_id) == Some(TaskStatus::Completed)).await;
    }
}
