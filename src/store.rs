//! Persistent store interfaces for tasks, assignments and proposals
//!
//! Storage engines are external; the core talks to them through these traits.
//! Agents report assignment completion by writing to the [`TaskStore`], which
//! the orchestrator polls while waiting on a phase.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::consensus::proposal::{ConsensusProposal, ProposalStatus};
use crate::orchestrator::task::{Task, TaskStatus};
use crate::types::{AgentId, ProposalId, TaskId};

/// Identifies one assignment slot of one phase of a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentKey {
    /// Owning task
    pub task_id: TaskId,
    /// Phase name
    pub phase: String,
    /// Slot position in the phase
    pub slot: usize,
}

impl AssignmentKey {
    pub fn new(task_id: TaskId, phase: impl Into<String>, slot: usize) -> Self {
        Self {
            task_id,
            phase: phase.into(),
            slot,
        }
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.task_id, self.phase, self.slot)
    }
}

/// Progress of a dispatched assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Sent to the agent, no result yet
    Dispatched,
    Completed,
    Failed,
}

impl AssignmentStatus {
    /// Whether the agent has reported back
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssignmentStatus::Dispatched)
    }
}

/// A dispatched assignment and its result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Which slot
    pub key: AssignmentKey,
    /// Assigned agent
    pub agent_id: AgentId,
    /// Current status
    pub status: AssignmentStatus,
    /// Result or error detail reported by the agent
    pub output: Option<serde_json::Value>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Task and assignment persistence
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> anyhow::Result<()>;

    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> anyhow::Result<()>;

    async fn task_status(&self, task_id: TaskId) -> anyhow::Result<Option<TaskStatus>>;

    async fn record_progress(&self, task_id: TaskId, progress: f64) -> anyhow::Result<()>;

    async fn put_assignment(&self, record: AssignmentRecord) -> anyhow::Result<()>;

    async fn assignment(&self, key: &AssignmentKey) -> anyhow::Result<Option<AssignmentRecord>>;
}

/// Proposal persistence
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn save_proposal(&self, proposal: &ConsensusProposal) -> anyhow::Result<()>;

    async fn update_proposal_status(
        &self,
        id: ProposalId,
        status: ProposalStatus,
    ) -> anyhow::Result<()>;

    async fn proposal_status(&self, id: ProposalId) -> anyhow::Result<Option<ProposalStatus>>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    task: Task,
    progress: f64,
}

/// Process-local [`TaskStore`]; agents call [`complete_assignment`](Self::complete_assignment)
/// and [`fail_assignment`](Self::fail_assignment) to report work
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, StoredTask>>,
    assignments: RwLock<HashMap<AssignmentKey, AssignmentRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed assignment. Returns false if it was never dispatched.
    pub fn complete_assignment(&self, key: &AssignmentKey, output: Option<serde_json::Value>) -> bool {
        self.finish(key, AssignmentStatus::Completed, output)
    }

    /// Record a failed assignment
    pub fn fail_assignment(&self, key: &AssignmentKey, reason: impl Into<String>) -> bool {
        self.finish(key, AssignmentStatus::Failed, Some(serde_json::json!({ "error": reason.into() })))
    }

    fn finish(&self, key: &AssignmentKey, status: AssignmentStatus, output: Option<serde_json::Value>) -> bool {
        match self.assignments.write().get_mut(key) {
            Some(record) => {
                record.status = status;
                record.output = output;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Assignments currently dispatched for a task, in slot order
    pub fn dispatched(&self, task_id: TaskId) -> Vec<AssignmentRecord> {
        let mut records: Vec<_> = self
            .assignments
            .read()
            .values()
            .filter(|r| r.key.task_id == task_id && r.status == AssignmentStatus::Dispatched)
            .cloned()
            .collect();
        records.sort_by(|a, b| (&a.key.phase, a.key.slot).cmp(&(&b.key.phase, b.key.slot)));
        records
    }

    /// Every assignment of a task
    pub fn assignments_for(&self, task_id: TaskId) -> Vec<AssignmentRecord> {
        self.assignments
            .read()
            .values()
            .filter(|r| r.key.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Stored copy of a task
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.read().get(&task_id).map(|s| s.task.clone())
    }

    /// Last recorded progress of a task
    pub fn progress(&self, task_id: TaskId) -> Option<f64> {
        self.tasks.read().get(&task_id).map(|s| s.progress)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write();
        let progress = tasks.get(&task.id).map(|s| s.progress).unwrap_or(0.0);
        tasks.insert(
            task.id,
            StoredTask {
                task: task.clone(),
                progress,
            },
        );
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow::anyhow!("unknown task {task_id}"))?;
        stored.task.status = status;
        if error.is_some() {
            stored.task.error = error;
        }
        Ok(())
    }

    async fn task_status(&self, task_id: TaskId) -> anyhow::Result<Option<TaskStatus>> {
        Ok(self.tasks.read().get(&task_id).map(|s| s.task.status))
    }

    async fn record_progress(&self, task_id: TaskId, progress: f64) -> anyhow::Result<()> {
        if let Some(stored) = self.tasks.write().get_mut(&task_id) {
            stored.progress = progress;
        }
        Ok(())
    }

    async fn put_assignment(&self, record: AssignmentRecord) -> anyhow::Result<()> {
        self.assignments.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn assignment(&self, key: &AssignmentKey) -> anyhow::Result<Option<AssignmentRecord>> {
        Ok(self.assignments.read().get(key).cloned())
    }
}

/// Process-local [`ProposalStore`]
#[derive(Default)]
pub struct InMemoryProposalStore {
    proposals: RwLock<HashMap<ProposalId, (ConsensusProposal, ProposalStatus)>>,
}

impl InMemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.proposals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.read().is_empty()
    }
}

#[async_trait]
impl ProposalStore for InMemoryProposalStore {
    async fn save_proposal(&self, proposal: &ConsensusProposal) -> anyhow::Result<()> {
        self.proposals
            .write()
            .insert(proposal.id, (proposal.clone(), ProposalStatus::Active));
        Ok(())
    }

    async fn update_proposal_status(
        &self,
        id: ProposalId,
        status: ProposalStatus,
    ) -> anyhow::Result<()> {
        match self.proposals.write().get_mut(&id) {
            Some(entry) => {
                entry.1 = status;
                Ok(())
            }
            None => anyhow::bail!("unknown proposal {id}"),
        }
    }

    async fn proposal_status(&self, id: ProposalId) -> anyhow::Result<Option<ProposalStatus>> {
        Ok(self.proposals.read().get(&id).map(|(_, s)| s.clone()))
    }
}
