//! Tasks as submitted by callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Priority, TaskId};

/// How a task's phases are run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategy {
    /// Every phase at once, results aggregated at the end
    Parallel,
    /// One phase at a time, each gated on the previous checkpoint
    #[default]
    Sequential,
    /// Parallel for simple tasks, sequential otherwise
    Adaptive,
    /// Sequential, with borderline checkpoints put to a vote
    Consensus,
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    /// Waiting on an approval proposal
    AwaitingApproval,
    /// Waiting on unfinished dependencies
    Blocked,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has finished one way or another
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A unit of work submitted to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// What needs doing
    pub description: String,
    /// Namespace of the agents that may work on and vote about this task
    pub swarm_id: String,
    /// How phases are run
    pub strategy: TaskStrategy,
    /// Scheduling priority
    pub priority: Priority,
    /// Tasks that must complete first
    pub dependencies: Vec<TaskId>,
    /// Capabilities every assigned agent needs
    pub required_capabilities: Vec<String>,
    /// Put the task to a vote before it starts
    pub requires_consensus: bool,
    /// Custom phase names; the planner's defaults are used when unset
    pub phases: Option<Vec<String>>,
    /// Current status
    pub status: TaskStatus,
    /// Why the task failed
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task in the default swarm
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            swarm_id: "default".to_string(),
            strategy: TaskStrategy::default(),
            priority: Priority::Normal,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            requires_consensus: false,
            phases: None,
            status: TaskStatus::Pending,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Set the swarm
    pub fn in_swarm(mut self, swarm_id: impl Into<String>) -> Self {
        self.swarm_id = swarm_id.into();
        self
    }

    /// Set the strategy
    pub fn with_strategy(mut self, strategy: TaskStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(task_id);
        self
    }

    /// Set the required capabilities
    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Use custom phase names
    pub fn with_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases = Some(phases.into_iter().map(Into::into).collect());
        self
    }

    /// Require an approval vote
    pub fn needing_approval(mut self) -> Self {
        self.requires_consensus = true;
        self
    }
}
