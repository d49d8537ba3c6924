//! Execution planning and checkpoints
//!
//! A plan is derived once per task. Each phase carries its assignment slots
//! and the checkpoint gating the next phase.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::analysis::ComplexityEstimate;
use super::task::{Task, TaskStrategy};
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::TaskId;

/// Phases of a task that names none
pub const DEFAULT_PHASES: [&str; 3] = ["analyze", "execute", "verify"];

/// One unit of work handed to one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSpec {
    /// Role the agent plays
    pub role: String,
    /// Capabilities the agent must have
    pub required_capabilities: Vec<String>,
    /// What the agent is asked to do
    pub responsibilities: Vec<String>,
    /// What the agent should hand back
    pub expected_output: String,
    /// Time allowed before the slot times out
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Whether it may run alongside other phases
    pub parallelizable: bool,
}

/// What a validation criterion measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Completed slots over all slots
    SuccessRate,
    /// Completed slots that reported an output, over all slots
    OutputsProduced,
    /// Slots that did not time out, over all slots
    WithinTimeout,
}

/// A weighted measure in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCriterion {
    /// Criterion name
    pub name: String,
    /// Relative weight
    pub weight: f64,
    /// What is measured
    pub kind: CriterionKind,
}

impl ValidationCriterion {
    /// Criterion named after its kind
    pub fn new(kind: CriterionKind, weight: f64) -> Self {
        let name = match kind {
            CriterionKind::SuccessRate => "success_rate",
            CriterionKind::OutputsProduced => "outputs_produced",
            CriterionKind::WithinTimeout => "within_timeout",
        };
        Self {
            name: name.to_string(),
            weight,
            kind,
        }
    }
}

/// Tally of one finished phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    /// Phase name
    pub phase: String,
    /// Phase position
    pub index: usize,
    /// Slots in the phase
    pub total: usize,
    /// Slots completed
    pub completed: usize,
    /// Slots failed
    pub failed: usize,
    /// Slots timed out
    pub timed_out: usize,
    /// Completed slots that reported output
    pub outputs: usize,
}

impl PhaseOutcome {
    /// Completed slots over all slots
    pub fn success_rate(&self) -> f64 {
        ratio(self.completed, self.total)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Gate a phase must pass before the task moves on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Phase it gates
    pub phase_index: usize,
    /// Cumulative share of phases done once this checkpoint passes
    pub required_progress: f64,
    /// Weighted measures
    pub criteria: Vec<ValidationCriterion>,
    /// Minimum weighted score
    pub failure_threshold: f64,
}

impl Checkpoint {
    /// Weighted average of the criteria scores
    pub fn evaluate(&self, outcome: &PhaseOutcome) -> f64 {
        let total_weight: f64 = self.criteria.iter().map(|c| c.weight).sum();
        if total_weight <= 0.0 {
            return outcome.success_rate();
        }
        self.criteria
            .iter()
            .map(|c| {
                let score = match c.kind {
                    CriterionKind::SuccessRate => outcome.success_rate(),
                    CriterionKind::OutputsProduced => ratio(outcome.outputs, outcome.total),
                    CriterionKind::WithinTimeout => 1.0 - ratio(outcome.timed_out, outcome.total),
                };
                c.weight * score
            })
            .sum::<f64>()
            / total_weight
    }

    /// Whether `score` meets the threshold
    pub fn passes(&self, score: f64) -> bool {
        score >= self.failure_threshold
    }

    /// Whether `progress`, with this phase counted as done, reaches the
    /// share of the plan this checkpoint stands for
    pub fn progress_reached(&self, progress: f64) -> bool {
        progress + f64::EPSILON >= self.required_progress
    }
}

/// One planned phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Phase name
    pub name: String,
    /// One assignment per slot
    pub assignments: Vec<AssignmentSpec>,
    /// Gate at the end of the phase
    pub checkpoint: Checkpoint,
}

/// How a task will run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Planned task
    pub task_id: TaskId,
    /// Resolved strategy; never `Adaptive`
    pub strategy: TaskStrategy,
    /// Phases in order
    pub phases: Vec<PhasePlan>,
    /// Phases may run together
    pub parallelizable: bool,
    /// Estimate the plan was built from
    pub estimate: ComplexityEstimate,
}

impl ExecutionPlan {
    /// Phase names in order
    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Builds [`ExecutionPlan`]s
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    failure_threshold: f64,
    assignment_timeout: Duration,
    max_agents_per_phase: usize,
}

impl ExecutionPlanner {
    /// Planner using the orchestrator settings
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            failure_threshold: config.checkpoint_failure_threshold,
            assignment_timeout: config.assignment_timeout,
            max_agents_per_phase: config.max_agents_per_phase.max(1),
        }
    }

    /// Plan `task`. `Adaptive` resolves to parallel below complexity 0.5, sequential otherwise.
    pub fn plan(&self, task: &Task, estimate: &ComplexityEstimate) -> CoreResult<ExecutionPlan> {
        let names: Vec<String> = match &task.phases {
            Some(phases) if phases.is_empty() => {
                return Err(CoreError::Validation(format!("task {} declares no phases", task.id)))
            }
            Some(phases) => phases.clone(),
            None => DEFAULT_PHASES.iter().map(|p| p.to_string()).collect(),
        };

        let strategy = match task.strategy {
            TaskStrategy::Adaptive if estimate.complexity < 0.5 => TaskStrategy::Parallel,
            TaskStrategy::Adaptive => TaskStrategy::Sequential,
            other => other,
        };
        let parallelizable = strategy == TaskStrategy::Parallel;
        let count = names.len();

        let phases = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let slots = if name == "execute" {
                    estimate.recommended_agents.clamp(1, self.max_agents_per_phase)
                } else {
                    1
                };
                let spec = self.assignment_for(task, &name, parallelizable);
                PhasePlan {
                    assignments: vec![spec; slots],
                    checkpoint: Checkpoint {
                        phase_index: index,
                        required_progress: (index + 1) as f64 / count as f64,
                        criteria: vec![
                            ValidationCriterion::new(CriterionKind::SuccessRate, 0.6),
                            ValidationCriterion::new(CriterionKind::OutputsProduced, 0.2),
                            ValidationCriterion::new(CriterionKind::WithinTimeout, 0.2),
                        ],
                        failure_threshold: self.failure_threshold,
                    },
                    name,
                }
            })
            .collect();

        Ok(ExecutionPlan {
            task_id: task.id,
            strategy,
            phases,
            parallelizable,
            estimate: estimate.clone(),
        })
    }

    fn assignment_for(&self, task: &Task, phase: &str, parallelizable: bool) -> AssignmentSpec {
        let (role, responsibility, output) = match phase {
            "analyze" => ("analyst", "break the task down and identify risks", "analysis report"),
            "execute" => ("worker", "carry out the planned work", "work product"),
            "verify" => ("reviewer", "check the work against the task", "verification report"),
            _ => (phase, "complete the phase", "phase output"),
        };
        AssignmentSpec {
            role: role.to_string(),
            required_capabilities: task.required_capabilities.clone(),
            responsibilities: vec![responsibility.to_string(), task.description.clone()],
            expected_output: output.to_string(),
            timeout: self.assignment_timeout,
            parallelizable,
        }
    }
}
