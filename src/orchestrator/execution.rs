//! Per-task execution state
//!
//! Slots move `Queued → Claiming → Assigned → {Completed | Failed | TimedOut}`.
//! A caller claims a slot under the execution lock before talking to the
//! agent directory, so no two callers ever work the same slot. Slots only
//! exist for phases that have been opened.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::plan::{AssignmentSpec, ExecutionPlan, PhaseOutcome};
use super::task::Task;
use crate::types::AgentId;

/// Lifecycle of one assignment slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for an agent
    Queued,
    /// An agent is being reserved
    Claiming,
    /// Held by an agent
    Assigned(AgentId),
    /// Finished by `agent`
    Completed { agent: AgentId, has_output: bool },
    /// Reported failed
    Failed(String),
    /// No result before the phase deadline
    TimedOut,
}

impl SlotState {
    /// Whether the slot has a final outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotState::Completed { .. } | SlotState::Failed(_) | SlotState::TimedOut)
    }
}

/// `(phase index, slot index)`
pub type SlotKey = (usize, usize);

/// Live state of a running task
#[derive(Debug)]
pub struct Execution {
    /// The task being run
    pub task: Task,
    /// Its plan
    pub plan: ExecutionPlan,
    slots: BTreeMap<SlotKey, SlotState>,
    /// Phases that passed their checkpoint
    pub completed_phases: usize,
    /// Progress last reported as an event
    pub last_published_progress: f64,
    /// Cancelled when the task stops
    pub cancel: CancellationToken,
    /// Set when execution starts
    pub started_at: Option<Instant>,
}

impl Execution {
    /// Create the state for a planned task with no phase open
    pub fn new(task: Task, plan: ExecutionPlan) -> Self {
        Self {
            task,
            plan,
            slots: BTreeMap::new(),
            completed_phases: 0,
            last_published_progress: 0.0,
            cancel: CancellationToken::new(),
            started_at: None,
        }
    }

    pub fn total_phases(&self) -> usize {
        self.plan.phases.len()
    }

    /// Completed phases over total phases
    pub fn progress(&self) -> f64 {
        if self.plan.phases.is_empty() {
            return 0.0;
        }
        self.completed_phases as f64 / self.plan.phases.len() as f64
    }

    pub fn is_phase_open(&self, phase: usize) -> bool {
        self.slots.keys().any(|(p, _)| *p == phase)
    }

    /// Create the queued slots of a phase. Returns false if already open.
    pub fn open_phase(&mut self, phase: usize) -> bool {
        if self.is_phase_open(phase) {
            return false;
        }
        let count = self.plan.phases.get(phase).map_or(0, |p| p.assignments.len());
        for slot in 0..count {
            self.slots.insert((phase, slot), SlotState::Queued);
        }
        count > 0
    }

    /// [`AssignmentSpec`] behind a slot
    pub fn spec(&self, (phase, slot): SlotKey) -> Option<&AssignmentSpec> {
        self.plan.phases.get(phase)?.assignments.get(slot)
    }

    /// Name of a phase, empty if out of range
    pub fn phase_name(&self, phase: usize) -> &str {
        self.plan.phases.get(phase).map_or("", |p| p.name.as_str())
    }

    pub fn slot(&self, key: SlotKey) -> Option<&SlotState> {
        self.slots.get(&key)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&SlotKey, &SlotState)> {
        self.slots.iter()
    }

    /// Slots of one phase in order
    pub fn phase_slots(&self, phase: usize) -> Vec<SlotKey> {
        self.slots.keys().filter(|(p, _)| *p == phase).copied().collect()
    }

    /// Move queued slots of `phase` (or of every open phase) to claiming
    pub fn claim_queued(&mut self, phase: Option<usize>) -> Vec<(SlotKey, AssignmentSpec)> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let keys: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|(k, s)| **s == SlotState::Queued && phase.map_or(true, |p| k.0 == p))
            .map(|(k, _)| *k)
            .collect();
        let mut claimed = Vec::new();
        for key in keys {
            if let Some(spec) = self.spec(key).cloned() {
                self.slots.insert(key, SlotState::Claiming);
                claimed.push((key, spec));
            }
        }
        claimed
    }

    /// Claim one specific queued slot
    pub fn claim(&mut self, key: SlotKey) -> bool {
        match self.slots.get_mut(&key) {
            Some(state @ SlotState::Queued) if !self.cancel.is_cancelled() => {
                *state = SlotState::Claiming;
                true
            }
            _ => false,
        }
    }

    /// Claim a slot currently held by `holder` so it can be handed to another agent
    pub fn reclaim(&mut self, key: SlotKey, holder: &AgentId) -> bool {
        match self.slots.get_mut(&key) {
            Some(state) if !self.cancel.is_cancelled() && *state == SlotState::Assigned(holder.clone()) => {
                *state = SlotState::Claiming;
                true
            }
            _ => false,
        }
    }

    /// Put a claimed or assigned slot back in the queue, returning its previous holder
    pub fn requeue(&mut self, key: SlotKey) -> Option<AgentId> {
        let state = self.slots.get_mut(&key)?;
        match std::mem::replace(state, SlotState::Queued) {
            SlotState::Assigned(agent) => Some(agent),
            SlotState::Claiming => None,
            other => {
                *state = other;
                None
            }
        }
    }

    /// Give a claimed slot back to the queue
    pub fn unclaim(&mut self, key: SlotKey) {
        if let Some(state) = self.slots.get_mut(&key) {
            if *state == SlotState::Claiming {
                *state = SlotState::Queued;
            }
        }
    }

    /// Bind a claimed slot to `agent`. Fails if the slot is no longer being
    /// claimed or the execution was cancelled.
    pub fn assign(&mut self, key: SlotKey, agent: AgentId) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.slots.get_mut(&key) {
            Some(state) if *state == SlotState::Claiming => {
                *state = SlotState::Assigned(agent);
                true
            }
            _ => false,
        }
    }

    /// Record a terminal state for an assigned or queued slot
    pub fn finish(&mut self, key: SlotKey, outcome: SlotState) -> bool {
        match self.slots.get_mut(&key) {
            Some(state) if !state.is_terminal() => {
                *state = outcome;
                true
            }
            _ => false,
        }
    }

    /// Agent holding a slot
    pub fn assigned_agent(&self, key: SlotKey) -> Option<&AgentId> {
        match self.slots.get(&key) {
            Some(SlotState::Assigned(agent)) => Some(agent),
            _ => None,
        }
    }

    /// Agents currently holding a slot
    pub fn assigned_agents(&self) -> Vec<AgentId> {
        self.slots
            .values()
            .filter_map(|s| match s {
                SlotState::Assigned(agent) => Some(agent.clone()),
                _ => None,
            })
            .collect()
    }

    /// Slots waiting for an agent
    pub fn queued_slots(&self) -> Vec<SlotKey> {
        self.slots
            .iter()
            .filter(|(_, s)| **s == SlotState::Queued)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Tally the slots of a phase
    pub fn outcome(&self, phase: usize) -> PhaseOutcome {
        let mut outcome = PhaseOutcome {
            phase: self.phase_name(phase).to_string(),
            index: phase,
            ..Default::default()
        };
        for ((p, _), state) in &self.slots {
            if *p != phase {
                continue;
            }
            outcome.total += 1;
            match state {
                SlotState::Completed { has_output, .. } => {
                    outcome.completed += 1;
                    if *has_output {
                        outcome.outputs += 1;
                    }
                }
                SlotState::Failed(_) => outcome.failed += 1,
                SlotState::TimedOut => outcome.timed_out += 1,
                _ => {}
            }
        }
        outcome
    }
}
