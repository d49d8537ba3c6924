//! Load snapshots and the load-balancing collaborator

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentInfo;
use crate::types::{AgentId, Priority, TaskId};

/// A queued slot waiting for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnassignedSlot {
    /// Owning task
    pub task_id: TaskId,
    /// Phase name
    pub phase: String,
    /// Phase position in the plan
    pub phase_index: usize,
    /// Slot position in the phase
    pub slot: usize,
    /// Capabilities the agent must have
    pub required_capabilities: Vec<String>,
    /// Priority of the owning task
    pub priority: Priority,
}

/// Point-in-time view of agent load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// Agents in the directory
    pub total_agents: usize,
    /// Agents holding work
    pub busy: usize,
    /// Agents not reachable
    pub offline: usize,
    /// Agents free to take work
    pub idle_agents: Vec<AgentInfo>,
    /// Slots still waiting
    pub unassigned: Vec<UnassignedSlot>,
}

impl LoadSnapshot {
    /// Busy agents over online agents
    pub fn load_factor(&self) -> f64 {
        let online = self.busy + self.idle_agents.len();
        if online == 0 {
            0.0
        } else {
            self.busy as f64 / online as f64
        }
    }

    /// Load is above `threshold` and there is work for an idle agent
    pub fn wants_rebalance(&self, threshold: f64) -> bool {
        self.load_factor() > threshold && !self.idle_agents.is_empty() && !self.unassigned.is_empty()
    }
}

/// Move one slot to a new agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    /// Owning task
    pub task_id: TaskId,
    /// Phase position
    pub phase_index: usize,
    /// Slot position
    pub slot: usize,
    /// Agent currently holding the slot, if any
    pub from: Option<AgentId>,
    /// Agent taking the slot
    pub to: AgentId,
}

/// Decides which slots move where
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn plan(&self, snapshot: &LoadSnapshot) -> anyhow::Result<Vec<Reassignment>>;
}

/// Hands the highest-priority unassigned slots to capable idle agents, one
/// slot per agent
#[derive(Debug, Clone, Default)]
pub struct LeastLoadedBalancer;

#[async_trait]
impl LoadBalancer for LeastLoadedBalancer {
    async fn plan(&self, snapshot: &LoadSnapshot) -> anyhow::Result<Vec<Reassignment>> {
        let mut slots: Vec<&UnassignedSlot> = snapshot.unassigned.iter().collect();
        slots.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut taken: HashSet<&AgentId> = HashSet::new();
        let mut moves = Vec::new();
        for slot in slots {
            let candidate = snapshot
                .idle_agents
                .iter()
                .find(|a| !taken.contains(&a.id) && a.is_capable_of(&slot.required_capabilities));
            if let Some(agent) = candidate {
                taken.insert(&agent.id);
                moves.push(Reassignment {
                    task_id: slot.task_id,
                    phase_index: slot.phase_index,
                    slot: slot.slot,
                    from: None,
                    to: agent.id.clone(),
                });
            }
        }
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(priority: Priority, caps: &[&str]) -> UnassignedSlot {
        UnassignedSlot {
            task_id: TaskId::new(),
            phase: "execute".into(),
            phase_index: 1,
            slot: 0,
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            priority,
        }
    }

    fn idle(name: &str, caps: &[&str]) -> AgentInfo {
        AgentInfo::new(AgentId::new("swarm", name), "worker").with_capabilities(caps.iter().copied())
    }

    #[test]
    fn test_load_factor_and_trigger() {
        let mut snapshot = LoadSnapshot {
            total_agents: 10,
            busy: 9,
            idle_agents: vec![idle("a", &[])],
            ..Default::default()
        };
        assert!((snapshot.load_factor() - 0.9).abs() < 1e-9);
        assert!(!snapshot.wants_rebalance(0.8));
        snapshot.unassigned.push(slot(Priority::Normal, &[]));
        assert!(snapshot.wants_rebalance(0.8));
        assert!(!snapshot.wants_rebalance(0.95));
        assert_eq!(LoadSnapshot::default().load_factor(), 0.0);
    }

    #[tokio::test]
    async fn test_high_priority_first_and_capability_match() {
        let low = slot(Priority::Low, &[]);
        let critical = slot(Priority::Critical, &["gpu"]);
        let snapshot = LoadSnapshot {
            idle_agents: vec![idle("plain", &[]), idle("gpu", &["gpu"])],
            unassigned: vec![low.clone(), critical.clone()],
            ..Default::default()
        };
        let moves = LeastLoadedBalancer.plan(&snapshot).await.unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].task_id, critical.task_id);
        assert_eq!(moves[0].to.id, "gpu");
        assert_eq!(moves[1].task_id, low.task_id);
        assert_eq!(moves[1].to.id, "plain");
    }

    #[tokio::test]
    async fn test_one_slot_per_agent() {
        let snapshot = LoadSnapshot {
            idle_agents: vec![idle("only", &[])],
            unassigned: vec![slot(Priority::High, &[]), slot(Priority::High, &[])],
            ..Default::default()
        };
        assert_eq!(LeastLoadedBalancer.plan(&snapshot).await.unwrap().len(), 1);
    }
}
