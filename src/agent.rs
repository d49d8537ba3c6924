//! Agent directory and performance records
//!
//! Agents live outside the core. The orchestrator and consensus engine read
//! them through the injected [`AgentDirectory`] and [`PerformanceStore`]
//! traits; the in-memory implementations here back tests and single-process
//! deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AgentId, TaskId};

/// Agent availability as reported by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Available for work
    Idle,
    /// Holding an assignment
    Busy,
    /// Unreachable; never assigned and never eligible to vote
    Offline,
}

/// Directory view of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Unique identifier, namespaced by swarm
    pub id: AgentId,
    /// Free-form agent type (`coder`, `reviewer`, ...)
    pub agent_type: String,
    /// Capabilities matched against assignment requirements
    pub capabilities: HashSet<String>,
    /// Current availability
    pub status: AgentStatus,
    /// Task the agent is reserved for, if busy
    pub current_task: Option<TaskId>,
}

impl AgentInfo {
    /// Create an idle agent with no capabilities
    pub fn new(id: AgentId, agent_type: impl Into<String>) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            capabilities: HashSet::new(),
            status: AgentStatus::Idle,
            current_task: None,
        }
    }

    /// Replace the capability set
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this agent's capability set is a superset of `required`
    pub fn is_capable_of(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Lookup and reservation of external agents
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Every known agent
    async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>>;

    /// Look up one agent
    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentInfo>>;

    /// Idle agents whose capabilities cover `required`
    async fn find_idle(&self, required: &[String]) -> anyhow::Result<Vec<AgentInfo>> {
        Ok(self
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle && a.is_capable_of(required))
            .collect())
    }

    /// Atomically move an idle agent to busy on `task_id`. Returns false if it was not idle.
    async fn try_reserve(&self, id: &AgentId, task_id: TaskId) -> anyhow::Result<bool>;

    /// Return a busy agent to idle
    async fn release(&self, id: &AgentId) -> anyhow::Result<()>;
}

/// Historical success rates used to rank candidates and weight expertise
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// Share of successful assignments, `None` for agents without history
    async fn success_rate(&self, id: &AgentId) -> anyhow::Result<Option<f64>>;

    /// Record the outcome of one finished assignment
    async fn record_outcome(&self, id: &AgentId, success: bool) -> anyhow::Result<()>;
}

/// Process-local [`AgentDirectory`]
#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: RwLock<HashMap<AgentId, AgentInfo>>,
}

impl InMemoryAgentDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agent
    pub fn register(&self, agent: AgentInfo) {
        debug!(agent_id = %agent.id, agent_type = %agent.agent_type, "Registering agent");
        self.agents.write().insert(agent.id.clone(), agent);
    }

    /// Forget an agent
    pub fn remove(&self, id: &AgentId) -> Option<AgentInfo> {
        self.agents.write().remove(id)
    }

    /// Force an agent's status. Leaving `Busy` clears its task.
    pub fn set_status(&self, id: &AgentId, status: AgentStatus) {
        if let Some(agent) = self.agents.write().get_mut(id) {
            agent.status = status;
            if status != AgentStatus::Busy {
                agent.current_task = None;
            }
        }
    }

    /// Current status of a registered agent
    pub fn status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.agents.read().get(id).map(|a| a.status)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
        let mut agents: Vec<_> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentInfo>> {
        Ok(self.agents.read().get(id).cloned())
    }

    async fn try_reserve(&self, id: &AgentId, task_id: TaskId) -> anyhow::Result<bool> {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(agent) if agent.status == AgentStatus::Idle => {
                agent.status = AgentStatus::Busy;
                agent.current_task = Some(task_id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("unknown agent {id}"),
        }
    }

    async fn release(&self, id: &AgentId) -> anyhow::Result<()> {
        if let Some(agent) = self.agents.write().get_mut(id) {
            if agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
            agent.current_task = None;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct OutcomeCounts {
    succeeded: u64,
    total: u64,
}

/// Process-local [`PerformanceStore`]
#[derive(Default)]
pub struct InMemoryPerformanceStore {
    outcomes: RwLock<HashMap<AgentId, OutcomeCounts>>,
}

impl InMemoryPerformanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a known success rate out of `total` runs
    pub fn seed(&self, id: AgentId, succeeded: u64, total: u64) {
        self.outcomes.write().insert(
            id,
            OutcomeCounts {
                succeeded: succeeded.min(total),
                total,
            },
        );
    }
}

#[async_trait]
impl PerformanceStore for InMemoryPerformanceStore {
    async fn success_rate(&self, id: &AgentId) -> anyhow::Result<Option<f64>> {
        Ok(self
            .outcomes
            .read()
            .get(id)
            .filter(|c| c.total > 0)
            .map(|c| c.succeeded as f64 / c.total as f64))
    }

    async fn record_outcome(&self, id: &AgentId, success: bool) -> anyhow::Result<()> {
        let mut outcomes = self.outcomes.write();
        let counts = outcomes.entry(id.clone()).or_default();
        counts.total += 1;
        if success {
            counts.succeeded += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, caps: &[&str]) -> AgentInfo {
        AgentInfo::new(AgentId::new("swarm", name), "worker").with_capabilities(caps.iter().copied())
    }

    #[tokio::test]
    async fn test_find_idle_requires_superset() {
        let dir = InMemoryAgentDirectory::new();
        dir.register(worker("a", &["rust", "review"]));
        dir.register(worker("b", &["rust"]));

        let found = dir.find_idle(&["rust".into(), "review".into()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.id, "a");
    }

    #[tokio::test]
    async fn test_reserve_is_compare_and_set() {
        let dir = InMemoryAgentDirectory::new();
        let agent = worker("a", &[]);
        let id = agent.id.clone();
        dir.register(agent);

        let task = TaskId::new();
        assert!(dir.try_reserve(&id, task).await.unwrap());
        assert!(!dir.try_reserve(&id, TaskId::new()).await.unwrap());
        assert_eq!(dir.get_agent(&id).await.unwrap().unwrap().current_task, Some(task));

        dir.release(&id).await.unwrap();
        assert_eq!(dir.status(&id), Some(AgentStatus::Idle));
        assert!(dir.try_reserve(&AgentId::new("swarm", "ghost"), task).await.is_err());
    }

    #[tokio::test]
    async fn test_success_rate() {
        let store = InMemoryPerformanceStore::new();
        let id = AgentId::new("swarm", "a");
        assert_eq!(store.success_rate(&id).await.unwrap(), None);

        store.record_outcome(&id, true).await.unwrap();
        store.record_outcome(&id, false).await.unwrap();
        assert_eq!(store.success_rate(&id).await.unwrap(), Some(0.5));
    }
}
