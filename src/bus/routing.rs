//! Route computation

use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::types::AgentId;

/// Where a single delivery attempt goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// An agent's mailbox
    Agent(AgentId),
    /// A named queue
    Queue(String),
}

impl DeliveryTarget {
    /// Stable key used for retry bookkeeping
    pub fn key(&self) -> String {
        match self {
            DeliveryTarget::Agent(id) => format!("agent:{id}"),
            DeliveryTarget::Queue(name) => format!("queue:{name}"),
        }
    }

    /// The target agent, `None` for queue targets
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            DeliveryTarget::Agent(id) => Some(id),
            DeliveryTarget::Queue(_) => None,
        }
    }
}

/// One target per unique receiver. Receivers in the `queue` namespace address
/// the queue of that name instead of an agent.
pub fn compute_targets(message: &Message) -> Vec<DeliveryTarget> {
    message
        .unique_receivers()
        .into_iter()
        .map(|r| {
            if r.namespace == QUEUE_NAMESPACE {
                DeliveryTarget::Queue(r.id)
            } else {
                DeliveryTarget::Agent(r)
            }
        })
        .collect()
}

/// Namespace marking a receiver id as a queue name
pub const QUEUE_NAMESPACE: &str = "queue";

/// Receiver id addressing a queue
pub fn queue_address(name: impl Into<String>) -> AgentId {
    AgentId::new(QUEUE_NAMESPACE, name)
}
