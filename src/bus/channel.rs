//! Named communication channels

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageFilter};
use crate::error::{CoreError, CoreResult};
use crate::types::AgentId;

/// Scope of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Exactly two parties
    Direct,
    /// Every participant but the sender
    Broadcast,
    /// Participants selected by the access policy
    Multicast,
    /// Backs a topic namespace
    Topic,
    /// Backs a queue
    Queue,
}

/// Transforms every message that crosses a channel
pub trait MessageMiddleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Rewrite the message, or reject it with an error
    fn process(&self, message: Message) -> CoreResult<Message>;
}

/// Who may send through and receive from a channel.
/// Empty allow-lists allow everyone not banned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Senders allowed to broadcast, everyone when empty
    pub allowed_senders: HashSet<AgentId>,
    /// Senders that may never broadcast
    pub banned_senders: HashSet<AgentId>,
    /// Agents allowed to join and receive, everyone when empty
    pub allowed_receivers: HashSet<AgentId>,
    /// Agents that may never join or receive
    pub banned_receivers: HashSet<AgentId>,
    /// Agents allowed to delete the channel
    pub admins: HashSet<AgentId>,
    /// Participant cap; direct channels never exceed two
    pub max_participants: Option<usize>,
}

impl AccessPolicy {
    /// Whether `agent` may broadcast here
    pub fn may_send(&self, agent: &AgentId) -> bool {
        !self.banned_senders.contains(agent)
            && (self.allowed_senders.is_empty() || self.allowed_senders.contains(agent))
    }

    /// Whether `agent` may join and receive here
    pub fn may_receive(&self, agent: &AgentId) -> bool {
        !self.banned_receivers.contains(agent)
            && (self.allowed_receivers.is_empty() || self.allowed_receivers.contains(agent))
    }

    /// Whether `agent` administers the channel
    pub fn is_admin(&self, agent: &AgentId) -> bool {
        self.admins.contains(agent)
    }
}

/// Per-channel counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Broadcasts that went out
    pub messages_sent: u64,
    /// Broadcasts dropped by a channel filter
    pub messages_filtered: u64,
    /// Successful joins
    pub joins: u64,
    /// Successful leaves
    pub leaves: u64,
    /// Last join, leave or broadcast
    pub last_activity: Option<DateTime<Utc>>,
}

/// A named communication scope
pub struct Channel {
    /// Unique channel name
    pub name: String,
    /// Channel type
    pub kind: ChannelType,
    /// Participants in join order
    participants: Vec<AgentId>,
    /// Access rules
    pub policy: AccessPolicy,
    /// Counters
    pub stats: ChannelStats,
    /// Every filter must accept a broadcast
    filters: Vec<MessageFilter>,
    /// Applied in registration order
    middleware: Vec<Arc<dyn MessageMiddleware>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("participants", &self.participants.len())
            .field("filters", &self.filters.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl Channel {
    /// Create an empty channel
    pub fn new(name: impl Into<String>, options: ChannelOptions) -> Self {
        let mut policy = options.policy;
        if options.kind == ChannelType::Direct {
            policy.max_participants = Some(policy.max_participants.map_or(2, |m| m.min(2)));
        }
        Self {
            name: name.into(),
            kind: options.kind,
            participants: Vec::new(),
            policy,
            stats: ChannelStats::default(),
            filters: options.filters,
            middleware: options.middleware,
            created_at: Utc::now(),
        }
    }

    /// Current participants in join order
    pub fn participants(&self) -> &[AgentId] {
        &self.participants
    }

    pub fn is_participant(&self, agent: &AgentId) -> bool {
        self.participants.contains(agent)
    }

    /// Add a participant. Returns false if it was already present.
    pub fn join(&mut self, agent: AgentId) -> CoreResult<bool> {
        if self.is_participant(&agent) {
            return Ok(false);
        }
        if !self.policy.may_receive(&agent) {
            return Err(CoreError::AccessDenied(format!(
                "{agent} may not join channel {}",
                self.name
            )));
        }
        if let Some(max) = self.policy.max_participants {
            if self.participants.len() >= max {
                return Err(CoreError::Capacity(format!(
                    "channel {} is at capacity ({max})",
                    self.name
                )));
            }
        }
        self.participants.push(agent);
        self.stats.joins += 1;
        self.stats.last_activity = Some(Utc::now());
        Ok(true)
    }

    /// Remove a participant. Returns false if it was not present.
    pub fn leave(&mut self, agent: &AgentId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != agent);
        let left = self.participants.len() != before;
        if left {
            self.stats.leaves += 1;
            self.stats.last_activity = Some(Utc::now());
        }
        left
    }

    /// Participants a broadcast from `sender` reaches
    pub fn receivers_for(&self, sender: &AgentId) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|p| *p != sender && self.policy.may_receive(p))
            .cloned()
            .collect()
    }

    /// Whether every channel filter accepts `message`
    pub fn accepts(&self, message: &Message) -> bool {
        self.filters.iter().all(|f| f.matches(message))
    }

    /// Add a filter every broadcast must pass
    pub fn add_filter(&mut self, filter: MessageFilter) {
        self.filters.push(filter);
    }

    /// Append middleware to the chain
    pub fn add_middleware(&mut self, middleware: Arc<dyn MessageMiddleware>) {
        self.middleware.push(middleware);
    }

    /// Registered middleware, in order
    pub fn middleware(&self) -> Vec<Arc<dyn MessageMiddleware>> {
        self.middleware.clone()
    }
}

/// Builder-style options for creating a channel
#[derive(Clone)]
pub struct ChannelOptions {
    kind: ChannelType,
    policy: AccessPolicy,
    filters: Vec<MessageFilter>,
    middleware: Vec<Arc<dyn MessageMiddleware>>,
}

impl ChannelOptions {
    /// Options for a channel of `kind` with an open policy
    pub fn new(kind: ChannelType) -> Self {
        Self {
            kind,
            policy: AccessPolicy::default(),
            filters: Vec::new(),
            middleware: Vec::new(),
        }
    }

    /// Grant `agent` admin rights
    pub fn admin(mut self, agent: AgentId) -> Self {
        self.policy.admins.insert(agent);
        self
    }

    /// Cap the number of participants
    pub fn max_participants(mut self, max: usize) -> Self {
        self.policy.max_participants = Some(max);
        self
    }

    /// Replace the access policy
    pub fn policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a filter every broadcast must pass
    pub fn filter(mut self, filter: MessageFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append middleware to the chain
    pub fn middleware(mut self, middleware: Arc<dyn MessageMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new(ChannelType::Broadcast)
    }
}
