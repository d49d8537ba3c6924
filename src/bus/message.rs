//! Message envelope, content and send options

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, MessageId, Priority};

/// Delivery guarantee requested by the publisher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reliability {
    /// Failures are logged and dropped
    BestEffort,
    /// Retried until acknowledged or out of attempts
    #[default]
    AtLeastOnce,
    /// Like at-least-once, but never redelivered to a receiver that acknowledged
    ExactlyOnce,
}

impl Reliability {
    /// Whether failures enter the retry queue
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Reliability::BestEffort)
    }
}

/// Message payload with a declared content type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl MessageContent {
    /// Plain-text content
    pub fn text(s: impl Into<String>) -> Self {
        MessageContent::Text(s.into())
    }

    /// MIME type declared for this variant
    pub fn content_type(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "text/plain",
            MessageContent::Json(_) => "application/json",
            MessageContent::Binary(_) => "application/octet-stream",
        }
    }

    /// Size of the content as serialized on the wire
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// The JSON value, if this is JSON content
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            MessageContent::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for MessageContent {
    fn from(value: serde_json::Value) -> Self {
        MessageContent::Json(value)
    }
}

/// Why a message ended up in a dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The target queue was at capacity
    QueueFull,
    /// Every delivery attempt failed
    RetryExhausted,
}

impl DeadLetterReason {
    /// Wire name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::QueueFull => "queue_full",
            DeadLetterReason::RetryExhausted => "retry_exhausted",
        }
    }
}

/// Annotation added when a message is dead-lettered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    /// Why delivery was given up
    pub reason: DeadLetterReason,
    /// Queue or delivery target the message was headed for
    pub source: String,
    /// Delivery attempts made
    pub attempts: u32,
    /// When it was dead-lettered
    pub at: DateTime<Utc>,
}

/// Routing and bookkeeping attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Serialized content size in bytes
    pub size: usize,
    /// MIME-like type of the content
    pub content_type: String,
    /// Hops the message has crossed, in order
    pub route: Vec<String>,
    /// Topic it was published on
    pub topic: Option<String>,
    /// Channel it was broadcast on
    pub channel: Option<String>,
    /// Hold time in delay queues
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,
    /// Message this one answers
    pub correlation_id: Option<MessageId>,
    /// Set once the message lands in a dead-letter queue
    pub dead_letter: Option<DeadLetterInfo>,
}

/// A message crossing the bus. Immutable after creation apart from routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier
    pub id: MessageId,
    /// Application-defined message type (`task.assignment`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating agent
    pub sender: AgentId,
    /// Agents or queue addresses
    pub receivers: Vec<AgentId>,
    /// Payload
    pub content: MessageContent,
    /// Routing and bookkeeping
    pub metadata: MessageMetadata,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Undeliverable after this time
    pub expires_at: Option<DateTime<Utc>>,
    /// Priority class
    pub priority: Priority,
    /// Delivery guarantee
    pub reliability: Reliability,
}

impl Message {
    /// Create a message with a fresh id at normal priority
    pub fn new(
        kind: impl Into<String>,
        content: MessageContent,
        sender: AgentId,
        receivers: Vec<AgentId>,
    ) -> Self {
        let metadata = MessageMetadata {
            size: content.serialized_size(),
            content_type: content.content_type().to_string(),
            ..Default::default()
        };
        Self {
            id: MessageId::new(),
            kind: kind.into(),
            sender,
            receivers,
            content,
            metadata,
            timestamp: Utc::now(),
            expires_at: None,
            priority: Priority::Normal,
            reliability: Reliability::default(),
        }
    }

    /// Whether the message expired at or before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Append a hop to the route trail
    pub(crate) fn record_hop(&mut self, hop: impl Into<String>) {
        self.metadata.route.push(hop.into());
    }

    /// Unique receivers in first-seen order
    pub fn unique_receivers(&self) -> Vec<AgentId> {
        let mut seen = HashSet::new();
        self.receivers
            .iter()
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect()
    }

    /// Field of a JSON payload
    pub fn json_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.content.as_json().and_then(|v| v.get(name))
    }
}

/// Per-send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Priority class
    pub priority: Priority,
    /// Delivery guarantee
    pub reliability: Reliability,
    /// Relative time-to-live, converted to `expires_at`
    pub ttl: Option<Duration>,
    /// Absolute expiry. With `ttl` also set, the earlier of the two applies.
    pub expires_at: Option<DateTime<Utc>>,
    /// Message this one answers
    pub correlation_id: Option<MessageId>,
    /// Hold time when enqueued on a delay queue
    pub delay: Option<Duration>,
}

impl SendOptions {
    /// Best-effort options at normal priority
    pub fn best_effort() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            ..Default::default()
        }
    }

    /// Options with the given delivery guarantee
    pub fn reliable(reliability: Reliability) -> Self {
        Self {
            reliability,
            ..Default::default()
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a relative time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for [`MessageBus::broadcast_message`](crate::bus::MessageBus::broadcast_message)
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// Channel to broadcast on
    pub channel: String,
    /// Options applied to each delivery
    pub send: SendOptions,
    /// Only participants in this namespace receive the broadcast
    pub namespace: Option<String>,
    /// Participants skipped for this broadcast
    pub exclude: Vec<AgentId>,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            channel: super::SYSTEM_BROADCAST.to_string(),
            send: SendOptions::default(),
            namespace: None,
            exclude: Vec::new(),
        }
    }
}

impl BroadcastOptions {
    /// Broadcast on `channel` with default send options
    pub fn on(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Set the send options
    pub fn with_send(mut self, send: SendOptions) -> Self {
        self.send = send;
        self
    }
}

/// Predicate over a message's declared fields. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Accepted message kinds
    pub kinds: Option<Vec<String>>,
    /// Lowest accepted priority
    pub min_priority: Option<Priority>,
    /// Accepted senders
    pub senders: Option<Vec<AgentId>>,
    /// Accepted content type
    pub content_type: Option<String>,
}

impl MessageFilter {
    /// Filter accepting only the given kinds
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: Some(kinds.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Filter accepting `priority` and above
    pub fn min_priority(priority: Priority) -> Self {
        Self {
            min_priority: Some(priority),
            ..Default::default()
        }
    }

    /// Whether every set field accepts `message`
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.iter().any(|k| k == &message.kind) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if message.priority < min {
                return false;
            }
        }
        if let Some(senders) = &self.senders {
            if !senders.contains(&message.sender) {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            if content_type != &message.metadata.content_type {
                return false;
            }
        }
        true
    }
}
