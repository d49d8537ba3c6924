//! Topic subscriptions
//!
//! Topics are `.`-separated strings. A subscription matches a topic exactly
//! unless it contains wildcards: `+` matches exactly one segment and a trailing
//! `#` matches any number of remaining segments (including none), so
//! `tasks.+.done` matches `tasks.build.done` and `tasks.#` matches `tasks` and
//! `tasks.build.done`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageFilter, Reliability};
use crate::error::{CoreError, CoreResult};
use crate::types::{AgentId, SubscriptionId};

/// Delivery strength of a topic subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0
    #[default]
    AtMostOnce,
    /// QoS 1
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

impl Qos {
    /// Message reliability this level maps to
    pub fn reliability(&self) -> Reliability {
        match self {
            Qos::AtMostOnce => Reliability::BestEffort,
            Qos::AtLeastOnce => Reliability::AtLeastOnce,
            Qos::ExactlyOnce => Reliability::ExactlyOnce,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = CoreError;

    fn try_from(level: u8) -> CoreResult<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(CoreError::Validation(format!("invalid QoS level {other}"))),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        qos as u8
    }
}

/// Options for [`MessageBus::subscribe_to_topic`](crate::bus::MessageBus::subscribe_to_topic)
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Only matching messages are delivered
    pub filter: Option<MessageFilter>,
    /// Delivery strength
    pub qos: Qos,
}

impl SubscribeOptions {
    /// Options with the given QoS and no filter
    pub fn qos(qos: Qos) -> Self {
        Self { filter: None, qos }
    }
}

/// A registered topic subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSubscription {
    /// Subscription id
    pub id: SubscriptionId,
    /// Exact topic or pattern
    pub topic: String,
    /// Receiving agent
    pub subscriber: AgentId,
    /// Message filter
    pub filter: Option<MessageFilter>,
    /// Delivery strength
    pub qos: Qos,
    /// When the subscription was made
    pub created_at: DateTime<Utc>,
}

impl TopicSubscription {
    /// Whether the subscription uses wildcards
    pub fn is_pattern(&self) -> bool {
        is_pattern(&self.topic)
    }

    /// Whether the filter admits `message`
    pub fn wants(&self, message: &Message) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(message))
    }
}

/// `+` matches one segment, `#` the rest of the topic
pub fn is_pattern(topic: &str) -> bool {
    topic.split('.').any(|s| s == "+" || s == "#")
}

/// Whether `subscription` (possibly a pattern) matches the concrete `topic`
pub fn topic_matches(subscription: &str, topic: &str) -> bool {
    if !is_pattern(subscription) {
        return subscription == topic;
    }
    let mut wanted = subscription.split('.');
    let mut actual = topic.split('.');
    loop {
        match (wanted.next(), actual.next()) {
            (Some("#"), _) => return wanted.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(w), Some(a)) if w == a => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Subscription bookkeeping; matching happens at publish time
#[derive(Debug, Default)]
pub struct TopicRegistry {
    subscriptions: HashMap<SubscriptionId, TopicSubscription>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Topics are non-empty dot-separated segments.
    pub fn subscribe(&mut self, topic: impl Into<String>, subscriber: AgentId, options: SubscribeOptions) -> CoreResult<SubscriptionId> {
        let topic = topic.into();
        if topic.is_empty() || topic.split('.').any(str::is_empty) {
            return Err(CoreError::Validation(format!("invalid topic '{topic}'")));
        }
        let id = SubscriptionId::new();
        self.subscriptions.insert(
            id,
            TopicSubscription {
                id,
                topic,
                subscriber,
                filter: options.filter,
                qos: options.qos,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    /// Remove a subscription, returning it
    pub fn unsubscribe(&mut self, id: &SubscriptionId) -> Option<TopicSubscription> {
        self.subscriptions.remove(id)
    }

    /// Subscriptions matching `topic`, oldest first
    pub fn matching(&self, topic: &str) -> Vec<TopicSubscription> {
        let mut matched: Vec<_> = self
            .subscriptions
            .values()
            .filter(|s| topic_matches(&s.topic, topic))
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.created_at);
        matched
    }

    /// Every subscription held by `agent`
    pub fn subscriptions_of(&self, agent: &AgentId) -> Vec<TopicSubscription> {
        self.subscriptions
            .values()
            .filter(|s| &s.subscriber == agent)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
