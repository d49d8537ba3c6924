//! Bounded message queues

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::message::{DeadLetterReason, Message, MessageFilter};
use super::retry::RetryPolicy;
use crate::types::{AgentId, MessageId};

/// Dequeue discipline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    #[default]
    Fifo,
    Lifo,
    /// `critical > high > normal > low`, insertion order within a class
    Priority,
    /// Ordered by due time; messages are held until due
    Delay,
    /// FIFO order, consumers served in rotation
    RoundRobin,
}

/// Delivery guarantee of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Removed on dequeue, never redelivered
    AtMostOnce,
    /// Held in flight until acknowledged
    #[default]
    AtLeastOnce,
    /// At-least-once with duplicate suppression by message id
    ExactlyOnce,
}

/// How a queue consumer acknowledges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Delivery counts as acknowledgement
    #[default]
    Auto,
    /// Consumer acknowledges each message itself
    Manual,
}

/// A consumer registered on a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSubscriber {
    /// Consuming agent
    pub agent: AgentId,
    /// Only messages passing this filter are offered
    pub filter: Option<MessageFilter>,
    /// Acknowledgement mode
    pub ack_mode: AckMode,
    /// Maximum unacknowledged messages held by this subscriber
    pub prefetch: usize,
}

impl QueueSubscriber {
    /// Create an auto-acknowledging consumer
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            filter: None,
            ack_mode: AckMode::Auto,
            prefetch: 1,
        }
    }

    /// Set the message filter
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Switch to manual acknowledgement with `prefetch` outstanding messages
    pub fn manual_ack(mut self, prefetch: usize) -> Self {
        self.ack_mode = AckMode::Manual;
        self.prefetch = prefetch.max(1);
        self
    }

    fn wants(&self, message: &Message) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(message))
    }
}

/// Options for [`MessageBus::create_queue`](crate::bus::MessageBus::create_queue)
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Ordering discipline
    pub kind: QueueType,
    /// Falls back to the bus-wide `max_queue_size`
    pub max_size: Option<usize>,
    /// Delivery guarantee
    pub delivery_mode: DeliveryMode,
    /// Queue that receives messages this one gives up on
    pub dead_letter: Option<String>,
    /// Falls back to the bus retry policy
    pub retry_policy: Option<RetryPolicy>,
}

impl QueueOptions {
    /// Options for a queue of `kind` with defaults elsewhere
    pub fn new(kind: QueueType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Set the capacity
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    /// Set the delivery guarantee
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the dead-letter queue
    pub fn dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(queue.into());
        self
    }

    /// Override the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedMessage {
    pub message: Message,
    seq: u64,
    due_at: Instant,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct InFlight {
    entry: QueuedMessage,
    consumer: Option<AgentId>,
    since: Instant,
}

/// A bounded mailbox holding messages until they are dequeued
#[derive(Debug)]
pub struct MessageQueue {
    /// Queue name
    pub name: String,
    /// Ordering discipline
    pub kind: QueueType,
    /// Capacity, in-flight messages excluded
    pub max_size: usize,
    /// Delivery guarantee
    pub delivery_mode: DeliveryMode,
    /// Dead-letter queue name
    pub dead_letter: Option<String>,
    /// Limits redelivery of unacknowledged messages
    pub retry_policy: RetryPolicy,
    subscribers: Vec<QueueSubscriber>,
    messages: Vec<QueuedMessage>,
    in_flight: HashMap<MessageId, InFlight>,
    next_seq: u64,
    cursor: usize,
    /// Honor priority classes and due-time order; off means plain insertion order
    ordered: bool,
}

impl MessageQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, options: QueueOptions, default_max: usize, default_retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            kind: options.kind,
            max_size: options.max_size.unwrap_or(default_max).max(1),
            delivery_mode: options.delivery_mode,
            dead_letter: options.dead_letter,
            retry_policy: options.retry_policy.unwrap_or(default_retry),
            subscribers: Vec::new(),
            messages: Vec::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            cursor: 0,
            ordered: true,
        }
    }

    /// Serve priority and delay queues in insertion order. Delay queues still
    /// hold messages until they are due.
    pub fn with_ordering(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether another message would exceed `max_size`
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.max_size
    }

    /// Messages taken but not yet acknowledged
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Messages currently held, in no particular order
    pub fn peek_all(&self) -> Vec<&Message> {
        self.messages.iter().map(|q| &q.message).collect()
    }

    fn holds(&self, id: &MessageId) -> bool {
        self.in_flight.contains_key(id) || self.messages.iter().any(|q| &q.message.id == id)
    }

    /// Append a message. A full queue hands the message back.
    pub(crate) fn push(&mut self, message: Message, now: Instant) -> Result<(), Message> {
        if self.delivery_mode == DeliveryMode::ExactlyOnce && self.holds(&message.id) {
            return Ok(());
        }
        if self.is_full() {
            return Err(message);
        }
        let due_at = match (self.kind, message.metadata.delay) {
            (QueueType::Delay, Some(delay)) => now + delay,
            _ => now,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(QueuedMessage {
            message,
            seq,
            due_at,
            attempts: 0,
        });
        Ok(())
    }

    fn select(&self, now: Instant, accept: impl Fn(&Message) -> bool) -> Option<usize> {
        let candidates = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, q)| accept(&q.message));
        let selected = match (self.kind, self.ordered) {
            (QueueType::Fifo | QueueType::RoundRobin, _) | (QueueType::Priority, false) => {
                candidates.min_by_key(|(_, q)| q.seq)
            }
            (QueueType::Lifo, _) => candidates.max_by_key(|(_, q)| q.seq),
            (QueueType::Priority, true) => {
                candidates.max_by_key(|(_, q)| (q.message.priority, std::cmp::Reverse(q.seq)))
            }
            (QueueType::Delay, true) => candidates
                .filter(|(_, q)| q.due_at <= now)
                .min_by_key(|(_, q)| (q.due_at, q.seq)),
            (QueueType::Delay, false) => candidates.filter(|(_, q)| q.due_at <= now).min_by_key(|(_, q)| q.seq),
        };
        selected.map(|(i, _)| i)
    }

    /// Remove the next message per the queue discipline, tracking it as in flight
    /// unless the queue is at-most-once
    pub(crate) fn take(&mut self, now: Instant, consumer: Option<&AgentId>) -> Option<Message> {
        let index = self.select(now, |_| true)?;
        Some(self.take_at(index, now, consumer.cloned()))
    }

    fn take_at(&mut self, index: usize, now: Instant, consumer: Option<AgentId>) -> Message {
        let entry = self.messages.remove(index);
        let message = entry.message.clone();
        if self.delivery_mode != DeliveryMode::AtMostOnce {
            self.in_flight.insert(
                message.id,
                InFlight {
                    entry,
                    consumer,
                    since: now,
                },
            );
        }
        message
    }

    /// Acknowledge an in-flight message. Returns false if it was not in flight.
    pub fn ack(&mut self, id: &MessageId) -> bool {
        self.in_flight.remove(id).is_some()
    }

    /// Return unacknowledged in-flight messages older than `ack_timeout` to the
    /// queue. Those out of attempts, or that no longer fit, are handed back for
    /// dead-lettering.
    pub(crate) fn requeue_expired(&mut self, now: Instant, ack_timeout: Duration) -> Vec<(Message, u32, DeadLetterReason)> {
        let mut expired: Vec<(MessageId, u64)> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.since) >= ack_timeout)
            .map(|(id, f)| (*id, f.entry.seq))
            .collect();
        expired.sort_by_key(|(_, seq)| *seq);

        let mut rejected = Vec::new();
        for (id, _) in expired {
            let Some(flight) = self.in_flight.remove(&id) else {
                continue;
            };
            let mut entry = flight.entry;
            entry.attempts += 1;
            if self.retry_policy.is_exhausted(entry.attempts) {
                rejected.push((entry.message, entry.attempts, DeadLetterReason::RetryExhausted));
            } else if self.is_full() {
                rejected.push((entry.message, entry.attempts, DeadLetterReason::QueueFull));
            } else {
                entry.due_at = now;
                self.messages.push(entry);
            }
        }
        rejected
    }

    /// Register a consumer, replacing any earlier registration of the same agent
    pub fn add_subscriber(&mut self, subscriber: QueueSubscriber) {
        self.subscribers.retain(|s| s.agent != subscriber.agent);
        self.subscribers.push(subscriber);
    }

    /// Remove a consumer
    pub fn remove_subscriber(&mut self, agent: &AgentId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| &s.agent != agent);
        before != self.subscribers.len()
    }

    pub fn subscribers(&self) -> &[QueueSubscriber] {
        &self.subscribers
    }

    fn outstanding(&self, agent: &AgentId) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.consumer.as_ref() == Some(agent))
            .count()
    }

    /// Pick the next message and a subscriber with spare prefetch that wants it.
    /// Round-robin queues rotate the starting subscriber on every hand-off.
    pub(crate) fn next_dispatch(&mut self, now: Instant) -> Option<(Message, QueueSubscriber)> {
        let count = self.subscribers.len();
        if count == 0 {
            return None;
        }
        let start = if self.kind == QueueType::RoundRobin { self.cursor % count } else { 0 };
        for offset in 0..count {
            let sub_index = (start + offset) % count;
            let subscriber = self.subscribers[sub_index].clone();
            let manual = subscriber.ack_mode == AckMode::Manual;
            if manual && self.outstanding(&subscriber.agent) >= subscriber.prefetch {
                continue;
            }
            if let Some(index) = self.select(now, |m| subscriber.wants(m)) {
                if self.kind == QueueType::RoundRobin {
                    self.cursor = sub_index + 1;
                }
                let message = if manual {
                    self.take_at(index, now, Some(subscriber.agent.clone()))
                } else {
                    self.messages.remove(index).message
                };
                return Some((message, subscriber));
            }
        }
        None
    }

    /// Put back a message whose hand-off failed, keeping its original position
    pub(crate) fn restore(&mut self, message: Message) {
        if let Some(flight) = self.in_flight.remove(&message.id) {
            self.messages.push(flight.entry);
            return;
        }
        let seq = self.messages.iter().map(|q| q.seq).min().unwrap_or(self.next_seq).saturating_sub(1);
        self.messages.push(QueuedMessage {
            message,
            seq,
            due_at: Instant::now(),
            attempts: 0,
        });
    }
}
