//! # Message bus
//!
//! The communication fabric shared by agents, the consensus engine and the
//! task orchestrator. It owns channels, queues, topic subscriptions, agent
//! mailboxes, acknowledgement tracking and the retry queue; other subsystems
//! reach them only through [`MessageBus`] methods.
//!
//! Each delivery target is attempted independently. Reliable messages that
//! fail are retried with exponential backoff by a periodic sweep and moved to
//! the dead-letter queue once their attempts run out.

pub mod channel;
pub mod message;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod topic;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BusConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::scheduler::{Scheduler, TickFuture};
use crate::types::{AgentId, MessageId, SubscriptionId};

pub use channel::{AccessPolicy, Channel, ChannelOptions, ChannelStats, ChannelType, MessageMiddleware};
pub use message::{
    BroadcastOptions, DeadLetterInfo, DeadLetterReason, Message, MessageContent, MessageFilter,
    MessageMetadata, Reliability, SendOptions,
};
pub use queue::{AckMode, DeliveryMode, MessageQueue, QueueOptions, QueueSubscriber, QueueType};
pub use retry::{RetryEntry, RetryPolicy, RetryQueue};
pub use routing::{queue_address, DeliveryTarget};
pub use topic::{Qos, SubscribeOptions, TopicSubscription};

/// Default broadcast channel every agent may join
pub const SYSTEM_BROADCAST: &str = "system-broadcast";
/// Default multicast channel for coordination traffic
pub const SYSTEM_COORDINATION: &str = "system-coordination";

/// A message handed to an agent's mailbox
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The message
    pub message: Message,
    /// 1 for the first attempt
    pub attempt: u32,
    /// Queue the message was dispatched from, if any
    pub queue: Option<String>,
}

/// Receiving end of an agent's inbox
pub struct Mailbox {
    agent: AgentId,
    rx: mpsc::Receiver<Delivery>,
}

impl Mailbox {
    /// Agent this inbox belongs to
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Wait for the next delivery
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next delivery if one is buffered
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Outcome of [`MessageBus::enqueue_message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The queue was full and the message went to this dead-letter queue
    DeadLettered(String),
}

/// Counters for the bus as a whole
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Messages accepted for routing
    pub sent: u64,
    /// Successful deliveries to a single target
    pub delivered: u64,
    /// Failed delivery attempts
    pub failed_deliveries: u64,
    /// Retries taken from the retry queue
    pub retried: u64,
    /// Messages moved to a dead-letter queue
    pub dead_lettered: u64,
    /// Messages acknowledged by every receiver
    pub fully_acknowledged: u64,
}

#[derive(Default)]
struct StatCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    fully_acknowledged: AtomicU64,
}

/// What one retry sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Retries taken from the retry queue
    pub retried: usize,
    /// Retries that got through
    pub delivered: usize,
    /// Messages given up on
    pub dead_lettered: usize,
    /// Unacknowledged deliveries queued for another try
    pub redelivery_scheduled: usize,
    /// Unacknowledged queue messages put back
    pub requeued_from_queues: usize,
    /// Expired or retained messages dropped
    pub purged: usize,
}

/// A sent message retained until every receiver acknowledged or retention ran out
struct PendingAck {
    message: Message,
    expected: HashSet<AgentId>,
    acked: HashSet<AgentId>,
    stored_at: Instant,
    last_sent: Instant,
    redeliveries: u32,
}

/// The message bus
pub struct MessageBus {
    /// Sender identity for bus-originated traffic
    identity: AgentId,
    config: BusConfig,
    retry_policy: RetryPolicy,
    events: EventBus,
    /// Channels by name
    channels: RwLock<HashMap<String, Channel>>,
    /// Queues by name, each behind its own lock
    queues: RwLock<HashMap<String, Arc<Mutex<MessageQueue>>>>,
    topics: RwLock<topic::TopicRegistry>,
    /// Connected agent inboxes
    mailboxes: RwLock<HashMap<AgentId, mpsc::Sender<Delivery>>>,
    /// Sent messages awaiting acknowledgement
    pending: Mutex<HashMap<MessageId, PendingAck>>,
    /// Fully acknowledged messages kept for `message_retention` when persistence is on
    archive: Mutex<HashMap<MessageId, (Message, Instant)>>,
    /// Failed deliveries waiting for their next attempt
    retries: Mutex<RetryQueue>,
    stats: StatCounters,
    scheduler: Scheduler,
}

impl MessageBus {
    /// Create a bus with the default system channels and dead-letter queue
    pub fn new(config: BusConfig, events: EventBus) -> Arc<Self> {
        let identity = AgentId::system("message-bus");
        let bus = Arc::new(Self {
            retry_policy: RetryPolicy::from_config(&config),
            scheduler: Scheduler::new("message-bus", events.clone()),
            identity,
            config,
            events,
            channels: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(topic::TopicRegistry::new()),
            mailboxes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            archive: Mutex::new(HashMap::new()),
            retries: Mutex::new(RetryQueue::new()),
            stats: StatCounters::default(),
        });
        bus.create_system_resources();
        bus
    }

    fn create_system_resources(&self) {
        for (name, kind) in [
            (SYSTEM_BROADCAST, ChannelType::Broadcast),
            (SYSTEM_COORDINATION, ChannelType::Multicast),
        ] {
            let options = ChannelOptions::new(kind).admin(self.identity.clone());
            if let Err(e) = self.create_channel(name, options) {
                warn!(channel = name, error = %e, "Failed to create system channel");
            }
        }
        let dlq = self.config.dead_letter_queue.clone();
        if let Err(e) = self.create_queue(&dlq, QueueOptions::new(QueueType::Fifo).delivery_mode(DeliveryMode::AtMostOnce)) {
            warn!(queue = %dlq, error = %e, "Failed to create dead-letter queue");
        }
    }

    /// Configuration the bus was built with
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Sender identity for bus-originated traffic
    pub fn identity(&self) -> &AgentId {
        &self.identity
    }

    /// Outbound event stream
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the retry sweep
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.spawn_loop("retry-sweep", self.config.retry_sweep_interval, move || -> TickFuture {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(bus) = weak.upgrade() {
                    bus.run_retry_sweep();
                }
                Ok(())
            })
        });
        info!("Message bus started");
    }

    /// Stop the retry sweep
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // === Mailboxes ===

    /// Register an inbox for `agent`, replacing any previous one
    pub fn connect(&self, agent: AgentId) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        self.mailboxes.write().insert(agent.clone(), tx);
        debug!(agent_id = %agent, "Agent connected to bus");
        Mailbox { agent, rx }
    }

    /// Drop an agent's inbox. Later direct deliveries to it fail.
    pub fn disconnect(&self, agent: &AgentId) -> bool {
        self.mailboxes.write().remove(agent).is_some()
    }

    /// Whether `agent` has an inbox
    pub fn is_connected(&self, agent: &AgentId) -> bool {
        self.mailboxes.read().contains_key(agent)
    }

    // === Sending ===

    fn prepare(
        &self,
        kind: &str,
        content: MessageContent,
        sender: AgentId,
        receivers: Vec<AgentId>,
        opts: &SendOptions,
    ) -> CoreResult<Message> {
        if receivers.is_empty() {
            return Err(CoreError::Validation("message has no receivers".into()));
        }
        let size = content.serialized_size();
        if size > self.config.max_message_size {
            return Err(CoreError::Validation(format!(
                "message size {size} exceeds maximum {}",
                self.config.max_message_size
            )));
        }
        let now = Utc::now();
        let mut expires_at = opts.expires_at;
        if let Some(ttl) = opts.ttl {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| CoreError::Validation(format!("invalid ttl: {e}")))?;
            let by_ttl = now + ttl;
            expires_at = Some(expires_at.map_or(by_ttl, |at| at.min(by_ttl)));
        }
        if expires_at.is_some_and(|at| at <= now) {
            return Err(CoreError::Validation("message already expired".into()));
        }

        let mut message = Message::new(kind, content, sender, receivers);
        message.expires_at = expires_at;
        message.priority = opts.priority;
        message.reliability = opts.reliability;
        message.metadata.correlation_id = opts.correlation_id;
        message.metadata.delay = opts.delay;
        Ok(message)
    }

    /// Send a message to explicit receivers
    #[instrument(skip_all, fields(kind = %kind, sender = %sender))]
    pub fn send_message(
        &self,
        kind: &str,
        content: MessageContent,
        sender: AgentId,
        receivers: Vec<AgentId>,
        opts: SendOptions,
    ) -> CoreResult<MessageId> {
        let message = self.prepare(kind, content, sender, receivers, &opts)?;
        Ok(self.dispatch(message))
    }

    /// Deliver to every participant of a channel except the sender
    #[instrument(skip_all, fields(kind = %kind, sender = %sender, channel = %opts.channel))]
    pub fn broadcast_message(
        &self,
        kind: &str,
        content: MessageContent,
        sender: AgentId,
        opts: BroadcastOptions,
    ) -> CoreResult<MessageId> {
        let (receivers, middleware) = {
            let channels = self.channels.read();
            let channel = channels
                .get(&opts.channel)
                .ok_or_else(|| CoreError::NotFound(format!("channel {}", opts.channel)))?;
            if !channel.policy.may_send(&sender) {
                return Err(CoreError::AccessDenied(format!(
                    "{sender} may not send on channel {}",
                    opts.channel
                )));
            }
            let receivers: Vec<AgentId> = channel
                .receivers_for(&sender)
                .into_iter()
                .filter(|r| opts.namespace.as_ref().map_or(true, |ns| &r.namespace == ns))
                .filter(|r| !opts.exclude.contains(r))
                .collect();
            (receivers, channel.middleware())
        };

        let mut message = self.prepare(kind, content, sender, receivers, &opts.send)?;
        message.metadata.channel = Some(opts.channel.clone());

        {
            let mut channels = self.channels.write();
            if let Some(channel) = channels.get_mut(&opts.channel) {
                if self.config.enable_filtering && !channel.accepts(&message) {
                    channel.stats.messages_filtered += 1;
                    return Err(CoreError::Validation(format!(
                        "message rejected by filters of channel {}",
                        opts.channel
                    )));
                }
                channel.stats.messages_sent += 1;
                channel.stats.last_activity = Some(Utc::now());
            }
        }

        for mw in middleware {
            message = mw.process(message)?;
        }
        message.record_hop(format!("channel:{}", opts.channel));
        Ok(self.dispatch(message))
    }

    /// Deliver to every subscription matching `topic`. Each subscriber's QoS
    /// picks the reliability of its copy.
    #[instrument(skip_all, fields(topic = %topic, sender = %sender))]
    pub fn publish_to_topic(
        &self,
        topic: &str,
        kind: &str,
        content: MessageContent,
        sender: AgentId,
        opts: SendOptions,
    ) -> CoreResult<Vec<MessageId>> {
        let subscriptions = self.topics.read().matching(topic);
        let mut by_qos: Vec<(Qos, Vec<AgentId>)> = Vec::new();
        let sample = self.prepare(kind, content.clone(), sender.clone(), vec![sender.clone()], &opts)?;

        for sub in subscriptions {
            if sub.subscriber == sender || (self.config.enable_filtering && !sub.wants(&sample)) {
                continue;
            }
            match by_qos.iter_mut().find(|(q, _)| *q == sub.qos) {
                Some((_, receivers)) => {
                    if !receivers.contains(&sub.subscriber) {
                        receivers.push(sub.subscriber);
                    }
                }
                None => by_qos.push((sub.qos, vec![sub.subscriber])),
            }
        }

        let mut ids = Vec::new();
        for (qos, receivers) in by_qos {
            let opts = SendOptions {
                reliability: qos.reliability(),
                ..opts.clone()
            };
            let mut message = self.prepare(kind, content.clone(), sender.clone(), receivers, &opts)?;
            message.metadata.topic = Some(topic.to_string());
            message.record_hop(format!("topic:{topic}"));
            ids.push(self.dispatch(message));
        }
        if ids.is_empty() {
            debug!(topic, "No subscribers for topic");
        }
        Ok(ids)
    }

    /// Route and deliver a validated message
    fn dispatch(&self, mut message: Message) -> MessageId {
        message.record_hop("bus");
        let id = message.id;
        let targets = routing::compute_targets(&message);
        let now = Instant::now();

        let expected: HashSet<AgentId> = targets.iter().filter_map(|t| t.agent().cloned()).collect();
        if !expected.is_empty() {
            self.pending.lock().insert(
                id,
                PendingAck {
                    message: message.clone(),
                    expected,
                    acked: HashSet::new(),
                    stored_at: now,
                    last_sent: now,
                    redeliveries: 0,
                },
            );
        }

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.events.publish(CoreEvent::MessageSent {
            message_id: id,
            kind: message.kind.clone(),
            receivers: targets.len(),
        });

        for target in targets {
            match self.deliver(&target, &message, 1) {
                Ok(()) => self.record_delivery(&message, &target),
                Err(e) => self.handle_failure(message.clone(), target, 1, e),
            }
        }
        id
    }

    fn deliver(&self, target: &DeliveryTarget, message: &Message, attempt: u32) -> CoreResult<()> {
        match target {
            DeliveryTarget::Agent(agent) => {
                if message.reliability == Reliability::ExactlyOnce && self.already_acked(&message.id, agent) {
                    return Ok(());
                }
                self.push_to_mailbox(agent, message.clone(), attempt, None)
            }
            DeliveryTarget::Queue(name) => self.enqueue_message(name, message.clone()).map(|_| ()),
        }
    }

    fn push_to_mailbox(&self, agent: &AgentId, message: Message, attempt: u32, queue: Option<String>) -> CoreResult<()> {
        let sender = self
            .mailboxes
            .read()
            .get(agent)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no mailbox for {agent}")))?;
        match sender.try_send(Delivery { message, attempt, queue }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(CoreError::Capacity(format!("mailbox of {agent} is full")))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mailboxes.write().remove(agent);
                Err(CoreError::NotFound(format!("mailbox of {agent} is closed")))
            }
        }
    }

    fn already_acked(&self, id: &MessageId, agent: &AgentId) -> bool {
        self.pending
            .lock()
            .get(id)
            .is_some_and(|p| p.acked.contains(agent))
    }

    fn record_delivery(&self, message: &Message, target: &DeliveryTarget) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        if let DeliveryTarget::Agent(receiver) = target {
            debug!(message_id = %message.id, receiver = %receiver, "Message delivered");
            self.events.publish(CoreEvent::MessageDelivered {
                message_id: message.id,
                receiver: receiver.clone(),
            });
        }
    }

    fn handle_failure(&self, message: Message, target: DeliveryTarget, attempts: u32, err: CoreError) {
        self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
        if !message.reliability.is_reliable() || !self.config.enable_reliability {
            debug!(message_id = %message.id, target = %target.key(), error = %err, "Dropping best-effort delivery");
            return;
        }
        if !err.is_retryable() || self.retry_policy.is_exhausted(attempts) {
            warn!(message_id = %message.id, target = %target.key(), attempts, error = %err, "Delivery attempts exhausted");
            let source = target.key();
            self.dead_letter(message, DeadLetterReason::RetryExhausted, &source, attempts, None);
            return;
        }
        let delay = self.retry_policy.delay_for(attempts);
        warn!(message_id = %message.id, target = %target.key(), attempts, ?delay, error = %err, "Delivery failed, scheduling retry");
        self.retries.lock().schedule(RetryEntry {
            message,
            target,
            attempts,
            next_attempt: Instant::now() + delay,
            last_error: err.to_string(),
        });
    }

    /// Move a message to a dead-letter queue. Never recurses into another dead-letter.
    fn dead_letter(&self, mut message: Message, reason: DeadLetterReason, source: &str, attempts: u32, queue: Option<&str>) -> bool {
        let dlq = queue.unwrap_or(&self.config.dead_letter_queue).to_string();
        let id = message.id;
        if reason == DeadLetterReason::RetryExhausted {
            self.retries.lock().cancel_message(&id);
            self.pending.lock().remove(&id);
        }

        message.metadata.dead_letter = Some(DeadLetterInfo {
            reason,
            source: source.to_string(),
            attempts,
            at: Utc::now(),
        });
        message.record_hop(format!("dlq:{dlq}"));

        let queue = self.queues.read().get(&dlq).cloned();
        let stored = match queue {
            Some(q) => q.lock().push(message, Instant::now()).is_ok(),
            None => false,
        };
        if !stored {
            error!(message_id = %id, queue = %dlq, "Dead-letter queue missing or full, message lost");
            return false;
        }
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        info!(message_id = %id, queue = %dlq, reason = reason.as_str(), "Message dead-lettered");
        self.events.publish(CoreEvent::MessageDeadLettered {
            message_id: id,
            reason: reason.as_str().to_string(),
        });
        true
    }

    // === Acknowledgements ===

    /// Record that `agent` processed `message_id`. Returns true once every
    /// receiver has acknowledged.
    pub fn acknowledge_message(&self, message_id: MessageId, agent: &AgentId) -> CoreResult<bool> {
        let fully = {
            let mut pending = self.pending.lock();
            let entry = pending
                .get_mut(&message_id)
                .ok_or_else(|| CoreError::message_not_found(&message_id))?;
            if !entry.expected.contains(agent) {
                return Err(CoreError::Validation(format!(
                    "{agent} is not a receiver of message {message_id}"
                )));
            }
            entry.acked.insert(agent.clone());
            let fully = entry.acked.len() == entry.expected.len();
            if fully {
                if let Some(done) = pending.remove(&message_id) {
                    if self.config.enable_persistence {
                        self.archive.lock().insert(message_id, (done.message, done.stored_at));
                    }
                }
            }
            fully
        };

        self.retries
            .lock()
            .cancel(&message_id, &DeliveryTarget::Agent(agent.clone()));

        if fully {
            self.stats.fully_acknowledged.fetch_add(1, Ordering::Relaxed);
            debug!(message_id = %message_id, "Message fully acknowledged");
            self.events.publish(CoreEvent::MessageFullyAcknowledged { message_id });
        }
        Ok(fully)
    }

    /// A message still awaiting acknowledgement, or one kept after full
    /// acknowledgement while persistence is enabled
    pub fn retained_message(&self, message_id: &MessageId) -> Option<Message> {
        if let Some(entry) = self.pending.lock().get(message_id) {
            return Some(entry.message.clone());
        }
        self.archive.lock().get(message_id).map(|(message, _)| message.clone())
    }

    /// Receivers that have not acknowledged yet, or `None` if the message is no longer tracked
    pub fn pending_acks(&self, message_id: &MessageId) -> Option<Vec<AgentId>> {
        self.pending.lock().get(message_id).map(|p| {
            let mut waiting: Vec<_> = p.expected.difference(&p.acked).cloned().collect();
            waiting.sort();
            waiting
        })
    }

    // === Topics ===

    /// Subscribe `subscriber` to an exact topic or a `+`/`#` pattern
    pub fn subscribe_to_topic(&self, topic: &str, subscriber: AgentId, opts: SubscribeOptions) -> CoreResult<SubscriptionId> {
        let id = self.topics.write().subscribe(topic, subscriber.clone(), opts)?;
        debug!(topic, subscriber = %subscriber, subscription = %id, "Subscribed to topic");
        Ok(id)
    }

    /// Remove a topic subscription
    pub fn unsubscribe_from_topic(&self, id: SubscriptionId) -> CoreResult<()> {
        self.topics
            .write()
            .unsubscribe(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))
    }

    // === Channels ===

    /// Create a channel. Names are unique.
    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> CoreResult<()> {
        {
            let mut channels = self.channels.write();
            if channels.contains_key(name) {
                return Err(CoreError::Validation(format!("channel {name} already exists")));
            }
            channels.insert(name.to_string(), Channel::new(name, options));
        }
        info!(channel = name, "Channel created");
        self.events.publish(CoreEvent::ChannelCreated { channel: name.to_string() });
        Ok(())
    }

    /// Add `agent` to a channel, subject to its policy and capacity
    pub fn join_channel(&self, name: &str, agent: AgentId) -> CoreResult<()> {
        let joined = {
            let mut channels = self.channels.write();
            let channel = channels
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))?;
            channel.join(agent.clone())?
        };
        if joined {
            debug!(channel = name, agent_id = %agent, "Joined channel");
            self.events.publish(CoreEvent::ChannelJoined {
                channel: name.to_string(),
                agent_id: agent,
            });
        }
        Ok(())
    }

    /// Remove `agent` from a channel. Returns false if it was not a participant.
    pub fn leave_channel(&self, name: &str, agent: &AgentId) -> CoreResult<bool> {
        let left = {
            let mut channels = self.channels.write();
            let channel = channels
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))?;
            channel.leave(agent)
        };
        if left {
            debug!(channel = name, agent_id = %agent, "Left channel");
            self.events.publish(CoreEvent::ChannelLeft {
                channel: name.to_string(),
                agent_id: agent.clone(),
            });
        }
        Ok(left)
    }

    /// Remove a channel; only its admins (or the bus itself) may do so.
    /// Pending retries of messages sent through it are cancelled.
    pub fn delete_channel(&self, name: &str, requester: &AgentId) -> CoreResult<()> {
        {
            let mut channels = self.channels.write();
            let channel = channels
                .get(name)
                .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))?;
            if requester != &self.identity && !channel.policy.is_admin(requester) {
                return Err(CoreError::AccessDenied(format!("{requester} is not an admin of {name}")));
            }
            channels.remove(name);
        }
        let cancelled = self
            .retries
            .lock()
            .cancel_where(|e| e.message.metadata.channel.as_deref() == Some(name));
        info!(channel = name, cancelled_retries = cancelled, "Channel deleted");
        Ok(())
    }

    /// Participants of a channel in join order
    pub fn channel_participants(&self, name: &str) -> CoreResult<Vec<AgentId>> {
        self.channels
            .read()
            .get(name)
            .map(|c| c.participants().to_vec())
            .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))
    }

    /// Counters of a channel
    pub fn channel_stats(&self, name: &str) -> CoreResult<ChannelStats> {
        self.channels
            .read()
            .get(name)
            .map(|c| c.stats.clone())
            .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))
    }

    /// Add a filter every broadcast on the channel must pass
    pub fn add_channel_filter(&self, name: &str, filter: MessageFilter) -> CoreResult<()> {
        self.with_channel(name, |c| c.add_filter(filter))
    }

    /// Add middleware run on every broadcast on the channel
    pub fn add_channel_middleware(&self, name: &str, middleware: Arc<dyn MessageMiddleware>) -> CoreResult<()> {
        self.with_channel(name, |c| c.add_middleware(middleware))
    }

    fn with_channel(&self, name: &str, f: impl FnOnce(&mut Channel)) -> CoreResult<()> {
        let mut channels = self.channels.write();
        let channel = channels
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("channel {name}")))?;
        f(channel);
        Ok(())
    }

    // === Queues ===

    /// Create a queue. Its dead-letter queue, if any, must already exist.
    pub fn create_queue(&self, name: &str, options: QueueOptions) -> CoreResult<()> {
        if let Some(dlq) = &options.dead_letter {
            if dlq == name {
                return Err(CoreError::Validation(format!("queue {name} cannot dead-letter into itself")));
            }
            if !self.queues.read().contains_key(dlq) {
                return Err(CoreError::NotFound(format!("dead-letter queue {dlq}")));
            }
        }
        {
            let mut queues = self.queues.write();
            if queues.contains_key(name) {
                return Err(CoreError::Validation(format!("queue {name} already exists")));
            }
            let queue = MessageQueue::new(name, options, self.config.max_queue_size, self.retry_policy.clone())
                .with_ordering(self.config.enable_ordering);
            queues.insert(name.to_string(), Arc::new(Mutex::new(queue)));
        }
        info!(queue = name, "Queue created");
        self.events.publish(CoreEvent::QueueCreated { queue: name.to_string() });
        Ok(())
    }

    /// Remove a queue and cancel retries targeting it
    pub fn delete_queue(&self, name: &str) -> CoreResult<()> {
        if name == self.config.dead_letter_queue {
            return Err(CoreError::Validation("the system dead-letter queue cannot be deleted".into()));
        }
        self.queues
            .write()
            .remove(name)
            .ok_or_else(|| CoreError::NotFound(format!("queue {name}")))?;
        let target = DeliveryTarget::Queue(name.to_string());
        let cancelled = self.retries.lock().cancel_where(|e| e.target == target);
        info!(queue = name, cancelled_retries = cancelled, "Queue deleted");
        Ok(())
    }

    fn queue(&self, name: &str) -> CoreResult<Arc<Mutex<MessageQueue>>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("queue {name}")))
    }

    /// Append to a queue. A full queue routes to its dead-letter queue when it
    /// has one and rejects with a capacity error otherwise.
    pub fn enqueue_message(&self, name: &str, message: Message) -> CoreResult<EnqueueOutcome> {
        let queue = self.queue(name)?;
        let (overflow, dlq) = {
            let mut q = queue.lock();
            match q.push(message, Instant::now()) {
                Ok(()) => return Ok(EnqueueOutcome::Enqueued),
                Err(rejected) => (rejected, q.dead_letter.clone()),
            }
        };
        match dlq {
            Some(dlq) => {
                if self.dead_letter(overflow, DeadLetterReason::QueueFull, name, 1, Some(&dlq)) {
                    Ok(EnqueueOutcome::DeadLettered(dlq))
                } else {
                    Err(CoreError::Capacity(format!("queue {name} and its dead-letter queue {dlq} are full")))
                }
            }
            None => Err(CoreError::Capacity(format!("queue {name} is full"))),
        }
    }

    /// Take the next message per the queue discipline
    pub fn dequeue_message(&self, name: &str) -> CoreResult<Option<Message>> {
        let queue = self.queue(name)?;
        let message = queue.lock().take(Instant::now(), None);
        Ok(message)
    }

    /// Confirm a message taken from an at-least-once or exactly-once queue
    pub fn acknowledge_queued(&self, name: &str, message_id: MessageId) -> CoreResult<()> {
        let queue = self.queue(name)?;
        let acked = queue.lock().ack(&message_id);
        if acked {
            Ok(())
        } else {
            Err(CoreError::message_not_found(&message_id))
        }
    }

    /// Register a consumer for [`MessageBus::dispatch_queue`]
    pub fn subscribe_queue(&self, name: &str, subscriber: QueueSubscriber) -> CoreResult<()> {
        self.queue(name)?.lock().add_subscriber(subscriber);
        Ok(())
    }

    /// Remove a queue consumer
    pub fn unsubscribe_queue(&self, name: &str, agent: &AgentId) -> CoreResult<bool> {
        Ok(self.queue(name)?.lock().remove_subscriber(agent))
    }

    /// Hand queued messages to subscriber mailboxes until no subscriber can
    /// take more. Returns the number dispatched.
    pub fn dispatch_queue(&self, name: &str) -> CoreResult<usize> {
        let queue = self.queue(name)?;
        let mut q = queue.lock();
        let mut dispatched = 0;
        while let Some((message, subscriber)) = q.next_dispatch(Instant::now()) {
            match self.push_to_mailbox(&subscriber.agent, message.clone(), 1, Some(name.to_string())) {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    debug!(queue = name, subscriber = %subscriber.agent, error = %e, "Queue hand-off failed");
                    q.restore(message);
                    break;
                }
            }
        }
        Ok(dispatched)
    }

    /// Messages waiting in a queue, in-flight ones excluded
    pub fn queue_len(&self, name: &str) -> CoreResult<usize> {
        Ok(self.queue(name)?.lock().len())
    }

    /// Messages currently held by a queue, in dequeue-independent order
    pub fn queue_snapshot(&self, name: &str) -> CoreResult<Vec<Message>> {
        Ok(self.queue(name)?.lock().peek_all().into_iter().cloned().collect())
    }

    // === Retry sweep ===

    /// One pass of retry, redelivery, in-flight requeue and retention purge
    pub fn run_retry_sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        let due = self.retries.lock().take_due(now);
        for entry in due {
            report.retried += 1;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            if entry.message.is_expired_at(Utc::now()) {
                debug!(message_id = %entry.message.id, "Dropping retry for expired message");
                continue;
            }
            let attempt = entry.attempts + 1;
            match self.deliver(&entry.target, &entry.message, attempt) {
                Ok(()) => {
                    report.delivered += 1;
                    self.record_delivery(&entry.message, &entry.target);
                }
                Err(e) => {
                    if self.retry_policy.is_exhausted(attempt) {
                        report.dead_lettered += 1;
                    }
                    self.handle_failure(entry.message, entry.target, attempt, e);
                }
            }
        }

        report.redelivery_scheduled = self.schedule_unacked_redeliveries(now, &mut report.dead_lettered);
        report.requeued_from_queues = self.requeue_queue_in_flight(now, &mut report.dead_lettered);
        report.purged = self.purge_expired(now);

        if report != SweepReport::default() {
            debug!(?report, "Retry sweep finished");
        }
        report
    }

    fn schedule_unacked_redeliveries(&self, now: Instant, dead_lettered: &mut usize) -> usize {
        if !self.config.enable_reliability {
            return 0;
        }
        let mut exhausted = Vec::new();
        let mut scheduled = Vec::new();
        {
            let mut pending = self.pending.lock();
            for (id, entry) in pending.iter_mut() {
                if !entry.message.reliability.is_reliable()
                    || now.duration_since(entry.last_sent) < self.config.ack_timeout
                {
                    continue;
                }
                entry.redeliveries += 1;
                entry.last_sent = now;
                let attempts = entry.redeliveries;
                if self.retry_policy.is_exhausted(attempts + 1) {
                    exhausted.push((*id, entry.message.clone(), attempts + 1));
                    continue;
                }
                for agent in entry.expected.difference(&entry.acked) {
                    scheduled.push(RetryEntry {
                        message: entry.message.clone(),
                        target: DeliveryTarget::Agent(agent.clone()),
                        attempts,
                        next_attempt: now,
                        last_error: "acknowledgement timed out".into(),
                    });
                }
            }
        }

        let count = {
            let mut retries = self.retries.lock();
            let mut count = 0;
            for entry in scheduled {
                if !retries.contains(&entry.message.id, &entry.target) {
                    retries.schedule(entry);
                    count += 1;
                }
            }
            count
        };
        for (id, message, attempts) in exhausted {
            warn!(message_id = %id, attempts, "Acknowledgement never arrived");
            if self.dead_letter(message, DeadLetterReason::RetryExhausted, "ack-timeout", attempts, None) {
                *dead_lettered += 1;
            }
        }
        count
    }

    fn requeue_queue_in_flight(&self, now: Instant, dead_lettered: &mut usize) -> usize {
        let queues: Vec<_> = self.queues.read().values().cloned().collect();
        let mut requeued = 0;
        for queue in queues {
            let (name, dlq, rejected) = {
                let mut q = queue.lock();
                let before = q.in_flight_len();
                let rejected = q.requeue_expired(now, self.config.ack_timeout);
                requeued += before - q.in_flight_len() - rejected.len();
                (q.name.clone(), q.dead_letter.clone(), rejected)
            };
            for (message, attempts, reason) in rejected {
                if reason == DeadLetterReason::QueueFull {
                    warn!(message_id = %message.id, queue = %name, "No room to requeue unacknowledged message");
                }
                if self.dead_letter(message, reason, &name, attempts, dlq.as_deref()) {
                    *dead_lettered += 1;
                }
            }
        }
        requeued
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let retention = self.config.message_retention;
        let purged: Vec<MessageId> = {
            let mut pending = self.pending.lock();
            let expired: Vec<_> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.stored_at) >= retention)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                pending.remove(id);
            }
            expired
        };
        if !purged.is_empty() {
            let mut retries = self.retries.lock();
            for id in &purged {
                retries.cancel_message(id);
            }
        }
        let archived = {
            let mut archive = self.archive.lock();
            let before = archive.len();
            archive.retain(|_, (_, stored_at)| now.duration_since(*stored_at) < retention);
            before - archive.len()
        };
        purged.len() + archived
    }

    /// Deliveries waiting to be retried
    pub fn retry_queue_len(&self) -> usize {
        self.retries.lock().len()
    }

    /// Attempts recorded for a pending retry
    pub fn retry_attempts(&self, message_id: &MessageId, target: &DeliveryTarget) -> Option<u32> {
        self.retries.lock().get(message_id, target).map(|e| e.attempts)
    }

    /// Snapshot of the bus counters
    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            fully_acknowledged: self.stats.fully_acknowledged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::types::Priority;

    fn agent(name: &str) -> AgentId {
        AgentId::new("swarm", name)
    }

    fn bus() -> Arc<MessageBus> {
        let config = BusConfig {
            retry_jitter: 0.0,
            ..BusConfig::default()
        };
        MessageBus::new(config, EventBus::default())
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected_before_delivery() {
        let bus = MessageBus::new(
            BusConfig {
                max_message_size: 16,
                ..BusConfig::default()
            },
            EventBus::default(),
        );
        let mut events = bus.events().subscribe();
        let mut inbox = bus.connect(agent("b"));

        let err = bus
            .send_message("note", MessageContent::text("x".repeat(64)), agent("a"), vec![agent("b")], SendOptions::default())
            .unwrap_err();
        assert_eq!(err.reason(), "validation");
        assert!(inbox.try_recv().is_none());
        assert!(!events.drain().iter().any(|e| matches!(e, CoreEvent::MessageSent { .. })));
        assert_eq!(bus.stats().sent, 0);
    }

    #[tokio::test]
    async fn test_empty_receivers_and_expired_messages_are_rejected() {
        let bus = bus();
        let err = bus
            .send_message("note", MessageContent::text("hi"), agent("a"), vec![], SendOptions::default())
            .unwrap_err();
        assert_eq!(err.reason(), "validation");

        let opts = SendOptions {
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..SendOptions::default()
        };
        let err = bus
            .send_message("note", MessageContent::text("hi"), agent("a"), vec![agent("b")], opts)
            .unwrap_err();
        assert_eq!(err.reason(), "validation");
    }

    #[tokio::test]
    async fn test_delivery_and_acknowledgement() {
        let bus = bus();
        let mut events = bus.events().subscribe();
        let mut b = bus.connect(agent("b"));
        let mut c = bus.connect(agent("c"));

        let id = bus
            .send_message("task.update", json!({"step": 1}).into(), agent("a"), vec![agent("b"), agent("c")], SendOptions::default())
            .unwrap();

        let delivered = b.try_recv().unwrap();
        assert_eq!(delivered.message.id, id);
        assert_eq!(delivered.attempt, 1);
        assert_eq!(delivered.message.json_field("step"), Some(&json!(1)));
        assert!(c.try_recv().is_some());

        assert!(!bus.acknowledge_message(id, &agent("b")).unwrap());
        assert_eq!(bus.pending_acks(&id), Some(vec![agent("c")]));
        assert!(bus.acknowledge_message(id, &agent("c")).unwrap());
        assert!(bus.pending_acks(&id).is_none());
        assert!(bus.retained_message(&id).is_none());
        assert_eq!(bus.acknowledge_message(id, &agent("c")).unwrap_err().reason(), "not_found");

        let events = events.drain();
        assert!(events.iter().any(|e| matches!(e, CoreEvent::MessageFullyAcknowledged { message_id } if *message_id == id)));
        assert_eq!(bus.stats().fully_acknowledged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_keeps_acknowledged_messages_for_retention() {
        let bus = MessageBus::new(
            BusConfig {
                enable_persistence: true,
                message_retention: Duration::from_secs(10),
                ..BusConfig::default()
            },
            EventBus::default(),
        );
        let _b = bus.connect(agent("b"));
        let id = bus
            .send_message("note", MessageContent::text("kept"), agent("a"), vec![agent("b")], SendOptions::default())
            .unwrap();
        assert!(bus.acknowledge_message(id, &agent("b")).unwrap());
        assert!(bus.pending_acks(&id).is_none());
        assert_eq!(bus.retained_message(&id).unwrap().id, id);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(bus.run_retry_sweep().purged, 1);
        assert!(bus.retained_message(&id).is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_from_non_receiver_is_rejected() {
        let bus = bus();
        let _b = bus.connect(agent("b"));
        let id = bus
            .send_message("ping", MessageContent::text("hi"), agent("a"), vec![agent("b")], SendOptions::default())
            .unwrap();
        assert_eq!(bus.acknowledge_message(id, &agent("z")).unwrap_err().reason(), "validation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_backs_off_then_dead_letters() {
        let bus = bus();
        let mut events = bus.events().subscribe();
        let target = DeliveryTarget::Agent(agent("offline"));

        let id = bus
            .send_message("job", MessageContent::text("work"), agent("a"), vec![agent("offline")], SendOptions::default())
            .unwrap();
        assert_eq!(bus.retry_attempts(&id, &target), Some(1));

        // not due yet
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(bus.run_retry_sweep().retried, 0);

        tokio::time::advance(Duration::from_millis(500)).await;
        let report = bus.run_retry_sweep();
        assert_eq!(report.retried, 1);
        assert_eq!(bus.retry_attempts(&id, &target), Some(2));

        // second backoff doubles
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bus.run_retry_sweep().retried, 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = bus.run_retry_sweep();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(bus.retry_queue_len(), 0);

        let dead = bus.queue_snapshot("system-dlq").unwrap();
        assert_eq!(dead.len(), 1);
        let info = dead[0].metadata.dead_letter.as_ref().unwrap();
        assert_eq!(info.reason, DeadLetterReason::RetryExhausted);
        assert_eq!(info.attempts, 3);
        assert!(events.drain().iter().any(|e| matches!(
            e,
            CoreEvent::MessageDeadLettered { reason, .. } if reason == "retry_exhausted"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_once_agent_connects() {
        let bus = bus();
        let id = bus
            .send_message("job", MessageContent::text("work"), agent("a"), vec![agent("late")], SendOptions::default())
            .unwrap();
        let mut inbox = bus.connect(agent("late"));

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = bus.run_retry_sweep();
        assert_eq!(report.delivered, 1);
        let delivery = inbox.try_recv().unwrap();
        assert_eq!(delivery.message.id, id);
        assert_eq!(delivery.attempt, 2);
    }

    #[tokio::test]
    async fn test_best_effort_failures_are_dropped() {
        let bus = bus();
        bus.send_message("ping", MessageContent::text("hi"), agent("a"), vec![agent("gone")], SendOptions::best_effort())
            .unwrap();
        assert_eq!(bus.retry_queue_len(), 0);
        assert_eq!(bus.queue_len("system-dlq").unwrap(), 0);
        assert_eq!(bus.stats().failed_deliveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_is_redelivered() {
        let bus = bus();
        let mut inbox = bus.connect(agent("b"));
        let id = bus
            .send_message("job", MessageContent::text("work"), agent("a"), vec![agent("b")], SendOptions::default())
            .unwrap();
        assert_eq!(inbox.drain().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bus.run_retry_sweep().redelivery_scheduled, 1);
        bus.run_retry_sweep();
        let again = inbox.try_recv().unwrap();
        assert_eq!(again.message.id, id);
        assert_eq!(again.attempt, 2);

        assert!(bus.acknowledge_message(id, &agent("b")).unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bus.run_retry_sweep().redelivery_scheduled, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_channel_participants() {
        let bus = bus();
        bus.create_channel("ops", ChannelOptions::new(ChannelType::Multicast)).unwrap();
        let mut inboxes: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|n| {
                bus.join_channel("ops", agent(n)).unwrap();
                bus.connect(agent(n))
            })
            .collect();

        bus.broadcast_message("status", MessageContent::text("green"), agent("a"), BroadcastOptions::on("ops"))
            .unwrap();

        assert!(inboxes[0].try_recv().is_none());
        for inbox in &mut inboxes[1..] {
            let d = inbox.try_recv().unwrap();
            assert_eq!(d.message.metadata.channel.as_deref(), Some("ops"));
        }
        let stats = bus.channel_stats("ops").unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.joins, 3);
    }

    #[tokio::test]
    async fn test_broadcast_filters_and_acl() {
        let bus = bus();
        let mut policy = AccessPolicy::default();
        policy.banned_senders.insert(agent("eve"));
        bus.create_channel("alerts", ChannelOptions::default().policy(policy)).unwrap();
        bus.add_channel_filter("alerts", MessageFilter::min_priority(Priority::High)).unwrap();
        bus.join_channel("alerts", agent("a")).unwrap();
        bus.join_channel("alerts", agent("b")).unwrap();

        let err = bus
            .broadcast_message("alert", MessageContent::text("disk"), agent("a"), BroadcastOptions::on("alerts"))
            .unwrap_err();
        assert_eq!(err.reason(), "validation");
        assert_eq!(bus.channel_stats("alerts").unwrap().messages_filtered, 1);

        let err = bus
            .broadcast_message("alert", MessageContent::text("disk"), agent("eve"), BroadcastOptions::on("alerts"))
            .unwrap_err();
        assert_eq!(err.reason(), "access_denied");

        let urgent = BroadcastOptions::on("alerts").with_send(SendOptions::default().with_priority(Priority::Critical));
        assert!(bus.broadcast_message("alert", MessageContent::text("disk"), agent("a"), urgent).is_ok());
    }

    struct Stamp;

    impl MessageMiddleware for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        fn process(&self, mut message: Message) -> CoreResult<Message> {
            message.metadata.route.push("stamped".into());
            Ok(message)
        }
    }

    #[tokio::test]
    async fn test_channel_middleware_runs() {
        let bus = bus();
        bus.create_channel("ops", ChannelOptions::default()).unwrap();
        bus.add_channel_middleware("ops", Arc::new(Stamp)).unwrap();
        bus.join_channel("ops", agent("a")).unwrap();
        bus.join_channel("ops", agent("b")).unwrap();
        let mut inbox = bus.connect(agent("b"));

        bus.broadcast_message("x", MessageContent::text("y"), agent("a"), BroadcastOptions::on("ops"))
            .unwrap();
        let route = inbox.try_recv().unwrap().message.metadata.route;
        assert!(route.contains(&"stamped".to_string()));
    }

    #[tokio::test]
    async fn test_delete_channel_requires_admin() {
        let bus = bus();
        bus.create_channel("ops", ChannelOptions::default().admin(agent("lead"))).unwrap();
        assert_eq!(bus.delete_channel("ops", &agent("a")).unwrap_err().reason(), "access_denied");
        bus.delete_channel("ops", &agent("lead")).unwrap();
        assert_eq!(bus.channel_stats("ops").unwrap_err().reason(), "not_found");
    }

    #[tokio::test]
    async fn test_full_queue_dead_letters_or_rejects() {
        let bus = bus();
        bus.create_queue("work", QueueOptions::new(QueueType::Fifo).max_size(1).dead_letter("system-dlq"))
            .unwrap();
        bus.create_queue("strict", QueueOptions::new(QueueType::Fifo).max_size(1)).unwrap();

        let msg = || Message::new("job", MessageContent::text("x"), agent("a"), vec![queue_address("work")]);
        assert_eq!(bus.enqueue_message("work", msg()).unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(
            bus.enqueue_message("work", msg()).unwrap(),
            EnqueueOutcome::DeadLettered("system-dlq".into())
        );
        let dead = bus.queue_snapshot("system-dlq").unwrap();
        assert_eq!(dead[0].metadata.dead_letter.as_ref().unwrap().reason.as_str(), "queue_full");

        bus.enqueue_message("strict", msg()).unwrap();
        assert_eq!(bus.enqueue_message("strict", msg()).unwrap_err().reason(), "capacity");
        assert_eq!(bus.queue_len("strict").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_requeue_respects_max_size() {
        let bus = bus();
        bus.create_queue("work", QueueOptions::new(QueueType::Fifo).max_size(1).dead_letter("system-dlq"))
            .unwrap();
        let msg = |label| Message::new("job", MessageContent::text(label), agent("a"), vec![queue_address("work")]);

        bus.enqueue_message("work", msg("first")).unwrap();
        let taken = bus.dequeue_message("work").unwrap().unwrap();
        bus.enqueue_message("work", msg("second")).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = bus.run_retry_sweep();
        assert_eq!(report.requeued_from_queues, 0);
        assert_eq!(bus.queue_len("work").unwrap(), 1);

        let dead = bus.queue_snapshot("system-dlq").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, taken.id);
        assert_eq!(dead[0].metadata.dead_letter.as_ref().unwrap().reason.as_str(), "queue_full");
    }

    #[tokio::test]
    async fn test_create_queue_requires_existing_dead_letter_queue() {
        let bus = bus();
        let err = bus
            .create_queue("work", QueueOptions::default().dead_letter("missing"))
            .unwrap_err();
        assert_eq!(err.reason(), "not_found");
        assert_eq!(bus.delete_queue("system-dlq").unwrap_err().reason(), "validation");
    }

    #[tokio::test]
    async fn test_queue_dequeue_and_ack() {
        let bus = bus();
        bus.create_queue("work", QueueOptions::default()).unwrap();
        let id = bus
            .send_message("job", MessageContent::text("x"), agent("a"), vec![queue_address("work")], SendOptions::default())
            .unwrap();
        assert_eq!(bus.queue_len("work").unwrap(), 1);

        let taken = bus.dequeue_message("work").unwrap().unwrap();
        assert_eq!(taken.id, id);
        bus.acknowledge_queued("work", id).unwrap();
        assert_eq!(bus.acknowledge_queued("work", id).unwrap_err().reason(), "not_found");
        assert!(bus.dequeue_message("work").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_dispatch_to_subscribers() {
        let bus = bus();
        bus.create_queue("work", QueueOptions::new(QueueType::RoundRobin)).unwrap();
        bus.subscribe_queue("work", QueueSubscriber::new(agent("w1"))).unwrap();
        bus.subscribe_queue("work", QueueSubscriber::new(agent("w2"))).unwrap();
        let mut w1 = bus.connect(agent("w1"));
        let mut w2 = bus.connect(agent("w2"));
        for _ in 0..4 {
            let m = Message::new("job", MessageContent::text("x"), agent("a"), vec![queue_address("work")]);
            bus.enqueue_message("work", m).unwrap();
        }

        assert_eq!(bus.dispatch_queue("work").unwrap(), 4);
        assert_eq!(w1.drain().len(), 2);
        let w2_got = w2.drain();
        assert_eq!(w2_got.len(), 2);
        assert_eq!(w2_got[0].queue.as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_topic_publish() {
        let bus = bus();
        let mut exact = bus.connect(agent("exact"));
        let mut wild = bus.connect(agent("wild"));
        bus.subscribe_to_topic("tasks.build", agent("exact"), SubscribeOptions::default()).unwrap();
        let sub = bus
            .subscribe_to_topic("tasks.#", agent("wild"), SubscribeOptions::qos(Qos::AtLeastOnce))
            .unwrap();

        let ids = bus
            .publish_to_topic("tasks.build", "event", MessageContent::text("done"), agent("a"), SendOptions::default())
            .unwrap();
        assert_eq!(ids.len(), 2);
        let got = exact.try_recv().unwrap().message;
        assert_eq!(got.reliability, Reliability::BestEffort);
        assert_eq!(got.metadata.topic.as_deref(), Some("tasks.build"));
        assert_eq!(wild.try_recv().unwrap().message.reliability, Reliability::AtLeastOnce);

        bus.unsubscribe_from_topic(sub).unwrap();
        let ids = bus
            .publish_to_topic("tasks.test", "event", MessageContent::text("done"), agent("a"), SendOptions::default())
            .unwrap();
        assert!(ids.is_empty());
    }
}
