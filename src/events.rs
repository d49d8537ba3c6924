//! Outbound events
//!
//! Every subsystem publishes [`CoreEvent`]s on a shared [`EventBus`]. The
//! excluded API/UI layers subscribe to it for logging and notifications.
//! Delivery is best-effort: a receiver that falls behind loses the oldest
//! events and is told how many it missed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{AgentId, MessageId, ProposalId, TaskId};

/// Events emitted by the coordination core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    TaskAssigned {
        task_id: TaskId,
        phase: String,
        slot: usize,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    ProgressUpdate {
        task_id: TaskId,
        progress: f64,
        completed_phases: usize,
        total_phases: usize,
    },
    CheckpointPassed {
        task_id: TaskId,
        phase: String,
        score: f64,
    },
    ProposalCreated {
        proposal_id: ProposalId,
        swarm_id: String,
        eligible_voters: usize,
    },
    VoteSubmitted {
        proposal_id: ProposalId,
        agent_id: AgentId,
        vote: bool,
    },
    ConsensusAchieved {
        proposal_id: ProposalId,
        final_ratio: f64,
    },
    ConsensusFailed {
        proposal_id: ProposalId,
        final_ratio: f64,
        reason: String,
    },
    MessageSent {
        message_id: MessageId,
        kind: String,
        receivers: usize,
    },
    MessageDelivered {
        message_id: MessageId,
        receiver: AgentId,
    },
    MessageFullyAcknowledged {
        message_id: MessageId,
    },
    MessageDeadLettered {
        message_id: MessageId,
        reason: String,
    },
    ChannelCreated {
        channel: String,
    },
    ChannelJoined {
        channel: String,
        agent_id: AgentId,
    },
    ChannelLeft {
        channel: String,
        agent_id: AgentId,
    },
    QueueCreated {
        queue: String,
    },
    Error {
        source: String,
        reason: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl CoreEvent {
    /// Build an error event from a failed background operation
    pub fn error(source: impl Into<String>, err: &crate::error::CoreError) -> Self {
        CoreEvent::Error {
            source: source.into(),
            reason: err.reason().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }

    /// Task the event refers to, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CoreEvent::TaskAssigned { task_id, .. }
            | CoreEvent::TaskCompleted { task_id, .. }
            | CoreEvent::TaskFailed { task_id, .. }
            | CoreEvent::TaskCancelled { task_id }
            | CoreEvent::ProgressUpdate { task_id, .. }
            | CoreEvent::CheckpointPassed { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Fan-out publisher for [`CoreEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CoreEvent>>,
}

impl EventBus {
    /// Capacity is the number of events buffered per slow receiver before it lags
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: CoreEvent) {
        let receivers = self.sender.send(event).unwrap_or(0);
        if receivers == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiving half of an [`EventBus`] subscription
pub struct EventReceiver {
    receiver: broadcast::Receiver<CoreEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Result<CoreEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Next buffered event, if any
    pub fn try_recv(&mut self) -> Result<CoreEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
