//! # Conclave
//!
//! Swarm coordination core - the room where the swarm decides.
//!
//! This crate carries messages between agents, turns their votes into
//! decisions, and drives tasks through planned phases on top of both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          TASK ORCHESTRATOR                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │ Task Planner │  │  Assignment  │  │ Load Balancer│               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └───────────┬───────────────────────────────────────┬─────────────────┘
//!             │ approvals / reviews                    │ assignments
//!             ▼                                        │
//! ┌───────────────────────┐                            │
//! │   CONSENSUS ENGINE    │                            │
//! │ proposals · votes ·   │                            │
//! │ thresholds · deadlines│                            │
//! └───────────┬───────────┘                            │
//!             │ vote requests / results                │
//!             ▼                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            MESSAGE BUS                               │
//! │   direct · channels · topics · queues · retry · dead letters         │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!      ┌───────┐           ┌───────┐           ┌───────┐
//!      │ Agent │           │ Agent │           │ Agent │
//!      └───────┘           └───────┘           └───────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: An external worker known through an [`AgentDirectory`]
//! - **Message**: A unit of communication routed by the [`MessageBus`]
//! - **Proposal**: A decision put to the agents of a swarm
//! - **Task**: A unit of work split into phases and gated by checkpoints

pub mod agent;
pub mod bus;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod types;

pub use agent::{AgentDirectory, AgentInfo, AgentStatus, InMemoryAgentDirectory, InMemoryPerformanceStore, PerformanceStore};
pub use bus::{Mailbox, Message, MessageBus, MessageContent, SendOptions};
pub use config::{BusConfig, ConsensusConfig, CoreConfig, OrchestratorConfig};
pub use consensus::{ConsensusEngine, ConsensusProposal, ConsensusVote, DecisionAction, NewProposal, ProposalStatus};
pub use error::{CoreError, CoreResult};
pub use events::{CoreEvent, EventBus};
pub use orchestrator::{Collaborators, Task, TaskOrchestrator, TaskStatus, TaskStrategy};
pub use store::{InMemoryProposalStore, InMemoryTaskStore, ProposalStore, TaskStore};
pub use types::{AgentId, MessageId, Priority, ProposalId, SubscriptionId, TaskId};
