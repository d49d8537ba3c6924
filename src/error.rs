//! Conclave error types

use thiserror::Error;

use crate::types::{MessageId, ProposalId, TaskId};

/// Result alias used across the crate
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the coordination core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Oversized, expired or receiver-less message, malformed vote, bad input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Queue full or channel at capacity
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Agent assignment or acknowledgement wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Vote after a terminal state, threshold out of range
    #[error("Consensus rejected: {0}")]
    ConsensusRejected(String),

    /// Checkpoint scored below its failure threshold
    #[error("Checkpoint failed in phase '{phase}': score {score:.3} below threshold {threshold:.3}")]
    PlanFailure {
        task_id: TaskId,
        phase: String,
        score: f64,
        threshold: f64,
    },

    /// Unknown channel, queue, proposal, task or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// Channel access policy denied the operation
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Work abandoned because its owner was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An injected collaborator failed
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable reason string for callers that format errors for humans
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Capacity(_) => "capacity",
            CoreError::Timeout(_) => "timeout",
            CoreError::ConsensusRejected(_) => "consensus_rejected",
            CoreError::PlanFailure { .. } => "checkpoint_failure",
            CoreError::NotFound(_) => "not_found",
            CoreError::AccessDenied(_) => "access_denied",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Config(_) => "config",
            CoreError::Collaborator(_) => "collaborator",
        }
    }

    /// Whether a message delivery failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Capacity(_) | CoreError::Timeout(_) | CoreError::NotFound(_)
        )
    }

    pub(crate) fn message_not_found(id: &MessageId) -> Self {
        CoreError::NotFound(format!("message {id}"))
    }

    pub(crate) fn proposal_not_found(id: &ProposalId) -> Self {
        CoreError::NotFound(format!("proposal {id}"))
    }

    pub(crate) fn task_not_found(id: &TaskId) -> Self {
        CoreError::NotFound(format!("task {id}"))
    }
}
