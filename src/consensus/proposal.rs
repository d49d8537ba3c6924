//! Proposals, votes and outcomes

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::message::{Message, MessageContent};
use crate::error::{CoreError, CoreResult};
use crate::types::{AgentId, Priority, ProposalId, TaskId};

/// What happens to the linked task when a proposal is decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionAction {
    ApproveTask,
    ModifyTask { priority: Option<Priority> },
    CancelTask,
    /// Opaque decision the core does not interpret
    Custom { name: String },
}

/// The decision being voted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalPayload {
    /// Short human-readable title
    pub title: String,
    /// What happens if the proposal passes
    pub action: DecisionAction,
    /// Supporting detail for voters
    pub content: MessageContent,
}

impl ProposalPayload {
    /// Create a payload with empty content
    pub fn new(title: impl Into<String>, action: DecisionAction) -> Self {
        Self {
            title: title.into(),
            action,
            content: MessageContent::Json(serde_json::Value::Null),
        }
    }

    /// Attach supporting detail
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content = content;
        self
    }
}

/// Input to [`ConsensusEngine::create_proposal`](super::ConsensusEngine::create_proposal)
#[derive(Debug, Clone)]
pub struct NewProposal {
    /// Swarm whose members may vote
    pub swarm_id: String,
    /// The decision
    pub proposal: ProposalPayload,
    /// Falls back to the configured default threshold
    pub required_threshold: Option<f64>,
    /// Voting closes at this time
    pub deadline: Option<DateTime<Utc>>,
    /// Task the decision concerns
    pub task_id: Option<TaskId>,
}

impl NewProposal {
    /// Create a proposal for `swarm_id` with default threshold and no deadline
    pub fn new(swarm_id: impl Into<String>, proposal: ProposalPayload) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            proposal,
            required_threshold: None,
            deadline: None,
            task_id: None,
        }
    }

    /// Set the required threshold
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.required_threshold = Some(threshold);
        self
    }

    /// Set the voting deadline
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Tie the proposal to a task
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// A proposal as registered by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    /// Proposal id
    pub id: ProposalId,
    /// Voting swarm
    pub swarm_id: String,
    /// The decision
    pub proposal: ProposalPayload,
    /// Share of eligible voters that must approve
    pub required_threshold: f64,
    /// Voting deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Related task
    pub task_id: Option<TaskId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ConsensusProposal {
    /// Whether voting has closed at `now`
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// One agent's vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
    /// Proposal voted on
    pub proposal_id: ProposalId,
    /// Voter
    pub agent_id: AgentId,
    /// Approve or reject
    pub vote: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConsensusVote {
    /// Create a vote without a reason
    pub fn new(proposal_id: ProposalId, agent_id: AgentId, vote: bool) -> Self {
        Self {
            proposal_id,
            agent_id,
            vote,
            reason: None,
        }
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Parse a vote from a `consensus.vote` message. The sender is the voter.
    pub fn from_message(message: &Message) -> CoreResult<Self> {
        let body = message
            .content
            .as_json()
            .ok_or_else(|| CoreError::Validation("vote message must carry JSON".into()))?;
        let proposal_id = body
            .get("proposal_id")
            .cloned()
            .ok_or_else(|| CoreError::Validation("vote is missing proposal_id".into()))
            .and_then(|v| {
                serde_json::from_value::<ProposalId>(v)
                    .map_err(|e| CoreError::Validation(format!("invalid proposal_id: {e}")))
            })?;
        let vote = match body.get("vote") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(other) => {
                return Err(CoreError::Validation(format!("vote must be a boolean, got {other}")))
            }
            None => return Err(CoreError::Validation("vote is missing its decision".into())),
        };
        let reason = body.get("reason").and_then(|r| r.as_str()).map(str::to_string);
        Ok(Self {
            proposal_id,
            agent_id: message.sender.clone(),
            vote,
            reason,
        })
    }
}

/// Why a proposal failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every eligible vote is in and the threshold was missed
    Rejected,
    /// Voting closed before the threshold was reached
    DeadlineExpired,
    /// The swarm has no active voters
    NoEligibleVoters,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Rejected => "rejected",
            FailureReason::DeadlineExpired => "deadline_expired",
            FailureReason::NoEligibleVoters => "no_eligible_voters",
        }
    }
}

/// Lifecycle of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Achieved,
    Failed(FailureReason),
}

impl ProposalStatus {
    /// Whether the proposal has concluded
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Active)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Active => f.write_str("active"),
            ProposalStatus::Achieved => f.write_str("achieved"),
            ProposalStatus::Failed(reason) => write!(f, "failed ({})", reason.as_str()),
        }
    }
}

/// Tally of a proposal's votes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Positive votes over eligible voters reached the threshold
    pub achieved: bool,
    /// Positive votes over votes cast
    pub final_ratio: f64,
    /// Votes cast
    pub total_votes: usize,
    /// Approvals
    pub positive_votes: usize,
    /// Rejections
    pub negative_votes: usize,
    /// Votes cast over eligible voters
    pub participation_rate: f64,
}

impl ConsensusResult {
    /// Tally `votes` against an electorate of `eligible`
    pub fn tally<'a>(votes: impl IntoIterator<Item = &'a ConsensusVote>, eligible: usize, threshold: f64) -> Self {
        let (positive, negative) = votes
            .into_iter()
            .fold((0usize, 0usize), |(p, n), v| if v.vote { (p + 1, n) } else { (p, n + 1) });
        let total = positive + negative;
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            achieved: eligible > 0 && ratio(positive, eligible) >= threshold,
            final_ratio: ratio(positive, total),
            total_votes: total,
            positive_votes: positive,
            negative_votes: negative,
            participation_rate: ratio(total, eligible),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn votes(pattern: &[bool]) -> Vec<ConsensusVote> {
        let id = ProposalId::new();
        pattern
            .iter()
            .enumerate()
            .map(|(i, v)| ConsensusVote::new(id, AgentId::new("swarm", format!("a{i}")), *v))
            .collect()
    }

    #[test]
    fn test_two_of_three_meets_two_thirds() {
        assert!(!ConsensusResult::tally(&votes(&[true]), 3, 0.66).achieved);
        let result = ConsensusResult::tally(&votes(&[true, true]), 3, 0.66);
        assert!(result.achieved);
        assert_eq!(result.final_ratio, 1.0);

        let result = ConsensusResult::tally(&votes(&[true, false, false]), 3, 0.66);
        assert!(!result.achieved);
        assert!((result.final_ratio - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.participation_rate, 1.0);
        assert_eq!(result.negative_votes, 2);
    }

    #[test]
    fn test_vote_from_message() {
        let proposal = ProposalId::new();
        let voter = AgentId::new("swarm", "a");
        let message = Message::new(
            "consensus.vote",
            json!({"proposal_id": proposal, "vote": true, "reason": "looks good"}).into(),
            voter.clone(),
            vec![AgentId::system("consensus")],
        );
        let vote = ConsensusVote::from_message(&message).unwrap();
        assert_eq!(vote.proposal_id, proposal);
        assert_eq!(vote.agent_id, voter);
        assert!(vote.vote);
        assert_eq!(vote.reason.as_deref(), Some("looks good"));

        let bad = Message::new(
            "consensus.vote",
            json!({"proposal_id": proposal, "vote": "yes"}).into(),
            voter.clone(),
            vec![AgentId::system("consensus")],
        );
        assert_eq!(ConsensusVote::from_message(&bad).unwrap_err().reason(), "validation");
    }

    #[test]
    fn test_status_serialization() {
        let failed = ProposalStatus::Failed(FailureReason::DeadlineExpired);
        let json = serde_json::to_value(failed).unwrap();
        assert_eq!(json, json!({"status": "failed", "reason": "deadline_expired"}));
        assert!(failed.is_terminal());
        assert_eq!(failed.to_string(), "failed (deadline_expired)");
    }
}
