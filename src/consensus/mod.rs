//! # Consensus engine
//!
//! Runs the proposal/vote lifecycle. A proposal snapshots its electorate (the
//! non-offline agents of its swarm) when it is created and stays active until
//! enough positive votes arrive, every voter has voted, or its deadline
//! passes. Each proposal concludes exactly once; later votes are rejected.
//!
//! Votes arrive either through [`ConsensusEngine::submit_vote`] or as
//! `consensus.vote` messages on the engine's bus mailbox.

/// Proposal, vote and result types
pub mod proposal;
/// Vote weighting strategies
pub mod strategy;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentDirectory, AgentStatus, PerformanceStore};
use crate::bus::{Delivery, MessageBus, MessageContent, SendOptions};
use crate::config::ConsensusConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::scheduler::{Scheduler, SingleFlight, TickFuture};
use crate::store::ProposalStore;
use crate::types::{AgentId, ProposalId};

pub use proposal::{
    ConsensusProposal, ConsensusResult, ConsensusVote, DecisionAction, FailureReason, NewProposal,
    ProposalPayload, ProposalStatus,
};
pub use strategy::{strategy_for, RecommendationContext, VotingRecommendation, VotingStrategy};

/// Message kind carrying a vote to the engine
pub const VOTE_MESSAGE: &str = "consensus.vote";
/// Message kind asking voters to vote
pub const VOTE_REQUEST_MESSAGE: &str = "consensus.vote_request";
/// Message kind announcing an outcome
pub const RESULT_MESSAGE: &str = "consensus.result";

/// Called once per concluded proposal that is linked to a task
#[async_trait]
pub trait DecisionHandler: Send + Sync {
    async fn handle_decision(
        &self,
        proposal: &ConsensusProposal,
        status: ProposalStatus,
        result: &ConsensusResult,
    ) -> CoreResult<()>;
}

/// Running totals over concluded proposals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    /// Proposals concluded
    pub total_proposals: u64,
    /// Proposals that reached their threshold
    pub achieved_consensus: u64,
    /// Proposals that did not
    pub failed_consensus: u64,
    /// Proposals still open
    pub active_proposals: u64,
    /// Mean time from creation to conclusion
    #[serde(with = "humantime_serde")]
    pub avg_voting_time: Duration,
    /// Mean share of eligible voters that voted
    pub avg_participation: f64,
}

impl ConsensusMetrics {
    fn record_conclusion(&mut self, achieved: bool, voting_time: Duration, participation: f64) {
        if achieved {
            self.achieved_consensus += 1;
        } else {
            self.failed_consensus += 1;
        }
        self.active_proposals = self.active_proposals.saturating_sub(1);
        let n = (self.achieved_consensus + self.failed_consensus) as f64;
        let prev = self.avg_voting_time.as_secs_f64();
        self.avg_voting_time = Duration::from_secs_f64(prev + (voting_time.as_secs_f64() - prev) / n);
        self.avg_participation += (participation - self.avg_participation) / n;
    }
}

struct ProposalState {
    proposal: ConsensusProposal,
    eligible: HashSet<AgentId>,
    votes: Vec<ConsensusVote>,
    status: ProposalStatus,
    /// Frozen once the proposal concludes
    final_result: Option<ConsensusResult>,
    opened_at: Instant,
    outcome: watch::Sender<ProposalStatus>,
}

impl ProposalState {
    fn tally(&self) -> ConsensusResult {
        ConsensusResult::tally(&self.votes, self.eligible.len(), self.proposal.required_threshold)
    }

    /// Conclude if `result` settles the proposal
    fn evaluate(&mut self, result: &ConsensusResult) -> Option<Conclusion> {
        if result.achieved {
            self.conclude(ProposalStatus::Achieved)
        } else if self.votes.len() >= self.eligible.len() {
            self.conclude(ProposalStatus::Failed(FailureReason::Rejected))
        } else {
            None
        }
    }

    /// Move to a terminal status. Returns `None` if already concluded.
    fn conclude(&mut self, status: ProposalStatus) -> Option<Conclusion> {
        if self.status.is_terminal() {
            return None;
        }
        let result = self.tally();
        self.status = status;
        self.final_result = Some(result);
        self.outcome.send_replace(status);
        Some(Conclusion {
            proposal: self.proposal.clone(),
            voters: self.eligible.iter().cloned().collect(),
            status,
            result,
            voting_time: self.opened_at.elapsed(),
        })
    }
}

/// Side effects of a terminal transition, applied after the proposal lock is released
struct Conclusion {
    proposal: ConsensusProposal,
    voters: Vec<AgentId>,
    status: ProposalStatus,
    result: ConsensusResult,
    voting_time: Duration,
}

type SharedState = Arc<Mutex<ProposalState>>;

enum VoteOutcome {
    Recorded(ConsensusResult, Option<Conclusion>),
    Rejected(CoreError),
    PastDeadline,
}

/// Runs proposals to a weighted decision over the message bus
pub struct ConsensusEngine {
    identity: AgentId,
    config: ConsensusConfig,
    bus: Arc<MessageBus>,
    events: EventBus,
    directory: Arc<dyn AgentDirectory>,
    performance: Arc<dyn PerformanceStore>,
    store: Arc<dyn ProposalStore>,
    proposals: RwLock<HashMap<ProposalId, SharedState>>,
    metrics: Mutex<ConsensusMetrics>,
    handler: RwLock<Option<Weak<dyn DecisionHandler>>>,
    monitor_flight: SingleFlight,
    scheduler: Scheduler,
}

impl ConsensusEngine {
    /// Create an engine. Call [`ConsensusEngine::start`] to begin the background loops.
    pub fn new(
        config: ConsensusConfig,
        bus: Arc<MessageBus>,
        directory: Arc<dyn AgentDirectory>,
        performance: Arc<dyn PerformanceStore>,
        store: Arc<dyn ProposalStore>,
    ) -> Arc<Self> {
        let events = bus.events().clone();
        Arc::new(Self {
            identity: AgentId::system("consensus"),
            scheduler: Scheduler::new("consensus", events.clone()),
            config,
            bus,
            events,
            directory,
            performance,
            store,
            proposals: RwLock::new(HashMap::new()),
            metrics: Mutex::new(ConsensusMetrics::default()),
            handler: RwLock::new(None),
            monitor_flight: SingleFlight::new(),
        })
    }

    /// Bus address votes should be sent to
    pub fn identity(&self) -> &AgentId {
        &self.identity
    }

    /// Register the hook invoked when a task-linked proposal concludes
    pub fn set_decision_handler(&self, handler: Weak<dyn DecisionHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn state(&self, id: &ProposalId) -> CoreResult<SharedState> {
        self.proposals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::proposal_not_found(id))
    }

    /// Open a proposal and ask its electorate to vote
    #[instrument(skip(self, new), fields(swarm_id = %new.swarm_id))]
    pub async fn create_proposal(self: &Arc<Self>, new: NewProposal) -> CoreResult<ProposalId> {
        let threshold = new.required_threshold.unwrap_or(self.config.default_threshold);
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(CoreError::ConsensusRejected(format!(
                "required threshold {threshold} is outside (0, 1]"
            )));
        }
        if new.deadline.is_some_and(|d| d <= Utc::now()) {
            return Err(CoreError::Validation("proposal deadline is already in the past".into()));
        }

        let eligible: HashSet<AgentId> = self
            .directory
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.id.namespace == new.swarm_id && a.status != AgentStatus::Offline)
            .map(|a| a.id)
            .collect();

        let proposal = ConsensusProposal {
            id: ProposalId::new(),
            swarm_id: new.swarm_id,
            proposal: new.proposal,
            required_threshold: threshold,
            deadline: new.deadline,
            task_id: new.task_id,
            created_at: Utc::now(),
        };
        let id = proposal.id;
        self.store.save_proposal(&proposal).await?;

        let (outcome, _) = watch::channel(ProposalStatus::Active);
        let state = Arc::new(Mutex::new(ProposalState {
            proposal: proposal.clone(),
            eligible: eligible.clone(),
            votes: Vec::new(),
            status: ProposalStatus::Active,
            final_result: None,
            opened_at: Instant::now(),
            outcome,
        }));
        self.proposals.write().insert(id, Arc::clone(&state));
        {
            let mut metrics = self.metrics.lock();
            metrics.total_proposals += 1;
            metrics.active_proposals += 1;
        }

        info!(proposal_id = %id, voters = eligible.len(), threshold, "Proposal created");
        self.events.publish(CoreEvent::ProposalCreated {
            proposal_id: id,
            swarm_id: proposal.swarm_id.clone(),
            eligible_voters: eligible.len(),
        });

        if eligible.is_empty() {
            warn!(proposal_id = %id, "No eligible voters, failing proposal");
            let conclusion = state.lock().conclude(ProposalStatus::Failed(FailureReason::NoEligibleVoters));
            if let Some(conclusion) = conclusion {
                self.apply_conclusion(conclusion).await;
            }
            return Ok(id);
        }

        self.request_votes(&proposal, eligible.into_iter().collect());
        if let Some(deadline) = proposal.deadline {
            self.schedule_deadline(id, deadline);
        }
        Ok(id)
    }

    fn request_votes(&self, proposal: &ConsensusProposal, mut voters: Vec<AgentId>) {
        voters.sort();
        let content = MessageContent::Json(json!({
            "proposal_id": proposal.id,
            "title": proposal.proposal.title,
            "action": proposal.proposal.action,
            "required_threshold": proposal.required_threshold,
            "deadline": proposal.deadline,
            "reply_to": self.identity,
        }));
        if let Err(e) = self.bus.send_message(
            VOTE_REQUEST_MESSAGE,
            content,
            self.identity.clone(),
            voters,
            SendOptions::default(),
        ) {
            error!(proposal_id = %proposal.id, error = %e, "Failed to request votes");
        }
    }

    fn schedule_deadline(self: &Arc<Self>, id: ProposalId, deadline: DateTime<Utc>) {
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        let weak = Arc::downgrade(self);
        self.scheduler.spawn_task("deadline-check", async move {
            tokio::time::sleep(wait).await;
            if let Some(engine) = weak.upgrade() {
                engine.conclude_expired(id).await;
            }
        });
    }

    async fn conclude_expired(&self, id: ProposalId) -> bool {
        let Ok(state) = self.state(&id) else {
            return false;
        };
        let conclusion = state.lock().conclude(ProposalStatus::Failed(FailureReason::DeadlineExpired));
        match conclusion {
            Some(conclusion) => {
                info!(proposal_id = %id, "Proposal deadline expired");
                self.apply_conclusion(conclusion).await;
                true
            }
            None => false,
        }
    }

    /// Record a vote and re-evaluate the proposal
    #[instrument(skip(self, vote), fields(proposal_id = %vote.proposal_id, agent_id = %vote.agent_id))]
    pub async fn submit_vote(&self, vote: ConsensusVote) -> CoreResult<ConsensusResult> {
        let state = self.state(&vote.proposal_id)?;
        let recorded = Self::record_vote(&mut state.lock(), &vote);
        let (result, conclusion) = match recorded {
            VoteOutcome::Recorded(result, conclusion) => (result, conclusion),
            VoteOutcome::Rejected(err) => return Err(err),
            VoteOutcome::PastDeadline => {
                self.conclude_expired(vote.proposal_id).await;
                return Err(CoreError::ConsensusRejected(format!(
                    "deadline of proposal {} has passed",
                    vote.proposal_id
                )));
            }
        };

        debug!(vote = vote.vote, ratio = result.final_ratio, "Vote recorded");
        self.events.publish(CoreEvent::VoteSubmitted {
            proposal_id: vote.proposal_id,
            agent_id: vote.agent_id,
            vote: vote.vote,
        });
        if let Some(conclusion) = conclusion {
            self.apply_conclusion(conclusion).await;
        }
        Ok(result)
    }

    fn record_vote(s: &mut ProposalState, vote: &ConsensusVote) -> VoteOutcome {
        if s.status.is_terminal() {
            return VoteOutcome::Rejected(CoreError::ConsensusRejected(format!(
                "proposal {} is already {}",
                vote.proposal_id, s.status
            )));
        }
        if s.proposal.is_past_deadline(Utc::now()) {
            return VoteOutcome::PastDeadline;
        }
        if !s.eligible.contains(&vote.agent_id) {
            return VoteOutcome::Rejected(CoreError::AccessDenied(format!(
                "{} is not eligible to vote on {}",
                vote.agent_id, vote.proposal_id
            )));
        }
        if s.votes.iter().any(|v| v.agent_id == vote.agent_id) {
            return VoteOutcome::Rejected(CoreError::Validation(format!(
                "{} already voted on {}",
                vote.agent_id, vote.proposal_id
            )));
        }
        s.votes.push(vote.clone());
        let result = s.tally();
        VoteOutcome::Recorded(result, s.evaluate(&result))
    }

    /// Parse and submit a vote that arrived over the bus
    pub async fn handle_vote_message(&self, message: &crate::bus::Message) -> CoreResult<ConsensusResult> {
        let vote = ConsensusVote::from_message(message)?;
        self.submit_vote(vote).await
    }

    /// Current tally, or the frozen one for a concluded proposal
    pub fn check_consensus(&self, id: ProposalId) -> CoreResult<ConsensusResult> {
        let state = self.state(&id)?;
        let s = state.lock();
        Ok(s.final_result.unwrap_or_else(|| s.tally()))
    }

    /// Current status of a proposal
    pub fn get_proposal_status(&self, id: ProposalId) -> CoreResult<ProposalStatus> {
        Ok(self.state(&id)?.lock().status)
    }

    /// The proposal as submitted
    pub fn proposal(&self, id: ProposalId) -> CoreResult<ConsensusProposal> {
        Ok(self.state(&id)?.lock().proposal.clone())
    }

    /// Wait until the proposal concludes
    pub async fn wait_for_outcome(&self, id: ProposalId, timeout: Duration) -> CoreResult<ProposalStatus> {
        let mut rx = self.state(&id)?.lock().outcome.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_terminal()).await.map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(CoreError::Cancelled(format!("proposal {id} was dropped"))),
            Err(_) => Err(CoreError::Timeout(format!("proposal {id} undecided after {timeout:?}"))),
        }
    }

    /// Advisory recommendation for `agent_id`, using the strategy matching the
    /// proposal's threshold
    pub async fn get_voting_recommendation(
        &self,
        id: ProposalId,
        agent_id: &AgentId,
        agent_type: &str,
    ) -> CoreResult<VotingRecommendation> {
        let (proposal, votes, eligible) = {
            let state = self.state(&id)?;
            let s = state.lock();
            (s.proposal.clone(), s.votes.clone(), s.eligible.len())
        };

        let mut expertise = HashMap::new();
        for agent in votes.iter().map(|v| &v.agent_id).chain(std::iter::once(agent_id)) {
            if let Some(rate) = self.performance.success_rate(agent).await? {
                expertise.insert(agent.clone(), rate);
            }
        }

        let strategy = strategy_for(proposal.required_threshold);
        Ok(strategy.recommend(&RecommendationContext {
            proposal: &proposal,
            votes: &votes,
            eligible_voters: eligible,
            agent_id,
            agent_type,
            expertise: &expertise,
        }))
    }

    /// Fail every active proposal whose deadline is at or before `now`
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ProposalId> {
        let overdue: Vec<ProposalId> = self
            .proposals
            .read()
            .iter()
            .filter(|(_, s)| {
                let s = s.lock();
                !s.status.is_terminal() && s.proposal.is_past_deadline(now)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::new();
        for id in overdue {
            if self.conclude_expired(id).await {
                expired.push(id);
            }
        }
        expired
    }

    /// Ids of proposals still collecting votes
    pub fn active_proposals(&self) -> Vec<ProposalId> {
        self.proposals
            .read()
            .iter()
            .filter(|(_, s)| !s.lock().status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot of the running totals
    pub fn metrics(&self) -> ConsensusMetrics {
        self.metrics.lock().clone()
    }

    async fn apply_conclusion(&self, c: Conclusion) {
        let id = c.proposal.id;
        let achieved = c.status == ProposalStatus::Achieved;
        self.metrics
            .lock()
            .record_conclusion(achieved, c.voting_time, c.result.participation_rate);

        if let Err(e) = self.store.update_proposal_status(id, c.status).await {
            let err = CoreError::from(e);
            error!(proposal_id = %id, error = %err, "Failed to persist proposal status");
            self.events.publish(CoreEvent::error("consensus", &err));
        }

        if !c.voters.is_empty() {
            let content = MessageContent::Json(json!({
                "proposal_id": id,
                "status": c.status,
                "result": c.result,
            }));
            if let Err(e) = self.bus.send_message(
                RESULT_MESSAGE,
                content,
                self.identity.clone(),
                c.voters,
                SendOptions::best_effort(),
            ) {
                warn!(proposal_id = %id, error = %e, "Failed to announce consensus result");
            }
        }

        match c.status {
            ProposalStatus::Achieved => {
                info!(proposal_id = %id, ratio = c.result.final_ratio, "Consensus achieved");
                self.events.publish(CoreEvent::ConsensusAchieved {
                    proposal_id: id,
                    final_ratio: c.result.final_ratio,
                });
            }
            ProposalStatus::Failed(reason) => {
                info!(proposal_id = %id, reason = reason.as_str(), ratio = c.result.final_ratio, "Consensus failed");
                self.events.publish(CoreEvent::ConsensusFailed {
                    proposal_id: id,
                    final_ratio: c.result.final_ratio,
                    reason: reason.as_str().to_string(),
                });
            }
            ProposalStatus::Active => {}
        }

        if c.proposal.task_id.is_none() {
            return;
        }
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            if let Err(e) = handler.handle_decision(&c.proposal, c.status, &c.result).await {
                error!(proposal_id = %id, error = %e, "Decision handler failed");
                self.events.publish(CoreEvent::error("consensus:decision", &e));
            }
        }
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let message = delivery.message;
        if message.kind == VOTE_MESSAGE {
            if let Err(e) = self.handle_vote_message(&message).await {
                warn!(message_id = %message.id, sender = %message.sender, error = %e, "Rejected vote message");
            }
        } else {
            debug!(kind = %message.kind, "Ignoring message");
        }
        if let Err(e) = self.bus.acknowledge_message(message.id, &self.identity) {
            debug!(message_id = %message.id, error = %e, "Acknowledgement not recorded");
        }
    }

    /// Re-tally every active proposal and report voters that went offline
    /// before voting
    async fn monitor_proposals(&self) -> CoreResult<()> {
        let Some(_permit) = self.monitor_flight.try_begin() else {
            return Ok(());
        };
        let offline: HashSet<AgentId> = self
            .directory
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Offline)
            .map(|a| a.id)
            .collect();

        let states: Vec<SharedState> = self.proposals.read().values().cloned().collect();
        let mut conclusions = Vec::new();
        let mut active = 0;
        for state in states {
            let mut s = state.lock();
            if s.status.is_terminal() {
                continue;
            }
            let missing = s
                .eligible
                .iter()
                .filter(|a| offline.contains(*a) && !s.votes.iter().any(|v| &v.agent_id == *a))
                .count();
            if missing > 0 {
                warn!(proposal_id = %s.proposal.id, missing, "Eligible voters went offline before voting");
            }
            let result = s.tally();
            match s.evaluate(&result) {
                Some(conclusion) => conclusions.push(conclusion),
                None => active += 1,
            }
        }
        for conclusion in conclusions {
            self.apply_conclusion(conclusion).await;
        }
        debug!(active, "Proposal monitor tick");
        Ok(())
    }

    /// Start the vote intake and background loops
    pub fn start(self: &Arc<Self>) {
        let mut mailbox = self.bus.connect(self.identity.clone());
        let weak = Arc::downgrade(self);
        self.scheduler.spawn_task("vote-intake", async move {
            while let Some(delivery) = mailbox.recv().await {
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.process_delivery(delivery).await;
            }
        });

        let weak = Arc::downgrade(self);
        self.scheduler
            .spawn_loop("proposal-monitor", self.config.proposal_monitor_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(engine) => engine.monitor_proposals().await,
                        None => Ok(()),
                    }
                })
            });

        let weak = Arc::downgrade(self);
        self.scheduler
            .spawn_loop("timeout-checker", self.config.timeout_check_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        let expired = engine.expire_overdue(Utc::now()).await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "Expired overdue proposals");
                        }
                    }
                    Ok(())
                })
            });

        let weak = Arc::downgrade(self);
        self.scheduler
            .spawn_loop("metrics-collector", self.config.metrics_interval, move || -> TickFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        let m = engine.metrics();
                        info!(
                            total = m.total_proposals,
                            achieved = m.achieved_consensus,
                            failed = m.failed_consensus,
                            active = m.active_proposals,
                            avg_voting_time = ?m.avg_voting_time,
                            avg_participation = m.avg_participation,
                            "Consensus metrics"
                        );
                    }
                    Ok(())
                })
            });

        info!("Consensus engine started");
    }

    /// Leave the bus and stop the background loops
    pub async fn shutdown(&self) {
        self.bus.disconnect(&self.identity);
        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInfo, InMemoryAgentDirectory, InMemoryPerformanceStore};
    use crate::config::BusConfig;
    use crate::store::InMemoryProposalStore;
    use crate::types::TaskId;

    struct Harness {
        engine: Arc<ConsensusEngine>,
        bus: Arc<MessageBus>,
        directory: Arc<InMemoryAgentDirectory>,
        performance: Arc<InMemoryPerformanceStore>,
        store: Arc<InMemoryProposalStore>,
        voters: Vec<AgentId>,
    }

    fn harness(voters: usize) -> Harness {
        let bus = MessageBus::new(BusConfig::default(), EventBus::default());
        let directory = Arc::new(InMemoryAgentDirectory::new());
        let voters: Vec<_> = (0..voters).map(|i| AgentId::new("swarm", format!("v{i}"))).collect();
        for v in &voters {
            directory.register(AgentInfo::new(v.clone(), "coder"));
        }
        directory.register(AgentInfo::new(AgentId::new("other", "outsider"), "coder"));
        let performance = Arc::new(InMemoryPerformanceStore::new());
        let store = Arc::new(InMemoryProposalStore::new());
        let engine = ConsensusEngine::new(
            ConsensusConfig::default(),
            Arc::clone(&bus),
            directory.clone(),
            performance.clone(),
            store.clone(),
        );
        Harness {
            engine,
            bus,
            directory,
            performance,
            store,
            voters,
        }
    }

    fn payload() -> ProposalPayload {
        ProposalPayload::new("ship the release", DecisionAction::ApproveTask)
    }

    #[tokio::test]
    async fn test_two_of_three_achieves_two_thirds_threshold() {
        let h = harness(3);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload()).threshold(0.66)).await.unwrap();

        let r = h.engine.submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true)).await.unwrap();
        assert!(!r.achieved);
        assert_eq!(h.engine.get_proposal_status(id).unwrap(), ProposalStatus::Active);

        let r = h.engine.submit_vote(ConsensusVote::new(id, h.voters[1].clone(), true)).await.unwrap();
        assert!(r.achieved);
        assert_eq!(h.engine.get_proposal_status(id).unwrap(), ProposalStatus::Achieved);
        assert_eq!(h.store.proposal_status(id).await.unwrap(), Some(ProposalStatus::Achieved));
    }

    #[tokio::test]
    async fn test_all_votes_without_majority_fails() {
        let h = harness(3);
        let mut events = h.bus.events().subscribe();
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload()).threshold(0.66)).await.unwrap();
        for (voter, vote) in h.voters.iter().zip([true, false, false]) {
            h.engine.submit_vote(ConsensusVote::new(id, voter.clone(), vote)).await.unwrap();
        }
        assert_eq!(
            h.engine.get_proposal_status(id).unwrap(),
            ProposalStatus::Failed(FailureReason::Rejected)
        );
        let metrics = h.engine.metrics();
        assert_eq!(metrics.total_proposals, 1);
        assert_eq!(metrics.failed_consensus, 1);
        assert_eq!(metrics.active_proposals, 0);
        assert_eq!(metrics.avg_participation, 1.0);
        assert!(events.drain().iter().any(|e| matches!(
            e,
            CoreEvent::ConsensusFailed { reason, .. } if reason == "rejected"
        )));
    }

    #[tokio::test]
    async fn test_concluded_proposal_rejects_votes_and_keeps_ratio() {
        let h = harness(3);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload()).threshold(0.5)).await.unwrap();
        h.engine.submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true)).await.unwrap();
        h.engine.submit_vote(ConsensusVote::new(id, h.voters[1].clone(), true)).await.unwrap();
        let before = h.engine.check_consensus(id).unwrap();
        assert!(before.achieved);

        let err = h
            .engine
            .submit_vote(ConsensusVote::new(id, h.voters[2].clone(), false))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "consensus_rejected");
        assert_eq!(h.engine.check_consensus(id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_ineligible_duplicate_and_unknown_votes() {
        let h = harness(3);
        h.directory.set_status(&h.voters[2], AgentStatus::Offline);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();

        let outsider = AgentId::new("other", "outsider");
        let err = h.engine.submit_vote(ConsensusVote::new(id, outsider, true)).await.unwrap_err();
        assert_eq!(err.reason(), "access_denied");
        let err = h
            .engine
            .submit_vote(ConsensusVote::new(id, h.voters[2].clone(), true))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "access_denied");

        h.engine.submit_vote(ConsensusVote::new(id, h.voters[0].clone(), false)).await.unwrap();
        let err = h
            .engine
            .submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "validation");

        let err = h
            .engine
            .submit_vote(ConsensusVote::new(ProposalId::new(), h.voters[0].clone(), true))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[tokio::test]
    async fn test_threshold_must_be_in_range() {
        let h = harness(1);
        for bad in [0.0, -0.1, 1.5] {
            let err = h
                .engine
                .create_proposal(NewProposal::new("swarm", payload()).threshold(bad))
                .await
                .unwrap_err();
            assert_eq!(err.reason(), "consensus_rejected");
        }
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_no_eligible_voters_fails_at_creation() {
        let h = harness(0);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();
        assert_eq!(
            h.engine.get_proposal_status(id).unwrap(),
            ProposalStatus::Failed(FailureReason::NoEligibleVoters)
        );
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let h = harness(2);
        let deadline = Utc::now() + chrono::Duration::minutes(10);
        let id = h
            .engine
            .create_proposal(NewProposal::new("swarm", payload()).deadline(deadline))
            .await
            .unwrap();
        let open = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();

        assert!(h.engine.expire_overdue(Utc::now()).await.is_empty());
        let expired = h.engine.expire_overdue(deadline + chrono::Duration::seconds(1)).await;
        assert_eq!(expired, vec![id]);
        assert_eq!(
            h.engine.get_proposal_status(id).unwrap(),
            ProposalStatus::Failed(FailureReason::DeadlineExpired)
        );
        assert_eq!(h.engine.active_proposals(), vec![open]);

        let err = h
            .engine
            .submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "consensus_rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_timer_concludes_proposal() {
        let h = harness(2);
        let id = h
            .engine
            .create_proposal(NewProposal::new("swarm", payload()).deadline(Utc::now() + chrono::Duration::seconds(2)))
            .await
            .unwrap();
        let status = h.engine.wait_for_outcome(id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(status, ProposalStatus::Failed(FailureReason::DeadlineExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_outcome_times_out() {
        let h = harness(2);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();
        let err = h.engine.wait_for_outcome(id, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.reason(), "timeout");
    }

    #[tokio::test]
    async fn test_votes_arrive_over_the_bus() {
        let h = harness(1);
        h.engine.start();
        let mut voter_inbox = h.bus.connect(h.voters[0].clone());
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();

        let request = voter_inbox.recv().await.unwrap().message;
        assert_eq!(request.kind, VOTE_REQUEST_MESSAGE);
        assert_eq!(request.json_field("proposal_id"), Some(&json!(id)));

        h.bus
            .send_message(
                VOTE_MESSAGE,
                json!({"proposal_id": id, "vote": true}).into(),
                h.voters[0].clone(),
                vec![h.engine.identity().clone()],
                SendOptions::default(),
            )
            .unwrap();
        let status = h.engine.wait_for_outcome(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, ProposalStatus::Achieved);

        let result = voter_inbox.recv().await.unwrap().message;
        assert_eq!(result.kind, RESULT_MESSAGE);
        h.engine.shutdown().await;
    }

    #[derive(Default)]
    struct RecordingHandler {
        decisions: Mutex<Vec<(Option<TaskId>, ProposalStatus)>>,
    }

    #[async_trait]
    impl DecisionHandler for RecordingHandler {
        async fn handle_decision(
            &self,
            proposal: &ConsensusProposal,
            status: ProposalStatus,
            _result: &ConsensusResult,
        ) -> CoreResult<()> {
            self.decisions.lock().push((proposal.task_id, status));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_decision_handler_sees_task_proposals_only() {
        let h = harness(1);
        let handler = Arc::new(RecordingHandler::default());
        let weak: Weak<dyn DecisionHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn DecisionHandler>));
        h.engine.set_decision_handler(weak);

        let task_id = TaskId::new();
        let linked = h
            .engine
            .create_proposal(NewProposal::new("swarm", payload()).for_task(task_id))
            .await
            .unwrap();
        let unlinked = h.engine.create_proposal(NewProposal::new("swarm", payload())).await.unwrap();
        for id in [linked, unlinked] {
            h.engine.submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true)).await.unwrap();
        }

        assert_eq!(*handler.decisions.lock(), vec![(Some(task_id), ProposalStatus::Achieved)]);
    }

    #[tokio::test]
    async fn test_recommendation_uses_matching_strategy() {
        let h = harness(3);
        h.performance.seed(h.voters[0].clone(), 19, 20);
        h.performance.seed(h.voters[1].clone(), 1, 20);
        let id = h.engine.create_proposal(NewProposal::new("swarm", payload()).threshold(0.75)).await.unwrap();
        h.engine.submit_vote(ConsensusVote::new(id, h.voters[0].clone(), true)).await.unwrap();
        h.engine.submit_vote(ConsensusVote::new(id, h.voters[1].clone(), false)).await.unwrap();

        let rec = h
            .engine
            .get_voting_recommendation(id, &h.voters[2], "reviewer")
            .await
            .unwrap();
        assert_eq!(rec.strategy, "qualified_majority");
        assert!(rec.vote);
    }
}
