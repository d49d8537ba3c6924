//! Advisory voting strategies
//!
//! A strategy looks at the votes recorded so far and suggests how an agent
//! might vote. Recommendations never cast a vote.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::proposal::{ConsensusProposal, ConsensusVote};
use crate::types::AgentId;

/// Success rate assumed for agents without a performance record
pub const DEFAULT_EXPERTISE: f64 = 0.5;

/// Advice for an agent about to vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingRecommendation {
    /// Suggested vote
    pub vote: bool,
    /// In `[0, 1]`
    pub confidence: f64,
    /// Human-readable explanation
    pub reasoning: String,
    /// Strategy that produced it
    pub strategy: String,
    /// Inputs that drove the advice
    pub factors: BTreeMap<String, f64>,
}

/// Everything a strategy may look at
pub struct RecommendationContext<'a> {
    /// Proposal under vote
    pub proposal: &'a ConsensusProposal,
    /// Votes cast so far
    pub votes: &'a [ConsensusVote],
    /// Size of the electorate
    pub eligible_voters: usize,
    /// Agent asking for advice
    pub agent_id: &'a AgentId,
    /// Its agent type
    pub agent_type: &'a str,
    /// Success rate per agent, for voters and the asking agent
    pub expertise: &'a HashMap<AgentId, f64>,
}

impl RecommendationContext<'_> {
    fn positive_ratio(&self) -> f64 {
        if self.votes.is_empty() {
            return 0.0;
        }
        self.votes.iter().filter(|v| v.vote).count() as f64 / self.votes.len() as f64
    }

    fn participation(&self) -> f64 {
        if self.eligible_voters == 0 {
            return 0.0;
        }
        self.votes.len() as f64 / self.eligible_voters as f64
    }

    fn expertise_of(&self, agent: &AgentId) -> f64 {
        self.expertise.get(agent).copied().unwrap_or(DEFAULT_EXPERTISE)
    }
}

/// Turns the state of a vote into a recommendation
pub trait VotingStrategy: Send + Sync {
    /// Stable strategy name
    fn name(&self) -> &'static str;

    /// Ratio this strategy is designed around
    fn threshold(&self) -> f64;

    /// Recommend a vote for `ctx.agent_id`
    fn recommend(&self, ctx: &RecommendationContext<'_>) -> VotingRecommendation;
}

/// Follow the recorded ratio against `threshold`. With no votes yet, lean in favour.
fn follow_ratio(
    strategy: &dyn VotingStrategy,
    ctx: &RecommendationContext<'_>,
    ratio: f64,
    mut factors: BTreeMap<String, f64>,
) -> VotingRecommendation {
    let threshold = strategy.threshold();
    let participation = ctx.participation();
    factors.insert("ratio".into(), ratio);
    factors.insert("participation".into(), participation);
    factors.insert("threshold".into(), threshold);

    if ctx.votes.is_empty() {
        return VotingRecommendation {
            vote: true,
            confidence: 0.5,
            reasoning: format!(
                "No votes recorded yet; {} ({}) defaults to supporting '{}'",
                ctx.agent_id, ctx.agent_type, ctx.proposal.proposal.title
            ),
            strategy: strategy.name().into(),
            factors,
        };
    }

    let vote = ratio >= threshold;
    let margin = (ratio - threshold).abs();
    let confidence = ((0.5 + margin) * (0.5 + 0.5 * participation)).clamp(0.0, 1.0);
    VotingRecommendation {
        vote,
        confidence,
        reasoning: format!(
            "{:.0}% in favour with {:.0}% participation is {} the {:.0}% {} threshold",
            ratio * 100.0,
            participation * 100.0,
            if vote { "at or above" } else { "below" },
            threshold * 100.0,
            strategy.name(),
        ),
        strategy: strategy.name().into(),
        factors,
    }
}

/// More than half in favour
pub struct SimpleMajority;

impl VotingStrategy for SimpleMajority {
    fn name(&self) -> &'static str {
        "simple_majority"
    }

    fn threshold(&self) -> f64 {
        0.5
    }

    fn recommend(&self, ctx: &RecommendationContext<'_>) -> VotingRecommendation {
        follow_ratio(self, ctx, ctx.positive_ratio(), BTreeMap::new())
    }
}

/// Two thirds in favour
pub struct Supermajority;

impl VotingStrategy for Supermajority {
    fn name(&self) -> &'static str {
        "supermajority"
    }

    fn threshold(&self) -> f64 {
        0.66
    }

    fn recommend(&self, ctx: &RecommendationContext<'_>) -> VotingRecommendation {
        follow_ratio(self, ctx, ctx.positive_ratio(), BTreeMap::new())
    }
}

/// Votes count in proportion to each voter's success rate
pub struct QualifiedMajority;

impl VotingStrategy for QualifiedMajority {
    fn name(&self) -> &'static str {
        "qualified_majority"
    }

    fn threshold(&self) -> f64 {
        0.75
    }

    fn recommend(&self, ctx: &RecommendationContext<'_>) -> VotingRecommendation {
        let (weighted_yes, weighted_total) = ctx.votes.iter().fold((0.0, 0.0), |(yes, total), v| {
            let weight = ctx.expertise_of(&v.agent_id);
            (if v.vote { yes + weight } else { yes }, total + weight)
        });
        let ratio = if weighted_total > 0.0 { weighted_yes / weighted_total } else { 0.0 };

        let own = ctx.expertise_of(ctx.agent_id);
        let mut factors = BTreeMap::new();
        factors.insert("own_expertise".into(), own);
        factors.insert("weighted_support".into(), weighted_yes);

        let mut rec = follow_ratio(self, ctx, ratio, factors);
        // experienced agents are more sure of their own read
        rec.confidence = (rec.confidence * (0.75 + 0.5 * own)).clamp(0.0, 1.0);
        rec
    }
}

/// Everyone in favour
pub struct Unanimous;

impl VotingStrategy for Unanimous {
    fn name(&self) -> &'static str {
        "unanimous"
    }

    fn threshold(&self) -> f64 {
        1.0
    }

    fn recommend(&self, ctx: &RecommendationContext<'_>) -> VotingRecommendation {
        let dissent = ctx.votes.iter().filter(|v| !v.vote).count();
        let mut factors = BTreeMap::new();
        factors.insert("dissenting_votes".into(), dissent as f64);
        if dissent > 0 {
            factors.insert("ratio".into(), ctx.positive_ratio());
            return VotingRecommendation {
                vote: false,
                confidence: 1.0,
                reasoning: format!("{dissent} dissenting vote(s) already rule out unanimity"),
                strategy: self.name().into(),
                factors,
            };
        }
        follow_ratio(self, ctx, ctx.positive_ratio(), factors)
    }
}

/// The strategy with the greatest threshold not above `required`; simple
/// majority for anything lower
pub fn strategy_for(required: f64) -> Box<dyn VotingStrategy> {
    let mut candidates: Vec<Box<dyn VotingStrategy>> = vec![
        Box::new(Unanimous),
        Box::new(QualifiedMajority),
        Box::new(Supermajority),
    ];
    let position = candidates.iter().position(|s| s.threshold() <= required + f64::EPSILON);
    match position {
        Some(index) => candidates.swap_remove(index),
        None => Box::new(SimpleMajority),
    }
}
