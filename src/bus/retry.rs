//! Retry scheduling with exponential backoff

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::message::Message;
use super::routing::DeliveryTarget;
use crate::config::BusConfig;
use crate::types::MessageId;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before dead-lettering, the first attempt included
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Upper bound on any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Fractional spread applied to each delay, `0.0` for none
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy from the bus retry settings
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay: config.retry_base_delay,
            multiplier: config.backoff_multiplier,
            max_delay: config.retry_max_delay,
            jitter: config.retry_jitter,
        }
    }

    /// `min(base × multiplier^(attempts-1), max)` before jitter
    pub fn nominal_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Nominal delay with symmetric jitter, still capped at `max_delay`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let nominal = self.nominal_delay(attempts);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = nominal.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Whether `attempts` failures use up the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

/// A failed delivery awaiting its next attempt
#[derive(Debug, Clone)]
pub struct RetryEntry {
    /// Message to redeliver
    pub message: Message,
    /// Where the failed delivery was headed
    pub target: DeliveryTarget,
    /// Failed attempts so far
    pub attempts: u32,
    /// Earliest time of the next attempt
    pub next_attempt: Instant,
    /// Why the last attempt failed
    pub last_error: String,
}

/// Pending retries keyed by `(message, target)`
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: HashMap<(MessageId, String), RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the retry for this message and target
    pub fn schedule(&mut self, entry: RetryEntry) {
        let key = (entry.message.id, entry.target.key());
        self.entries.insert(key, entry);
    }

    /// Whether a retry is pending for this message and target
    pub fn contains(&self, message_id: &MessageId, target: &DeliveryTarget) -> bool {
        self.entries.contains_key(&(*message_id, target.key()))
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryEntry> {
        let due_keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_attempt <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut due: Vec<_> = due_keys
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect();
        due.sort_by_key(|e| e.next_attempt);
        due
    }

    /// Drop the retry for this message and target
    pub fn cancel(&mut self, message_id: &MessageId, target: &DeliveryTarget) -> bool {
        self.entries.remove(&(*message_id, target.key())).is_some()
    }

    /// Drop every retry of a message. Returns how many were dropped.
    pub fn cancel_message(&mut self, message_id: &MessageId) -> usize {
        self.cancel_where(|e| &e.message.id == message_id)
    }

    /// Drop the retries matching `predicate`
    pub fn cancel_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&RetryEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, e| !predicate(e));
        before - self.entries.len()
    }

    pub fn get(&self, message_id: &MessageId, target: &DeliveryTarget) -> Option<&RetryEntry> {
        self.entries.get(&(*message_id, target.key()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::MessageContent;
    use crate::types::AgentId;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
        assert_eq!(p.delay_for(10), Duration::from_millis(300));
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            max_delay: Duration::from_secs(10),
            ..policy()
        };
        for _ in 0..50 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_due_and_cancel() {
        let mut queue = RetryQueue::new();
        let message = Message::new(
            "ping",
            MessageContent::text("hi"),
            AgentId::new("s", "a"),
            vec![AgentId::new("s", "b")],
        );
        let now = Instant::now();
        for (i, name) in ["b", "c"].iter().enumerate() {
            queue.schedule(RetryEntry {
                message: message.clone(),
                target: DeliveryTarget::Agent(AgentId::new("s", *name)),
                attempts: 1,
                next_attempt: now + Duration::from_secs(i as u64),
                last_error: "offline".into(),
            });
        }
        assert_eq!(queue.len(), 2);

        let due = queue.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.cancel_message(&message.id), 1);
        assert!(queue.is_empty());
    }
}
