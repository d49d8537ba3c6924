//! Configuration for the coordination core
//!
//! Every section deserializes with defaults, so a partial JSON document such as
//! `{"bus": {"retry_attempts": 5}}` is a valid configuration. Durations use
//! humantime strings (`"250ms"`, `"30s"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Message bus
    pub bus: BusConfig,
    /// Consensus engine
    pub consensus: ConsensusConfig,
    /// Task orchestrator
    pub orchestrator: OrchestratorConfig,
}

impl CoreConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(raw: &str) -> CoreResult<Self> {
        let config: CoreConfig = serde_json::from_str(raw)
            .map_err(|e| CoreError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Check every section
    pub fn validate(&self) -> CoreResult<()> {
        self.bus.validate()?;
        self.consensus.validate()?;
        self.orchestrator.validate()
    }
}

/// Message bus options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum serialized content size in bytes
    pub max_message_size: usize,
    /// Default capacity for queues created without an explicit bound
    pub max_queue_size: usize,
    /// How long undelivered/unacknowledged messages are retained
    #[serde(with = "humantime_serde")]
    pub message_retention: Duration,
    /// Time a receiver has to acknowledge before redelivery
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Failed attempts (the first delivery included) before dead-lettering
    pub retry_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Upper bound on any retry delay
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Growth factor between retries
    pub backoff_multiplier: f64,
    /// Fractional jitter applied to every backoff delay, 0.0 disables it
    pub retry_jitter: f64,
    /// Period of the retry and acknowledgement sweep
    #[serde(with = "humantime_serde")]
    pub retry_sweep_interval: Duration,
    /// Priority and delay queues honor their ordering; off serves insertion order
    pub enable_ordering: bool,
    /// Track acknowledgements and retry failed deliveries
    pub enable_reliability: bool,
    /// Keep fully acknowledged messages until `message_retention` runs out
    pub enable_persistence: bool,
    /// Apply channel filters and subscription filters
    pub enable_filtering: bool,
    /// Bus-wide dead-letter queue, created on startup
    pub dead_letter_queue: String,
    /// Buffered deliveries per agent inbox
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            max_queue_size: 10_000,
            message_retention: Duration::from_secs(3600),
            ack_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retry_jitter: 0.1,
            retry_sweep_interval: Duration::from_secs(5),
            enable_ordering: true,
            enable_reliability: true,
            enable_persistence: false,
            enable_filtering: true,
            dead_letter_queue: "system-dlq".to_string(),
            mailbox_capacity: 1024,
        }
    }
}

impl BusConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.max_message_size == 0 || self.max_queue_size == 0 || self.mailbox_capacity == 0 {
            return Err(CoreError::Config("bus capacities must be non-zero".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CoreError::Config("backoff_multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(CoreError::Config("retry_jitter must be within [0, 1]".into()));
        }
        if self.retry_attempts == 0 {
            return Err(CoreError::Config("retry_attempts must be at least 1".into()));
        }
        if self.dead_letter_queue.is_empty() {
            return Err(CoreError::Config("dead_letter_queue must be named".into()));
        }
        Ok(())
    }
}

/// Consensus engine options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Threshold for proposals that set none
    pub default_threshold: f64,
    /// Period of the proposal monitor
    #[serde(with = "humantime_serde")]
    pub proposal_monitor_interval: Duration,
    /// Period of the deadline check
    #[serde(with = "humantime_serde")]
    pub timeout_check_interval: Duration,
    /// Period of the metrics log
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.66,
            proposal_monitor_interval: Duration::from_secs(10),
            timeout_check_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl ConsensusConfig {
    fn validate(&self) -> CoreResult<()> {
        if !(self.default_threshold > 0.0 && self.default_threshold <= 1.0) {
            return Err(CoreError::Config("default_threshold must be within (0, 1]".into()));
        }
        Ok(())
    }
}

/// Task orchestrator options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Weighted checkpoint score a phase must reach
    pub checkpoint_failure_threshold: f64,
    /// Scores this close above the threshold go to a review vote under the consensus strategy
    pub checkpoint_review_margin: f64,
    /// How long a phase may wait for an agent
    #[serde(with = "humantime_serde")]
    pub assignment_timeout: Duration,
    /// How often a phase checks its slots
    #[serde(with = "humantime_serde")]
    pub completion_poll_interval: Duration,
    /// Deadline of a checkpoint review vote
    #[serde(with = "humantime_serde")]
    pub review_timeout: Duration,
    /// Period of the pending-task distributor
    #[serde(with = "humantime_serde")]
    pub distributor_interval: Duration,
    /// Period of the progress log
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Period of the load balancer
    #[serde(with = "humantime_serde")]
    pub balancer_interval: Duration,
    /// Load factor above which the balancer moves work
    pub load_factor_threshold: f64,
    /// Cap on agents assigned to one phase
    pub max_agents_per_phase: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkpoint_failure_threshold: 0.5,
            checkpoint_review_margin: 0.1,
            assignment_timeout: Duration::from_secs(300),
            completion_poll_interval: Duration::from_millis(500),
            review_timeout: Duration::from_secs(120),
            distributor_interval: Duration::from_secs(2),
            progress_interval: Duration::from_secs(5),
            balancer_interval: Duration::from_secs(30),
            load_factor_threshold: 0.8,
            max_agents_per_phase: 4,
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.checkpoint_failure_threshold) {
            return Err(CoreError::Config(
                "checkpoint_failure_threshold must be within [0, 1]".into(),
            ));
        }
        if self.completion_poll_interval.is_zero() {
            return Err(CoreError::Config("completion_poll_interval must be non-zero".into()));
        }
        if self.max_agents_per_phase == 0 {
            return Err(CoreError::Config("max_agents_per_phase must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{"bus": {"retry_attempts": 5, "ack_timeout": "250ms"}}"#,
        )
        .unwrap();
        assert_eq!(config.bus.retry_attempts, 5);
        assert_eq!(config.bus.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.bus.dead_letter_queue, "system-dlq");
        assert_eq!(config.consensus.default_threshold, 0.66);
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = CoreConfig::from_json_str(r#"{"consensus": {"default_threshold": 1.5}}"#)
            .unwrap_err();
        assert_eq!(err.reason(), "config");
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let err = CoreConfig::from_json_str(r#"{"bus": {"backoff_multiplier": 0.5}}"#).unwrap_err();
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"orchestrator": {{"max_agents_per_phase": 2}}}}"#).unwrap();
        let config = CoreConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.orchestrator.max_agents_per_phase, 2);
    }
}
