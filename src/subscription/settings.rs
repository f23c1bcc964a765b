//! Persistent subscription group settings.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Where a new group's cursor starts.
///
/// In configuration files this is `beginning`, `current`, a bare revision
/// number, or `{ revision: N }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "StartFromRepr")]
pub enum StartFrom {
    /// First event of the stream.
    Beginning,
    /// After the stream's last event at creation time.
    #[default]
    Current,
    /// A specific revision.
    Revision(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StartFromRepr {
    Named(NamedStart),
    Revision(u64),
    Map { revision: u64 },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum NamedStart {
    Beginning,
    Current,
}

impl From<StartFromRepr> for StartFrom {
    fn from(repr: StartFromRepr) -> Self {
        match repr {
            StartFromRepr::Named(NamedStart::Beginning) => StartFrom::Beginning,
            StartFromRepr::Named(NamedStart::Current) => StartFrom::Current,
            StartFromRepr::Revision(revision) | StartFromRepr::Map { revision } => {
                StartFrom::Revision(revision)
            }
        }
    }
}

/// How events are spread across subscribers of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStrategy {
    /// Rotate across subscribers with free buffer space.
    #[default]
    RoundRobin,
    /// Always the earliest-connected subscriber with free buffer space.
    DispatchToSingle,
    /// Same source stream always goes to the same subscriber.
    Pinned,
}

impl fmt::Display for ConsumerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerStrategy::RoundRobin => write!(f, "RoundRobin"),
            ConsumerStrategy::DispatchToSingle => write!(f, "DispatchToSingle"),
            ConsumerStrategy::Pinned => write!(f, "Pinned"),
        }
    }
}

/// Delivery policy of a persistent subscription group.
///
/// Durations are given in milliseconds in configuration files
/// (`checkpoint_after_ms`, `message_timeout_ms`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Follow link events to their targets before delivery.
    pub resolve_link_tos: bool,
    /// Events buffered while catching up on history.
    pub history_buffer_size: usize,
    /// Events buffered while following the live end of the stream.
    pub live_buffer_size: usize,
    /// Events read from the stream per buffer refill.
    pub read_batch_size: usize,
    /// Minimum acks before a time-based checkpoint is written.
    pub min_checkpoint_count: usize,
    /// Acks after which a checkpoint is always written.
    pub max_checkpoint_count: usize,
    /// Interval between time-based checkpoints.
    #[serde(rename = "checkpoint_after_ms", with = "millis")]
    pub checkpoint_after: Duration,
    /// Redeliveries per event before it is parked.
    pub max_retry_count: u32,
    /// Subscribers allowed at once (0 = unbounded).
    pub max_subscriber_count: usize,
    /// Ack deadline before automatic redelivery.
    #[serde(rename = "message_timeout_ms", with = "millis")]
    pub message_timeout: Duration,
    /// Cursor start for a new group.
    pub start_from: StartFrom,
    /// Distribution across subscribers.
    pub consumer_strategy: ConsumerStrategy,
    /// Ask the store to track extra timing statistics.
    pub extra_statistics: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            history_buffer_size: 500,
            live_buffer_size: 500,
            read_batch_size: 20,
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            checkpoint_after: Duration::from_secs(2),
            max_retry_count: 10,
            max_subscriber_count: 0,
            message_timeout: Duration::from_secs(30),
            start_from: StartFrom::Current,
            consumer_strategy: ConsumerStrategy::RoundRobin,
            extra_statistics: false,
        }
    }
}

impl SubscriptionSettings {
    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn with_history_buffer_size(mut self, size: usize) -> Self {
        self.history_buffer_size = size;
        self
    }

    pub fn with_live_buffer_size(mut self, size: usize) -> Self {
        self.live_buffer_size = size;
        self
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_checkpoint_counts(mut self, min: usize, max: usize) -> Self {
        self.min_checkpoint_count = min;
        self.max_checkpoint_count = max;
        self
    }

    pub fn with_checkpoint_after(mut self, interval: Duration) -> Self {
        self.checkpoint_after = interval;
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_max_subscriber_count(mut self, count: usize) -> Self {
        self.max_subscriber_count = count;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn start_from_beginning(mut self) -> Self {
        self.start_from = StartFrom::Beginning;
        self
    }

    pub fn start_from_current(mut self) -> Self {
        self.start_from = StartFrom::Current;
        self
    }

    pub fn start_from_revision(mut self, revision: u64) -> Self {
        self.start_from = StartFrom::Revision(revision);
        self
    }

    pub fn with_consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.consumer_strategy = strategy;
        self
    }

    pub fn with_extra_statistics(mut self, enabled: bool) -> Self {
        self.extra_statistics = enabled;
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.history_buffer_size == 0 || self.live_buffer_size == 0 {
            return Err(ClientError::InvalidArgument(
                "buffer sizes must be at least 1".to_string(),
            ));
        }
        if self.read_batch_size == 0 {
            return Err(ClientError::InvalidArgument(
                "read_batch_size must be at least 1".to_string(),
            ));
        }
        if self.min_checkpoint_count > self.max_checkpoint_count {
            return Err(ClientError::InvalidArgument(format!(
                "min_checkpoint_count {} exceeds max_checkpoint_count {}",
                self.min_checkpoint_count, self.max_checkpoint_count
            )));
        }
        if self.message_timeout.is_zero() {
            return Err(ClientError::InvalidArgument(
                "message_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SubscriptionSettings::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let settings = SubscriptionSettings::default()
            .with_resolve_link_tos(false)
            .with_history_buffer_size(20)
            .with_live_buffer_size(10)
            .with_checkpoint_counts(10, 1000)
            .with_checkpoint_after(Duration::from_secs(2))
            .with_max_retry_count(500)
            .with_max_subscriber_count(5)
            .with_message_timeout(Duration::from_secs(30))
            .with_read_batch_size(500)
            .start_from_current()
            .with_consumer_strategy(ConsumerStrategy::RoundRobin);

        assert_eq!(settings.history_buffer_size, 20);
        assert_eq!(settings.live_buffer_size, 10);
        assert_eq!(settings.max_retry_count, 500);
        assert_eq!(settings.max_subscriber_count, 5);
        assert_eq!(settings.start_from, StartFrom::Current);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_inverted_checkpoint_counts_rejected() {
        let settings = SubscriptionSettings::default().with_checkpoint_counts(10, 5);
        assert!(matches!(
            settings.validate(),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let settings = SubscriptionSettings::default().with_live_buffer_size(0);
        assert!(settings.validate().is_err());

        let settings = SubscriptionSettings::default().with_read_batch_size(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
resolve_link_tos: true
message_timeout_ms: 1500
checkpoint_after_ms: 250
start_from:
  revision: 7
consumer_strategy: dispatch_to_single
"#;
        let settings: SubscriptionSettings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.resolve_link_tos);
        assert_eq!(settings.message_timeout, Duration::from_millis(1500));
        assert_eq!(settings.checkpoint_after, Duration::from_millis(250));
        assert_eq!(settings.start_from, StartFrom::Revision(7));
        assert_eq!(settings.consumer_strategy, ConsumerStrategy::DispatchToSingle);
        assert_eq!(settings.live_buffer_size, 500);
    }

    #[test]
    fn test_start_from_accepts_every_form() {
        let parse = |text: &str| serde_yaml::from_str::<StartFrom>(text).unwrap();
        assert_eq!(parse("beginning"), StartFrom::Beginning);
        assert_eq!(parse("current"), StartFrom::Current);
        assert_eq!(parse("12"), StartFrom::Revision(12));
        assert_eq!(parse("{ revision: 3 }"), StartFrom::Revision(3));
        assert!(serde_yaml::from_str::<StartFrom>("sideways").is_err());
    }

    #[test]
    fn test_strategy_display_names() {
        assert_eq!(ConsumerStrategy::RoundRobin.to_string(), "RoundRobin");
        assert_eq!(ConsumerStrategy::DispatchToSingle.to_string(), "DispatchToSingle");
        assert_eq!(ConsumerStrategy::Pinned.to_string(), "Pinned");
    }
}
