//! Queue types for PulseMQ
//!
//! Defines queue configuration, delivery and error modes, and statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{Error, Result};

/// Longest accepted queue name
pub const MAX_QUEUE_NAME_LEN: usize = 128;

/// How a queue spreads messages over its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    /// Each message goes to exactly one consumer, in rotation
    #[default]
    #[serde(alias = "ROUNDROBIN", alias = "round_robin")]
    RoundRobin,
    /// Each message goes to every consumer with capacity
    #[serde(alias = "fanout")]
    Fanout,
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("ROUND_ROBIN"),
            Self::Fanout => f.write_str("FANOUT"),
        }
    }
}

/// How invalid operations (unknown ack, duplicate register, unknown
/// unregister) are reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Invalid operations return an error
    Strict,
    /// Invalid operations are silent no-ops
    #[default]
    Lenient,
}

impl ErrorMode {
    /// Surface `err` in strict mode, swallow it in lenient mode.
    pub fn check(self, err: Error) -> Result<()> {
        match self {
            Self::Strict => Err(err),
            Self::Lenient => Ok(()),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueueConfig {
    /// Outstanding deliveries a consumer may hold before it is skipped
    #[serde(default = "default_max_unacked")]
    pub max_unacked: usize,

    /// Seconds a delivery may stay unacknowledged before it times out
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    /// Seconds between two ack-timeout sweeps
    #[serde(default = "default_time_between_acks")]
    pub time_between_acks_secs: u64,

    /// Round-robin or fanout
    #[serde(default)]
    pub delivery_method: DeliveryMethod,

    /// Redeliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Errors a consumer may cause within the error window
    #[serde(default = "default_consumer_error_threshold")]
    pub consumer_error_threshold: u32,

    /// Error window, and the reconnect delay handed to a consumer in backoff
    #[serde(default = "default_consumer_error_timeout")]
    pub consumer_error_timeout_secs: u64,

    /// Seconds between scheduled snapshots (0 = only on stop)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Queue receiving dead-lettered messages (optional)
    #[serde(default)]
    pub dead_letter_queue: Option<String>,

    /// Dead letters remembered per queue for inspection
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Milliseconds the delivery loop waits when every consumer is saturated
    #[serde(default = "default_stall_backoff")]
    pub stall_backoff_ms: u64,
}

fn default_max_unacked() -> usize {
    100
}

fn default_ack_timeout() -> u64 {
    10
}

fn default_time_between_acks() -> u64 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_consumer_error_threshold() -> u32 {
    100
}

fn default_consumer_error_timeout() -> u64 {
    30
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_stall_backoff() -> u64 {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_unacked: default_max_unacked(),
            ack_timeout_secs: default_ack_timeout(),
            time_between_acks_secs: default_time_between_acks(),
            delivery_method: DeliveryMethod::default(),
            max_retries: default_max_retries(),
            consumer_error_threshold: default_consumer_error_threshold(),
            consumer_error_timeout_secs: default_consumer_error_timeout(),
            snapshot_interval_secs: default_snapshot_interval(),
            dead_letter_queue: None,
            dead_letter_capacity: default_dead_letter_capacity(),
            stall_backoff_ms: default_stall_backoff(),
        }
    }
}

impl QueueConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.time_between_acks_secs.max(1))
    }

    pub fn consumer_error_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_error_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_secs > 0).then(|| Duration::from_secs(self.snapshot_interval_secs))
    }

    pub fn stall_backoff(&self) -> Duration {
        Duration::from_millis(self.stall_backoff_ms.max(1))
    }
}

/// Reject names that cannot double as a snapshot file name.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidQueueName(name.to_string()))
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    /// Messages waiting for delivery
    pub pending_count: u64,

    /// Deliveries awaiting an ack (one per fanout copy)
    pub unacked_count: u64,

    /// Registered consumers
    pub consumer_count: u64,

    /// Consumers currently eligible for delivery
    pub active_consumer_count: u64,

    /// Messages accepted by publish since start
    pub published_total: u64,

    /// Deliveries handed to consumers, redeliveries included
    pub delivered_total: u64,

    /// Successful acks
    pub acked_total: u64,

    /// Timeout-driven redeliveries
    pub redelivered_total: u64,

    /// Messages whose retry budget ran out
    pub dead_lettered_total: u64,
}
