//! Error types for PulseMQ
//!
//! Defines all error types used throughout the broker.

use thiserror::Error;

/// Main error type for PulseMQ operations
#[derive(Error, Debug)]
pub enum Error {
    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue already exists
    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// Queue has been stopped and no longer accepts work
    #[error("Queue is stopped: {0}")]
    QueueStopped(String),

    /// Queue name cannot be used
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    /// No outstanding delivery matches the ack
    #[error("Message {message_id} is not outstanding for consumer {consumer_id}")]
    MessageNotFound {
        consumer_id: String,
        message_id: String,
    },

    /// Consumer not registered on the queue
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Consumer id already registered on the queue
    #[error("Consumer already registered: {0}")]
    ConsumerAlreadyRegistered(String),

    /// A message with this id is already pending or outstanding
    #[error("Message already queued: {0}")]
    MessageAlreadyQueued(String),

    /// Invalid message format
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Snapshot written by a newer broker
    #[error("Unsupported snapshot version {found} (supported up to {supported})")]
    UnsupportedSnapshotVersion { found: u32, supported: u32 },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for PulseMQ operations
pub type Result<T> = std::result::Result<T, Error>;
