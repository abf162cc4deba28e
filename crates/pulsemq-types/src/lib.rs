//! PulseMQ Types - Core domain types for the message broker
//!
//! This crate contains all shared types used across PulseMQ components.

pub mod error;
pub mod message;
pub mod queue;
pub mod snapshot;

// Re-export commonly used types
pub use error::{Error, Result};
pub use message::{ConsumerId, Message, MessageId};
pub use queue::{validate_queue_name, DeliveryMethod, ErrorMode, QueueConfig, QueueStats};
pub use snapshot::{QueueSnapshot, StoredEntry, SNAPSHOT_VERSION};
