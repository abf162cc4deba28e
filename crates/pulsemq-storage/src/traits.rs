//! Snapshot store trait definition
//!
//! Defines the interface that all persistence backends must implement.

use async_trait::async_trait;
use pulsemq_types::{QueueSnapshot, Result};

/// Snapshot store trait - all backends implement this
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Durably replace the stored snapshot of `snapshot.queue`.
    ///
    /// A failed or interrupted dump must leave the previous snapshot intact.
    async fn dump(&self, snapshot: &QueueSnapshot) -> Result<()>;

    /// Load the last snapshot of a queue, `None` if it was never dumped
    async fn load(&self, queue_name: &str) -> Result<Option<QueueSnapshot>>;

    /// Forget a queue's snapshot
    async fn remove(&self, queue_name: &str) -> Result<()>;
}
