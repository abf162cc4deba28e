//! In-memory storage backend
//!
//! Fast, non-persistent snapshot storage for development and testing.
//! All data is lost when the process exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use pulsemq_types::{validate_queue_name, Error, QueueSnapshot, Result};
use tracing::{debug, info};

use crate::traits::SnapshotStore;

/// In-memory snapshot store
pub struct MemoryStore {
    /// Snapshots stored by queue name
    snapshots: DashMap<String, QueueSnapshot>,
    /// Successful dumps, for tests asserting flush behaviour
    dumps: AtomicU64,
    /// When set, every dump fails with a storage error
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        info!("Initializing in-memory snapshot storage");
        Self {
            snapshots: DashMap::new(),
            dumps: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of dumps that succeeded
    pub fn dump_count(&self) -> u64 {
        self.dumps.load(Ordering::Relaxed)
    }

    /// Simulate a broken disk
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn dump(&self, snapshot: &QueueSnapshot) -> Result<()> {
        validate_queue_name(&snapshot.queue)?;

        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Storage(format!(
                "simulated write failure for {}",
                snapshot.queue
            )));
        }

        self.snapshots
            .insert(snapshot.queue.clone(), snapshot.clone());
        self.dumps.fetch_add(1, Ordering::Relaxed);

        debug!(queue = %snapshot.queue, "Snapshot stored in memory");
        Ok(())
    }

    async fn load(&self, queue_name: &str) -> Result<Option<QueueSnapshot>> {
        validate_queue_name(queue_name)?;
        match self.snapshots.get(queue_name) {
            Some(snapshot) => {
                snapshot.ensure_supported()?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, queue_name: &str) -> Result<()> {
        self.snapshots.remove(queue_name);
        Ok(())
    }
}
