//! Persisted queue state
//!
//! One snapshot per queue. Every field added after version 1 must carry
//! `#[serde(default)]` so older files keep loading.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{ConsumerId, Message};

/// Current on-disk format
pub const SNAPSHOT_VERSION: u32 = 1;

/// An outstanding delivery as written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub message: Message,
    pub delivered_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// Durable image of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub queue: String,
    pub taken_at: DateTime<Utc>,
    /// Pending backlog, head first
    #[serde(default)]
    pub pending: Vec<Message>,
    /// Outstanding deliveries per consumer, in delivery order
    #[serde(default)]
    pub unacked: BTreeMap<ConsumerId, Vec<StoredEntry>>,
}

impl QueueSnapshot {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            queue: queue.into(),
            taken_at: Utc::now(),
            pending: Vec::new(),
            unacked: BTreeMap::new(),
        }
    }

    /// Refuse snapshots written by a newer format.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion {
                found: self.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }

    /// Total messages referenced, counting each fanout copy once.
    pub fn message_count(&self) -> usize {
        let mut seen = HashSet::new();
        self.pending
            .iter()
            .chain(self.unacked.values().flatten().map(|e| &e.message))
            .filter(|m| seen.insert(m.id))
            .count()
    }

    /// Flatten the snapshot into a pending backlog.
    ///
    /// Deliveries that were outstanding when the snapshot was taken cannot be
    /// assumed to still belong to their consumer, so they go back in front of
    /// the old backlog, oldest delivery first. Fanout copies of one message
    /// collapse into a single pending message keeping the highest attempt
    /// count.
    pub fn into_recovered_pending(self) -> Vec<Message> {
        let mut entries: Vec<StoredEntry> = self.unacked.into_values().flatten().collect();
        entries.sort_by_key(|e| e.delivered_at);

        let mut recovered: Vec<Message> = Vec::with_capacity(entries.len() + self.pending.len());
        for entry in entries {
            match recovered.iter_mut().find(|m| m.id == entry.message.id) {
                Some(existing) => existing.attempts = existing.attempts.max(entry.attempt_count),
                None => {
                    let mut message = entry.message;
                    message.attempts = entry.attempt_count;
                    recovered.push(message);
                }
            }
        }

        let mut seen: HashSet<_> = recovered.iter().map(|m| m.id).collect();
        recovered.extend(self.pending.into_iter().filter(|m| seen.insert(m.id)));
        recovered
    }
}
