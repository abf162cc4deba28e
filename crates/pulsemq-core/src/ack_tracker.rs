//! Outstanding-delivery index for one queue.
//!
//! Entries live in a per-consumer map ordered by a delivery sequence number,
//! and a secondary `message id → consumer → sequence` index makes ack lookup
//! independent of how many consumers or entries exist.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use pulsemq_types::{ConsumerId, Message, MessageId, StoredEntry};

/// A delivery waiting for its ack
#[derive(Debug, Clone, PartialEq)]
pub struct UnackedEntry {
    pub message: Message,
    pub consumer_id: ConsumerId,
    pub delivered_at: DateTime<Utc>,
    pub attempt_count: u32,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    by_consumer: HashMap<ConsumerId, BTreeMap<u64, UnackedEntry>>,
    index: HashMap<MessageId, HashMap<ConsumerId, u64>>,
    next_seq: u64,
    len: usize,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery of `message` to `consumer`.
    ///
    /// Returns false (and records nothing) if the consumer already holds an
    /// outstanding copy of this message.
    pub fn record(&mut self, consumer: &ConsumerId, message: Message, now: DateTime<Utc>, attempt_count: u32) -> bool {
        let holders = self.index.entry(message.id).or_default();
        if holders.contains_key(consumer) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        holders.insert(consumer.clone(), seq);

        self.by_consumer.entry(consumer.clone()).or_default().insert(
            seq,
            UnackedEntry {
                message,
                consumer_id: consumer.clone(),
                delivered_at: now,
                attempt_count,
            },
        );
        self.len += 1;
        true
    }

    /// Clear an outstanding delivery. False if there was none.
    pub fn ack(&mut self, consumer: &ConsumerId, message_id: &MessageId) -> bool {
        self.take(consumer, message_id).is_some()
    }

    /// Remove and return an outstanding delivery.
    pub fn take(&mut self, consumer: &ConsumerId, message_id: &MessageId) -> Option<UnackedEntry> {
        let holders = self.index.get_mut(message_id)?;
        let seq = holders.remove(consumer)?;
        if holders.is_empty() {
            self.index.remove(message_id);
        }

        let entries = self.by_consumer.get_mut(consumer)?;
        let entry = entries.remove(&seq);
        if entries.is_empty() {
            self.by_consumer.remove(consumer);
        }

        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }

    /// Count a redelivery of an entry in place: bump its attempt count and
    /// restart its ack deadline. Returns the updated entry.
    pub fn touch(&mut self, consumer: &ConsumerId, message_id: &MessageId, now: DateTime<Utc>) -> Option<&UnackedEntry> {
        let seq = *self.index.get(message_id)?.get(consumer)?;
        let entry = self.by_consumer.get_mut(consumer)?.get_mut(&seq)?;
        entry.attempt_count += 1;
        entry.delivered_at = now;
        Some(&*entry)
    }

    /// Entries whose ack deadline has passed, oldest delivery first.
    ///
    /// Nothing is removed; the caller decides per entry.
    pub fn sweep(&self, now: DateTime<Utc>, ack_timeout: chrono::Duration) -> Vec<UnackedEntry> {
        let mut expired: Vec<(u64, &UnackedEntry)> = self
            .by_consumer
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|(_, e)| now.signed_duration_since(e.delivered_at) > ack_timeout)
            .map(|(seq, e)| (*seq, e))
            .collect();
        expired.sort_by_key(|(seq, _)| *seq);
        expired.into_iter().map(|(_, e)| e.clone()).collect()
    }

    /// Remove every entry of a consumer, in delivery order.
    pub fn drain(&mut self, consumer: &ConsumerId) -> Vec<UnackedEntry> {
        let Some(entries) = self.by_consumer.remove(consumer) else {
            return Vec::new();
        };

        let drained: Vec<UnackedEntry> = entries.into_values().collect();
        for entry in &drained {
            if let Some(holders) = self.index.get_mut(&entry.message.id) {
                holders.remove(consumer);
                if holders.is_empty() {
                    self.index.remove(&entry.message.id);
                }
            }
        }
        self.len -= drained.len();
        drained
    }

    pub fn contains(&self, consumer: &ConsumerId, message_id: &MessageId) -> bool {
        self.index
            .get(message_id)
            .is_some_and(|holders| holders.contains_key(consumer))
    }

    /// Whether any consumer holds a copy of the message
    pub fn is_outstanding(&self, message_id: &MessageId) -> bool {
        self.index.contains_key(message_id)
    }

    pub fn count(&self, consumer: &ConsumerId) -> usize {
        self.by_consumer.get(consumer).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Message ids outstanding for a consumer, in delivery order
    pub fn message_ids(&self, consumer: &ConsumerId) -> Vec<MessageId> {
        self.by_consumer
            .get(consumer)
            .map(|entries| entries.values().map(|e| e.message.id).collect())
            .unwrap_or_default()
    }

    /// Persistable copy of every outstanding entry
    pub fn to_stored(&self) -> BTreeMap<ConsumerId, Vec<StoredEntry>> {
        self.by_consumer
            .iter()
            .map(|(consumer, entries)| {
                let stored = entries
                    .values()
                    .map(|e| StoredEntry {
                        message: e.message.clone(),
                        delivered_at: e.delivered_at,
                        attempt_count: e.attempt_count,
                    })
                    .collect();
                (consumer.clone(), stored)
            })
            .collect()
    }
}
