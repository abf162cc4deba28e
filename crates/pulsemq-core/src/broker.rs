//! Broker - queue registry and protocol entry points
//!
//! The Broker maps queue names to running [`MessageQueue`]s and exposes the
//! `handle_*` operations the connection layer calls for each decoded frame.
//! The registry lock only guards the map; no queue lock is ever taken while
//! holding it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use pulsemq_storage::SnapshotStore;
use pulsemq_types::{validate_queue_name, ConsumerId, Error, ErrorMode, Message, MessageId, QueueConfig, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::consumer::OutboundSender;
use crate::queue::{DeadLetter, MessageQueue};

/// Main message broker
pub struct Broker {
    queues: RwLock<HashMap<String, Arc<MessageQueue>>>,
    mode: ErrorMode,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    dead_letter_tx: mpsc::UnboundedSender<DeadLetter>,
    dead_letter_rx: Mutex<Option<mpsc::UnboundedReceiver<DeadLetter>>>,
}

impl Broker {
    /// Create a broker without persistence
    pub fn new(mode: ErrorMode) -> Self {
        info!(mode = ?mode, "Initializing PulseMQ broker");
        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();
        Self {
            queues: RwLock::new(HashMap::new()),
            mode,
            clock: Arc::new(SystemClock),
            store: None,
            dead_letter_tx,
            dead_letter_rx: Mutex::new(Some(dead_letter_rx)),
        }
    }

    /// Snapshot every queue created from now on into `store`
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.mode
    }

    fn reject(&self, err: Error) -> Result<()> {
        debug!(error = %err, mode = ?self.mode, "Invalid registry operation");
        self.mode.check(err)
    }

    // ==================== Queue Operations ====================

    /// Build a queue wired to this broker's clock, store and dead-letter
    /// forwarding. The queue is neither restored nor started.
    pub fn build_queue(&self, name: impl Into<String>, config: QueueConfig) -> Result<MessageQueue> {
        let name = name.into();
        validate_queue_name(&name)?;

        let mut queue = MessageQueue::new(name, config, self.mode).with_clock(Arc::clone(&self.clock));
        if let Some(store) = &self.store {
            queue = queue.with_store(Arc::clone(store));
        }
        queue.set_dead_letter_sink(self.dead_letter_tx.clone());
        Ok(queue)
    }

    /// Create, restore and start a queue, then register it.
    ///
    /// In lenient mode creating an existing queue returns the existing one.
    pub async fn create_queue(&self, name: impl Into<String>, config: QueueConfig) -> Result<Arc<MessageQueue>> {
        let name = name.into();
        if let Some(existing) = self.queues.read().get(&name).cloned() {
            self.reject(Error::QueueAlreadyExists(name))?;
            return Ok(existing);
        }

        let queue = Arc::new(self.build_queue(name.clone(), config)?);
        let restored = queue.restore().await?;

        // Somebody may have won the race while restoring
        let raced = {
            let mut queues = self.queues.write();
            match queues.get(&name) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    queues.insert(name.clone(), Arc::clone(&queue));
                    None
                }
            }
        };
        if let Some(existing) = raced {
            queue.stop().await;
            self.reject(Error::QueueAlreadyExists(name))?;
            return Ok(existing);
        }

        queue.start();
        info!(queue = %name, restored, "Queue created");
        Ok(queue)
    }

    /// Register a queue built elsewhere. Duplicates follow the error mode.
    pub fn add_queue(&self, queue: Arc<MessageQueue>) -> Result<()> {
        validate_queue_name(queue.name())?;
        {
            let mut queues = self.queues.write();
            if !queues.contains_key(queue.name()) {
                queue.set_dead_letter_sink(self.dead_letter_tx.clone());
                queues.insert(queue.name().to_string(), queue);
                return Ok(());
            }
        }
        self.reject(Error::QueueAlreadyExists(queue.name().to_string()))
    }

    /// Unregister a queue and stop it (final snapshot included).
    pub async fn remove_queue(&self, name: &str) -> Result<()> {
        let removed = self.queues.write().remove(name);
        match removed {
            Some(queue) => {
                queue.stop().await;
                info!(queue = %name, "Queue removed");
                Ok(())
            }
            None => self.reject(Error::QueueNotFound(name.to_string())),
        }
    }

    /// Get a queue by name
    pub fn get_queue(&self, name: &str) -> Result<Arc<MessageQueue>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    /// All queues, sorted by name
    pub fn list_queues(&self) -> Vec<Arc<MessageQueue>> {
        let mut queues: Vec<_> = self.queues.read().values().cloned().collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    /// Stop every queue. Queues stay registered but inert.
    pub async fn stop_all(&self) {
        let queues = self.list_queues();
        info!(queues = queues.len(), "Stopping all queues");
        for queue in queues {
            queue.stop().await;
        }
    }

    // ==================== Protocol Entry Points ====================

    /// Register a consumer, generating an id when the client sent none.
    ///
    /// A lenient duplicate returns the id without attaching `sender`; the
    /// session stays with the connection that holds it.
    pub fn handle_register(
        &self,
        queue: &str,
        consumer_id: Option<ConsumerId>,
        sender: OutboundSender,
    ) -> Result<ConsumerId> {
        let queue = self.get_queue(queue)?;
        let id = consumer_id.unwrap_or_else(ConsumerId::generate);
        queue.register_consumer(id.clone(), sender)?;
        Ok(id)
    }

    /// Whether `consumer` on `queue` receives its deliveries through `sender`
    pub fn is_attached(&self, queue: &str, consumer: &ConsumerId, sender: &OutboundSender) -> bool {
        self.get_queue(queue)
            .is_ok_and(|q| q.is_attached(consumer, sender))
    }

    pub fn handle_publish(&self, queue: &str, payload: Bytes, message_id: Option<MessageId>) -> Result<MessageId> {
        let queue = self.get_queue(queue)?;
        let message = match message_id {
            Some(id) => Message::with_id(id, payload),
            None => Message::new(payload),
        };
        queue.publish(message)
    }

    pub fn handle_ack(&self, queue: &str, consumer: &ConsumerId, message_id: &MessageId) -> Result<()> {
        self.get_queue(queue)?.ack(consumer, message_id)
    }

    pub fn handle_ping(&self, queue: &str, consumer: &ConsumerId) -> Result<()> {
        self.get_queue(queue)?.ping(consumer)
    }

    /// The connection that registered `consumer` through `sender` closed
    pub fn handle_disconnect(&self, queue: &str, consumer: &ConsumerId, sender: &OutboundSender) {
        if let Ok(queue) = self.get_queue(queue) {
            queue.detach_consumer(consumer, sender);
        }
    }

    // ==================== Maintenance ====================

    /// Start forwarding dead letters into each queue's configured
    /// dead-letter queue. Only the first call has an effect.
    pub fn start_maintenance(self: &Arc<Self>) {
        let Some(mut rx) = self.dead_letter_rx.lock().take() else {
            return;
        };
        let broker: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(letter) = rx.recv().await {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                broker.forward_dead_letter(letter);
            }
            debug!("Dead-letter forwarder exited");
        });

        info!("Background maintenance started");
    }

    fn forward_dead_letter(&self, letter: DeadLetter) {
        let Ok(source) = self.get_queue(&letter.queue) else {
            return;
        };
        let Some(target) = source.config().dead_letter_queue.clone() else {
            return;
        };
        if target == letter.queue {
            warn!(queue = %letter.queue, "Dead-letter queue points at itself, dropping");
            return;
        }

        let result = self
            .get_queue(&target)
            .and_then(|dlq| dlq.publish(Message::new(letter.message.payload.clone())));
        match result {
            Ok(id) => debug!(
                queue = %letter.queue,
                dead_letter_queue = %target,
                message_id = %letter.message.id,
                forwarded_id = %id,
                "Dead letter forwarded"
            ),
            Err(e) => warn!(
                queue = %letter.queue,
                dead_letter_queue = %target,
                message_id = %letter.message.id,
                error = %e,
                "Failed to forward dead letter"
            ),
        }
    }
}
