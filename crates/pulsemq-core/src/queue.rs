//! The per-queue engine
//!
//! A `MessageQueue` owns its pending backlog, its consumer sessions and its
//! [`AckTracker`] behind a single lock. Three background tasks drive it once
//! started: the delivery loop, the ack-timeout sweep and the snapshot loop.
//! Every public operation is synchronous and takes the lock once; the loops
//! call the same entry points tests use (`dispatch_pending`,
//! `sweep_expired`, `dump`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulsemq_storage::SnapshotStore;
use pulsemq_types::{
    ConsumerId, DeliveryMethod, Error, ErrorMode, Message, MessageId, QueueConfig, QueueSnapshot, QueueStats, Result,
};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::ack_tracker::{AckTracker, UnackedEntry};
use crate::clock::{delta, Clock, SystemClock};
use crate::consumer::{ConsumerSession, ConsumerState, OutboundSender};
use crate::scheduler::{DeliveryScheduler, Targets};

/// A message whose retry budget ran out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub queue: String,
    pub message: Message,
    pub consumer_id: ConsumerId,
    /// Deliveries made, the first one included
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of draining the backlog as far as consumers allow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Deliveries issued, one per fanout copy
    pub delivered: usize,
    /// The head message is waiting for a consumer with capacity
    pub stalled: bool,
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub redelivered: usize,
    pub dead_lettered: usize,
    /// Consumers in backoff that never came back
    pub closed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum Step {
    Delivered(usize),
    /// Progress without a delivery: a copy dropped or a consumer evicted
    Skipped,
    Stalled,
    Idle,
}

/// Pending messages in delivery order, with an id set for membership checks
#[derive(Debug, Default)]
struct Backlog {
    messages: VecDeque<Message>,
    ids: HashSet<MessageId>,
}

impl Backlog {
    fn push_back(&mut self, message: Message) {
        self.ids.insert(message.id);
        self.messages.push_back(message);
    }

    fn push_front(&mut self, message: Message) {
        self.ids.insert(message.id);
        self.messages.push_front(message);
    }

    fn pop_front(&mut self) -> Option<Message> {
        let message = self.messages.pop_front()?;
        self.ids.remove(&message.id);
        Some(message)
    }

    fn front(&self) -> Option<&Message> {
        self.messages.front()
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

struct QueueState {
    pending: Backlog,
    consumers: HashMap<ConsumerId, ConsumerSession>,
    /// Registration order, the rotation the scheduler walks
    order: Vec<ConsumerId>,
    tracker: AckTracker,
    scheduler: DeliveryScheduler,
    dead_letters: VecDeque<DeadLetter>,
}

#[derive(Debug, Default)]
struct QueueMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

pub struct MessageQueue {
    name: String,
    config: QueueConfig,
    mode: ErrorMode,
    state: Mutex<QueueState>,
    metrics: QueueMetrics,
    running: AtomicBool,
    wakeup: Notify,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    /// Serializes dumps so an older snapshot never overwrites a newer one
    dump_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dead_letter_sink: Mutex<Option<mpsc::UnboundedSender<DeadLetter>>>,
}

impl MessageQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig, mode: ErrorMode) -> Self {
        let name = name.into();
        debug!(queue = %name, method = %config.delivery_method, max_unacked = config.max_unacked, "Creating queue");
        Self {
            state: Mutex::new(QueueState {
                pending: Backlog::default(),
                consumers: HashMap::new(),
                order: Vec::new(),
                tracker: AckTracker::new(),
                scheduler: DeliveryScheduler::new(config.delivery_method),
                dead_letters: VecDeque::new(),
            }),
            name,
            config,
            mode,
            metrics: QueueMetrics::default(),
            running: AtomicBool::new(true),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            clock: Arc::new(SystemClock),
            store: None,
            dump_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            dead_letter_sink: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Route dead letters to `sink` in addition to the in-memory ring.
    pub fn set_dead_letter_sink(&self, sink: mpsc::UnboundedSender<DeadLetter>) {
        *self.dead_letter_sink.lock() = Some(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::QueueStopped(self.name.clone()))
        }
    }

    fn reject(&self, err: Error) -> Result<()> {
        debug!(queue = %self.name, error = %err, mode = ?self.mode, "Invalid operation");
        self.mode.check(err)
    }

    // ==================== Client operations ====================

    /// Append a message to the backlog. Never waits for delivery.
    ///
    /// An id that is already pending or outstanding is refused in strict
    /// mode and ignored in lenient mode; the queued copy stays the only one.
    pub fn publish(&self, message: Message) -> Result<MessageId> {
        let id = message.id;
        let duplicate = {
            let mut state = self.state.lock();
            self.ensure_running()?;
            if state.pending.contains(&id) || state.tracker.is_outstanding(&id) {
                true
            } else {
                state.pending.push_back(message);
                false
            }
        };

        if duplicate {
            self.reject(Error::MessageAlreadyQueued(id.to_string()))?;
            return Ok(id);
        }
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %self.name, message_id = %id, "Published");
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Clear the outstanding delivery of `message_id` to `consumer`.
    pub fn ack(&self, consumer: &ConsumerId, message_id: &MessageId) -> Result<()> {
        let acked = {
            let mut state = self.state.lock();
            self.ensure_running()?;
            state.tracker.ack(consumer, message_id)
        };

        if !acked {
            return self.reject(Error::MessageNotFound {
                consumer_id: consumer.to_string(),
                message_id: message_id.to_string(),
            });
        }

        self.metrics.acked.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %self.name, consumer = %consumer, message_id = %message_id, "Acked");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Register a consumer whose deliveries go to `sender`.
    ///
    /// A consumer in backoff may register again with the same id once its
    /// reconnect delay has elapsed; earlier attempts count as duplicates.
    pub fn register_consumer(&self, id: ConsumerId, sender: OutboundSender) -> Result<()> {
        let now = self.clock.now();
        let duplicate = {
            let mut state = self.state.lock();
            self.ensure_running()?;

            match state.consumers.get_mut(&id) {
                Some(session) if session.can_resume(now) => {
                    session.reattach(sender);
                    session.activate(now);
                    info!(queue = %self.name, consumer = %id, "Consumer returned from backoff");
                    false
                }
                Some(_) => true,
                None => {
                    let mut session = ConsumerSession::new(id.clone(), sender);
                    session.activate(now);
                    state.consumers.insert(id.clone(), session);
                    state.order.push(id.clone());
                    info!(queue = %self.name, consumer = %id, consumers = state.order.len(), "Consumer registered");
                    false
                }
            }
        };

        if duplicate {
            return self.reject(Error::ConsumerAlreadyRegistered(id.to_string()));
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Remove a consumer, handing its outstanding deliveries back to the
    /// head of the backlog in the order they were delivered.
    pub fn unregister_consumer(&self, id: &ConsumerId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            self.ensure_running()?;
            self.remove_consumer(&mut state, id)
        };

        match removed {
            Some(mut session) => {
                session.close();
                info!(queue = %self.name, consumer = %id, "Consumer unregistered");
                self.wakeup.notify_one();
                Ok(())
            }
            None => self.reject(Error::ConsumerNotFound(id.to_string())),
        }
    }

    /// The connection behind `via` went away.
    ///
    /// Only a session still attached to that connection is touched. Sessions
    /// in backoff are kept so the client can come back under the same id;
    /// everything else is unregistered.
    pub fn detach_consumer(&self, id: &ConsumerId, via: &OutboundSender) {
        let removed = {
            let mut state = self.state.lock();
            let attached = state
                .consumers
                .get(id)
                .is_some_and(|s| s.is_attached_to(via) && s.state() != ConsumerState::Backoff);
            if attached {
                self.remove_consumer(&mut state, id)
            } else {
                None
            }
        };

        if let Some(mut session) = removed {
            session.close();
            debug!(queue = %self.name, consumer = %id, "Consumer detached");
            self.wakeup.notify_one();
        }
    }

    pub fn ping(&self, id: &ConsumerId) -> Result<()> {
        let now = self.clock.now();
        let found = {
            let mut state = self.state.lock();
            self.ensure_running()?;
            match state.consumers.get_mut(id) {
                Some(session) => {
                    session.ping(now);
                    true
                }
                None => false,
            }
        };

        if found {
            Ok(())
        } else {
            self.reject(Error::ConsumerNotFound(id.to_string()))
        }
    }

    /// Count an error against a consumer. Returns true when this error moved
    /// it into backoff.
    pub fn record_consumer_error(&self, id: &ConsumerId) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(session) = state.consumers.get_mut(id) else {
            return self.reject(Error::ConsumerNotFound(id.to_string())).map(|_| false);
        };

        let window = self.config.consumer_error_timeout();
        if !session.record_error(now, self.config.consumer_error_threshold, window) {
            return Ok(false);
        }
        session.request_reconnect_after_delay(&self.name, now, window);

        let drained = state.tracker.drain(id);
        let requeued = self.requeue(&mut state, drained);
        drop(state);

        debug!(queue = %self.name, consumer = %id, requeued, "Backoff handed deliveries back");
        self.wakeup.notify_one();
        Ok(true)
    }

    /// `ACTIVE|BACKOFF → SHUTTING_DOWN → CLOSED`: tell the consumer to go
    /// away, hand its deliveries back and forget it.
    pub fn request_consumer_shutdown(&self, id: &ConsumerId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            match state.consumers.get_mut(id) {
                Some(session) => {
                    session.request_shutdown(&self.name);
                    self.remove_consumer(&mut state, id)
                }
                None => None,
            }
        };

        match removed {
            Some(mut session) => {
                session.close();
                self.wakeup.notify_one();
                Ok(())
            }
            None => self.reject(Error::ConsumerNotFound(id.to_string())),
        }
    }

    fn remove_consumer(&self, state: &mut QueueState, id: &ConsumerId) -> Option<ConsumerSession> {
        let session = state.consumers.remove(id)?;
        if let Some(index) = state.order.iter().position(|c| c == id) {
            state.order.remove(index);
            state.scheduler.removed(index, state.order.len());
        }

        let drained = state.tracker.drain(id);
        let requeued = self.requeue(state, drained);
        if requeued > 0 {
            debug!(queue = %self.name, consumer = %id, requeued, "Requeued outstanding deliveries");
        }
        Some(session)
    }

    /// Put drained deliveries back at the head of the backlog, keeping their
    /// relative order. A fanout copy is dropped while another consumer still
    /// holds the message or it is already pending.
    fn requeue(&self, state: &mut QueueState, entries: Vec<UnackedEntry>) -> usize {
        let mut requeued = 0;
        for entry in entries.into_iter().rev() {
            let id = entry.message.id;
            if self.config.delivery_method == DeliveryMethod::Fanout
                && (state.tracker.is_outstanding(&id) || state.pending.contains(&id))
            {
                continue;
            }
            let mut message = entry.message;
            message.attempts = entry.attempt_count;
            state.pending.push_front(message);
            requeued += 1;
        }
        requeued
    }

    // ==================== Delivery ====================

    /// Deliver from the head of the backlog until it is empty or stalls.
    pub fn dispatch_pending(&self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        loop {
            match self.dispatch_next() {
                Step::Delivered(n) => outcome.delivered += n,
                Step::Skipped => {}
                Step::Stalled => {
                    outcome.stalled = true;
                    break;
                }
                Step::Idle => break,
            }
        }
        outcome
    }

    fn dispatch_next(&self) -> Step {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        if !self.is_running() {
            return Step::Idle;
        }

        let (step, gone) = {
            let QueueState {
                pending,
                consumers,
                order,
                tracker,
                scheduler,
                ..
            } = &mut *guard;

            if pending.is_empty() {
                return Step::Idle;
            }

            let max_unacked = self.config.max_unacked;
            let targets = scheduler.select(order.as_slice(), |id| {
                consumers.get(id).is_some_and(ConsumerSession::is_eligible) && tracker.count(id) < max_unacked
            });

            match targets {
                Targets::Stalled => return Step::Stalled,
                Targets::One(target) => {
                    let Some(message) = pending.pop_front() else {
                        return Step::Idle;
                    };
                    if !tracker.record(&target, message.clone(), now, message.attempts) {
                        warn!(
                            queue = %self.name,
                            consumer = %target,
                            message_id = %message.id,
                            "Message already outstanding, dropping copy"
                        );
                        return Step::Skipped;
                    }
                    if consumers.get(&target).is_some_and(|s| s.deliver(&self.name, &message)) {
                        trace!(queue = %self.name, consumer = %target, message_id = %message.id, "Delivered");
                        (Step::Delivered(1), Vec::new())
                    } else {
                        tracker.take(&target, &message.id);
                        pending.push_front(message);
                        (Step::Skipped, vec![target])
                    }
                }
                Targets::Many(targets) => {
                    let Some(message) = pending.front().cloned() else {
                        return Step::Idle;
                    };
                    let mut reached = 0;
                    let mut holding = 0;
                    let mut gone = Vec::new();
                    for target in targets {
                        if !tracker.record(&target, message.clone(), now, message.attempts) {
                            holding += 1;
                            continue;
                        }
                        if consumers.get(&target).is_some_and(|s| s.deliver(&self.name, &message)) {
                            reached += 1;
                        } else {
                            tracker.take(&target, &message.id);
                            gone.push(target);
                        }
                    }
                    if reached + holding > 0 {
                        pending.pop_front();
                    }
                    if reached > 0 {
                        trace!(queue = %self.name, message_id = %message.id, copies = reached, "Fanned out");
                        (Step::Delivered(reached), gone)
                    } else {
                        (Step::Skipped, gone)
                    }
                }
            }
        };

        for id in &gone {
            warn!(queue = %self.name, consumer = %id, "Consumer connection lost, removing");
            if let Some(mut session) = self.remove_consumer(&mut guard, id) {
                session.close();
            }
        }

        if let Step::Delivered(n) = &step {
            self.metrics.delivered.fetch_add(*n as u64, Ordering::Relaxed);
        }
        step
    }

    // ==================== Ack timeouts ====================

    /// Redeliver or dead-letter every delivery older than the ack timeout,
    /// and close consumers whose backoff ran out.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let ack_timeout = delta(self.config.ack_timeout());
        let mut report = SweepReport::default();
        let mut dead = Vec::new();
        let mut gone = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut requeue = Vec::new();

            for expired in state.tracker.sweep(now, ack_timeout) {
                let consumer = expired.consumer_id;
                let message_id = expired.message.id;

                if expired.attempt_count >= self.config.max_retries {
                    let Some(entry) = state.tracker.take(&consumer, &message_id) else {
                        continue;
                    };
                    dead.push(DeadLetter {
                        queue: self.name.clone(),
                        message: entry.message,
                        consumer_id: consumer,
                        attempts: entry.attempt_count + 1,
                        dead_lettered_at: now,
                    });
                    continue;
                }

                match self.config.delivery_method {
                    DeliveryMethod::RoundRobin => {
                        let Some(entry) = state.tracker.take(&consumer, &message_id) else {
                            continue;
                        };
                        let mut message = entry.message;
                        message.attempts = entry.attempt_count + 1;
                        requeue.push(message);
                    }
                    DeliveryMethod::Fanout => {
                        let Some(entry) = state.tracker.touch(&consumer, &message_id, now) else {
                            continue;
                        };
                        let mut message = entry.message.clone();
                        message.attempts = entry.attempt_count;
                        let sent = state
                            .consumers
                            .get(&consumer)
                            .is_some_and(|s| s.deliver(&self.name, &message));
                        if sent {
                            self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                        } else {
                            gone.push(consumer);
                        }
                    }
                }
                report.redelivered += 1;
            }

            for message in requeue.into_iter().rev() {
                state.pending.push_front(message);
            }

            for letter in &dead {
                warn!(
                    queue = %self.name,
                    consumer = %letter.consumer_id,
                    message_id = %letter.message.id,
                    attempts = letter.attempts,
                    "Message dead-lettered"
                );
                if self.config.dead_letter_capacity > 0 {
                    if state.dead_letters.len() >= self.config.dead_letter_capacity {
                        state.dead_letters.pop_front();
                    }
                    state.dead_letters.push_back(letter.clone());
                }
            }

            let grace = self.config.consumer_error_timeout();
            let lapsed: Vec<ConsumerId> = state
                .consumers
                .values()
                .filter(|s| s.backoff_expired(now, grace))
                .map(|s| s.id().clone())
                .collect();
            for id in lapsed {
                if let Some(mut session) = self.remove_consumer(state, &id) {
                    session.close();
                    info!(queue = %self.name, consumer = %id, "Consumer did not return from backoff, closed");
                    report.closed += 1;
                }
            }

            gone.dedup();
            for id in &gone {
                warn!(queue = %self.name, consumer = %id, "Consumer connection lost, removing");
                if let Some(mut session) = self.remove_consumer(state, id) {
                    session.close();
                }
            }
        }

        report.dead_lettered = dead.len();
        self.metrics
            .redelivered
            .fetch_add(report.redelivered as u64, Ordering::Relaxed);
        self.metrics
            .dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);

        if !dead.is_empty() {
            if let Some(sink) = self.dead_letter_sink.lock().as_ref() {
                for letter in dead {
                    let _ = sink.send(letter);
                }
            }
        }

        if report.redelivered > 0 || !gone.is_empty() {
            self.wakeup.notify_one();
        }
        report
    }

    // ==================== Persistence ====================

    /// Current pending backlog and outstanding deliveries
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(self.name.clone());
        snapshot.taken_at = self.clock.now();
        snapshot.pending = state.pending.iter().cloned().collect();
        snapshot.unacked = state.tracker.to_stored();
        snapshot
    }

    /// Write a snapshot to the store, if the queue has one.
    pub async fn dump(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let _guard = self.dump_lock.lock().await;
        let snapshot = self.snapshot();
        store.dump(&snapshot).await?;
        debug!(
            queue = %self.name,
            pending = snapshot.pending.len(),
            unacked = snapshot.unacked.values().map(Vec::len).sum::<usize>(),
            "Snapshot written"
        );
        Ok(())
    }

    /// Load the last snapshot into the backlog.
    ///
    /// Deliveries that were outstanding go back in front of the old backlog.
    /// Returns the number of messages recovered.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(snapshot) = store.load(&self.name).await? else {
            debug!(queue = %self.name, "No snapshot to restore");
            return Ok(0);
        };

        let recovered = snapshot.into_recovered_pending();
        let count = recovered.len();
        {
            let mut state = self.state.lock();
            for message in recovered.into_iter().rev() {
                if !state.pending.contains(&message.id) && !state.tracker.is_outstanding(&message.id) {
                    state.pending.push_front(message);
                }
            }
        }

        info!(queue = %self.name, messages = count, "Restored from snapshot");
        self.wakeup.notify_one();
        Ok(count)
    }

    // ==================== Lifecycle ====================

    /// Spawn the delivery, sweep and snapshot loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || !self.is_running() {
            return;
        }

        tasks.push(tokio::spawn(Arc::clone(self).delivery_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).sweep_loop()));
        if self.store.is_some() {
            if let Some(every) = self.config.snapshot_interval() {
                tasks.push(tokio::spawn(Arc::clone(self).snapshot_loop(every)));
            }
        }

        info!(
            queue = %self.name,
            method = %self.config.delivery_method,
            ack_timeout_secs = self.config.ack_timeout_secs,
            "Queue started"
        );
    }

    /// Stop the loops, hand every outstanding delivery back to the backlog,
    /// write a final snapshot and tell consumers to go away. Idempotent.
    pub async fn stop(&self) {
        {
            let _state = self.state.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
        }
        info!(queue = %self.name, "Stopping queue");

        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(queue = %self.name, error = %e, "Queue task ended abnormally");
            }
        }

        {
            let mut state = self.state.lock();
            let ids = state.order.clone();
            for id in ids {
                if let Some(session) = state.consumers.get_mut(&id) {
                    session.request_shutdown(&self.name);
                }
                if let Some(mut session) = self.remove_consumer(&mut state, &id) {
                    session.close();
                }
            }
        }

        if let Err(e) = self.dump().await {
            error!(queue = %self.name, error = %e, "Final snapshot failed");
        }
        info!(queue = %self.name, "Queue stopped");
    }

    async fn delivery_loop(self: Arc<Self>) {
        debug!(queue = %self.name, "Delivery loop running");
        loop {
            let outcome = self.dispatch_pending();
            if outcome.stalled {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.config.stall_backoff()) => {}
                }
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                }
            }
        }
        debug!(queue = %self.name, "Delivery loop exited");
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep_expired();
                    if !report.is_empty() {
                        debug!(
                            queue = %self.name,
                            redelivered = report.redelivered,
                            dead_lettered = report.dead_lettered,
                            closed = report.closed,
                            "Ack sweep"
                        );
                    }
                }
            }
        }
        debug!(queue = %self.name, "Sweep loop exited");
    }

    async fn snapshot_loop(self: Arc<Self>, every: std::time::Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dump().await {
                        error!(queue = %self.name, error = %e, "Scheduled snapshot failed");
                    }
                }
            }
        }
    }

    // ==================== Inspection ====================

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending_count: state.pending.len() as u64,
            unacked_count: state.tracker.len() as u64,
            consumer_count: state.consumers.len() as u64,
            active_consumer_count: state.consumers.values().filter(|s| s.is_eligible()).count() as u64,
            published_total: self.metrics.published.load(Ordering::Relaxed),
            delivered_total: self.metrics.delivered.load(Ordering::Relaxed),
            acked_total: self.metrics.acked.load(Ordering::Relaxed),
            redelivered_total: self.metrics.redelivered.load(Ordering::Relaxed),
            dead_lettered_total: self.metrics.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Pending message ids, head first
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.state.lock().pending.iter().map(|m| m.id).collect()
    }

    pub fn pending_messages(&self) -> Vec<Message> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Message ids outstanding for a consumer, in delivery order
    pub fn unacked_for(&self, consumer: &ConsumerId) -> Vec<MessageId> {
        self.state.lock().tracker.message_ids(consumer)
    }

    /// Whether `id` is registered and its deliveries go through `via`
    pub fn is_attached(&self, id: &ConsumerId, via: &OutboundSender) -> bool {
        self.state
            .lock()
            .consumers
            .get(id)
            .is_some_and(|s| s.is_attached_to(via))
    }

    pub fn consumer_state(&self, id: &ConsumerId) -> Option<ConsumerState> {
        self.state.lock().consumers.get(id).map(ConsumerSession::state)
    }

    /// Registered consumers in registration order
    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.state.lock().order.clone()
    }

    /// Most recent dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("method", &self.config.delivery_method)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulsemq_storage::{FileStore, MemoryStore};
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::clock::ManualClock;
    use crate::consumer::{Outbound, OutboundReceiver};

    fn config(method: DeliveryMethod, max_unacked: usize) -> QueueConfig {
        QueueConfig {
            delivery_method: method,
            max_unacked,
            ..QueueConfig::default()
        }
    }

    fn queue_with(config: QueueConfig, mode: ErrorMode) -> (MessageQueue, ManualClock) {
        let clock = ManualClock::default();
        let queue = MessageQueue::new("orders", config, mode).with_clock(Arc::new(clock.clone()));
        (queue, clock)
    }

    fn register(queue: &MessageQueue, id: &str) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        queue.register_consumer(id.into(), tx).unwrap();
        rx
    }

    fn publish(queue: &MessageQueue, payload: &str) -> MessageId {
        queue.publish(Message::new(payload.to_string())).unwrap()
    }

    fn received(rx: &mut OutboundReceiver) -> Vec<(MessageId, u32)> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Deliver(d) = frame {
                out.push((d.message_id, d.attempt));
            }
        }
        out
    }

    /// Every message lives in exactly one place and no consumer is over capacity.
    fn assert_invariants(queue: &MessageQueue) {
        let state = queue.state.lock();

        let mut pending = HashSet::new();
        for m in state.pending.iter() {
            assert!(pending.insert(m.id), "message {} pending twice", m.id);
            assert!(!state.tracker.is_outstanding(&m.id), "message {} pending and unacked", m.id);
        }

        let mut holders: HashMap<MessageId, usize> = HashMap::new();
        for (consumer, entries) in state.tracker.to_stored() {
            assert!(entries.len() <= queue.config.max_unacked, "{consumer} over capacity");
            for e in entries {
                *holders.entry(e.message.id).or_default() += 1;
            }
        }
        if queue.config.delivery_method == DeliveryMethod::RoundRobin {
            assert!(holders.values().all(|n| *n == 1));
        }
    }

    #[test]
    fn test_round_robin_assignment_and_stall() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::RoundRobin, 2), ErrorMode::Lenient);
        let mut a = register(&queue, "A");
        let mut b = register(&queue, "B");

        let m: Vec<MessageId> = (1..=4).map(|i| publish(&queue, &format!("m{i}"))).collect();
        let outcome = queue.dispatch_pending();
        assert_eq!(outcome.delivered, 4);
        assert!(!outcome.stalled);

        assert_eq!(queue.unacked_for(&"A".into()), vec![m[0], m[2]]);
        assert_eq!(queue.unacked_for(&"B".into()), vec![m[1], m[3]]);
        assert_eq!(received(&mut a), vec![(m[0], 0), (m[2], 0)]);
        assert_eq!(received(&mut b), vec![(m[1], 0), (m[3], 0)]);

        let m5 = publish(&queue, "m5");
        let outcome = queue.dispatch_pending();
        assert_eq!(outcome, DispatchOutcome { delivered: 0, stalled: true });
        assert_eq!(queue.pending_ids(), vec![m5]);
        assert_invariants(&queue);

        queue.ack(&"A".into(), &m[0]).unwrap();
        assert_eq!(queue.dispatch_pending().delivered, 1);
        assert_eq!(queue.unacked_for(&"A".into()), vec![m[2], m5]);
        assert!(queue.pending_ids().is_empty());
        assert_invariants(&queue);
    }

    #[test]
    fn test_round_robin_fairness() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::RoundRobin, 10), ErrorMode::Lenient);
        let consumers = ["c1", "c2", "c3"];
        let _rxs: Vec<_> = consumers.iter().map(|c| register(&queue, c)).collect();

        for i in 0..7 {
            publish(&queue, &format!("m{i}"));
        }
        queue.dispatch_pending();

        let counts: Vec<usize> = consumers.iter().map(|c| queue.unacked_for(&(*c).into()).len()).collect();
        let max = counts.iter().max().copied().unwrap();
        let min = counts.iter().min().copied().unwrap();
        assert!(max - min <= 1, "unfair split {counts:?}");
        assert_eq!(counts.iter().sum::<usize>(), 7);
        assert_invariants(&queue);
    }

    #[test]
    fn test_no_consumers_keeps_backlog() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let id = publish(&queue, "waiting");
        assert!(queue.dispatch_pending().stalled);
        assert_eq!(queue.pending_ids(), vec![id]);
    }

    #[test]
    fn test_duplicate_publishes_are_distinct() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let a = publish(&queue, "same");
        let b = publish(&queue, "same");
        assert_ne!(a, b);
        assert_eq!(queue.stats().pending_count, 2);
    }

    /// Consumer state, A's outstanding ids and the backlog
    fn observe(queue: &MessageQueue) -> (Option<ConsumerState>, Vec<MessageId>, Vec<MessageId>) {
        (
            queue.consumer_state(&"A".into()),
            queue.unacked_for(&"A".into()),
            queue.pending_ids(),
        )
    }

    fn hair_trigger(mode: ErrorMode) -> (MessageQueue, ManualClock) {
        let cfg = QueueConfig {
            consumer_error_threshold: 0,
            ..QueueConfig::default()
        };
        queue_with(cfg, mode)
    }

    #[test]
    fn test_ack_is_idempotent_lenient() {
        let (queue, _clock) = hair_trigger(ErrorMode::Lenient);
        let mut rx = register(&queue, "A");
        let m1 = publish(&queue, "m1");
        let m2 = publish(&queue, "m2");
        queue.dispatch_pending();

        queue.ack(&"A".into(), &m1).unwrap();
        let before = observe(&queue);
        let stats = queue.stats();
        assert_eq!(before, (Some(ConsumerState::Active), vec![m2], vec![]));

        queue.ack(&"A".into(), &m1).unwrap();
        assert_eq!(observe(&queue), before);
        assert_eq!(queue.stats(), stats);
        assert_eq!(stats.acked_total, 1);
        assert!(std::iter::from_fn(|| rx.try_recv().ok()).all(|f| !matches!(f, Outbound::Reconnect { .. })));
        assert_invariants(&queue);
    }

    #[test]
    fn test_ack_is_idempotent_strict() {
        let (queue, _clock) = hair_trigger(ErrorMode::Strict);
        let _rx = register(&queue, "A");
        let m1 = publish(&queue, "m1");
        let m2 = publish(&queue, "m2");
        queue.dispatch_pending();

        queue.ack(&"A".into(), &m1).unwrap();
        let before = observe(&queue);
        let stats = queue.stats();
        assert_eq!(before, (Some(ConsumerState::Active), vec![m2], vec![]));

        assert!(matches!(queue.ack(&"A".into(), &m1), Err(Error::MessageNotFound { .. })));
        assert!(matches!(queue.ack(&"A".into(), &MessageId::new()), Err(Error::MessageNotFound { .. })));
        assert_eq!(observe(&queue), before);
        assert_eq!(queue.stats(), stats);
        assert_invariants(&queue);
    }

    #[test]
    fn test_publish_with_queued_id_follows_error_mode() {
        let id = MessageId::new();

        let (strict, _) = queue_with(QueueConfig::default(), ErrorMode::Strict);
        strict.publish(Message::with_id(id, "first")).unwrap();
        assert!(matches!(
            strict.publish(Message::with_id(id, "second")),
            Err(Error::MessageAlreadyQueued(_))
        ));
        assert_eq!(strict.pending_ids(), vec![id]);

        // Still refused once the first copy is outstanding
        let mut rx = register(&strict, "A");
        strict.dispatch_pending();
        assert!(strict.publish(Message::with_id(id, "third")).is_err());
        assert!(strict.pending_ids().is_empty());
        assert_eq!(received(&mut rx), vec![(id, 0)]);

        // Acked ids may be reused
        strict.ack(&"A".into(), &id).unwrap();
        strict.publish(Message::with_id(id, "again")).unwrap();
        assert_eq!(strict.pending_ids(), vec![id]);

        let (lenient, _) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let mut rx = register(&lenient, "A");
        assert_eq!(lenient.publish(Message::with_id(id, "first")).unwrap(), id);
        assert_eq!(lenient.publish(Message::with_id(id, "second")).unwrap(), id);
        assert_eq!(lenient.dispatch_pending().delivered, 1);
        assert_eq!(received(&mut rx), vec![(id, 0)]);
        assert_eq!(lenient.unacked_for(&"A".into()), vec![id]);
        assert!(lenient.pending_ids().is_empty());
        assert_eq!(lenient.stats().published_total, 1);
        assert_invariants(&lenient);
    }

    #[test]
    fn test_dispatch_drops_copy_already_outstanding() {
        for method in [DeliveryMethod::RoundRobin, DeliveryMethod::Fanout] {
            let (queue, _clock) = queue_with(config(method, 10), ErrorMode::Lenient);
            let mut rx = register(&queue, "A");
            let id = publish(&queue, "m");
            queue.dispatch_pending();
            assert_eq!(received(&mut rx), vec![(id, 0)]);

            // A stray copy of a message A already holds
            let copy = queue.state.lock().tracker.message_ids(&"A".into());
            assert_eq!(copy, vec![id]);
            queue.state.lock().pending.push_back(Message::with_id(id, "m"));

            let outcome = queue.dispatch_pending();
            assert_eq!(outcome.delivered, 0, "{method}");
            assert!(received(&mut rx).is_empty(), "{method}");
            assert!(queue.pending_ids().is_empty(), "{method}");
            assert_eq!(queue.unacked_for(&"A".into()), vec![id], "{method}");
            assert_invariants(&queue);
        }
    }

    #[test]
    fn test_ack_by_other_consumer_is_invalid() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Strict);
        let _a = register(&queue, "A");
        let _b = register(&queue, "B");
        let id = publish(&queue, "m");
        queue.dispatch_pending();

        assert!(queue.ack(&"B".into(), &id).is_err());
        assert_eq!(queue.unacked_for(&"A".into()), vec![id]);
    }

    #[test]
    fn test_duplicate_register_and_unknown_unregister() {
        let (strict, _) = queue_with(QueueConfig::default(), ErrorMode::Strict);
        let _rx = register(&strict, "A");
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            strict.register_consumer("A".into(), tx),
            Err(Error::ConsumerAlreadyRegistered(_))
        ));
        assert!(matches!(
            strict.unregister_consumer(&"ghost".into()),
            Err(Error::ConsumerNotFound(_))
        ));

        let (lenient, _) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let _rx = register(&lenient, "A");
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(lenient.register_consumer("A".into(), tx).is_ok());
        assert!(lenient.unregister_consumer(&"ghost".into()).is_ok());
        assert_eq!(lenient.consumer_ids(), vec![ConsumerId::from("A")]);
    }

    #[test]
    fn test_unregister_requeues_in_order() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::RoundRobin, 10), ErrorMode::Lenient);
        let _rx = register(&queue, "A");
        let m: Vec<MessageId> = (0..3).map(|i| publish(&queue, &format!("m{i}"))).collect();
        queue.dispatch_pending();

        // Queue has no consumer left, so m3 stays pending
        queue.unregister_consumer(&"A".into()).unwrap();
        let m3 = publish(&queue, "m3");
        assert_eq!(queue.pending_ids(), vec![m[0], m[1], m[2], m3]);
        assert_eq!(queue.stats().unacked_count, 0);
        assert_invariants(&queue);
    }

    #[test]
    fn test_unregister_keeps_rotation_for_others() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::RoundRobin, 10), ErrorMode::Lenient);
        let _a = register(&queue, "A");
        let _b = register(&queue, "B");
        let _c = register(&queue, "C");

        let m1 = publish(&queue, "m1");
        queue.dispatch_pending();
        queue.unregister_consumer(&"A".into()).unwrap();
        queue.dispatch_pending();

        // m1 was A's, it goes to B, the next in rotation
        assert_eq!(queue.unacked_for(&"B".into()), vec![m1]);
    }

    #[test]
    fn test_lost_connection_is_evicted() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let rx = register(&queue, "A");
        let mut b = register(&queue, "B");
        drop(rx);

        let id = publish(&queue, "m");
        queue.dispatch_pending();

        assert_eq!(queue.consumer_ids(), vec![ConsumerId::from("B")]);
        assert_eq!(received(&mut b), vec![(id, 0)]);
        assert_invariants(&queue);
    }

    #[test]
    fn test_fanout_skips_saturated_consumer() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::Fanout, 1), ErrorMode::Lenient);
        let mut a = register(&queue, "A");
        let mut b = register(&queue, "B");

        let m1 = publish(&queue, "m1");
        assert_eq!(queue.dispatch_pending().delivered, 2);
        queue.ack(&"B".into(), &m1).unwrap();

        // A is full, B takes m2 alone
        let m2 = publish(&queue, "m2");
        assert_eq!(queue.dispatch_pending().delivered, 1);
        assert!(queue.pending_ids().is_empty());

        assert_eq!(received(&mut a), vec![(m1, 0)]);
        assert_eq!(received(&mut b), vec![(m1, 0), (m2, 0)]);
        assert_invariants(&queue);
    }

    #[test]
    fn test_fanout_stalls_when_nobody_has_capacity() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::Fanout, 1), ErrorMode::Lenient);
        let _a = register(&queue, "A");
        publish(&queue, "m1");
        queue.dispatch_pending();

        let m2 = publish(&queue, "m2");
        assert!(queue.dispatch_pending().stalled);
        assert_eq!(queue.pending_ids(), vec![m2]);
    }

    #[test]
    fn test_fanout_unregister_keeps_other_copies() {
        let (queue, _clock) = queue_with(config(DeliveryMethod::Fanout, 10), ErrorMode::Lenient);
        let _a = register(&queue, "A");
        let _b = register(&queue, "B");
        let m1 = publish(&queue, "m1");
        queue.dispatch_pending();

        queue.unregister_consumer(&"A".into()).unwrap();
        assert!(queue.pending_ids().is_empty());
        assert_eq!(queue.unacked_for(&"B".into()), vec![m1]);

        queue.unregister_consumer(&"B".into()).unwrap();
        assert_eq!(queue.pending_ids(), vec![m1]);
        assert_invariants(&queue);
    }

    #[test]
    fn test_timeout_redelivers_then_dead_letters() {
        let cfg = QueueConfig {
            max_retries: 2,
            ack_timeout_secs: 10,
            ..QueueConfig::default()
        };
        let (queue, clock) = queue_with(cfg, ErrorMode::Lenient);
        let mut a = register(&queue, "A");
        let id = publish(&queue, "slow");
        queue.dispatch_pending();

        // Exactly at the timeout nothing happens
        clock.advance(Duration::from_secs(10));
        assert!(queue.sweep_expired().is_empty());

        for _ in 0..2 {
            clock.advance(Duration::from_secs(11));
            let report = queue.sweep_expired();
            assert_eq!(report.redelivered, 1);
            assert_invariants(&queue);
            queue.dispatch_pending();
        }
        assert_eq!(received(&mut a), vec![(id, 0), (id, 1), (id, 2)]);

        clock.advance(Duration::from_secs(11));
        let report = queue.sweep_expired();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(queue.stats().unacked_count, 0);
        assert!(queue.pending_ids().is_empty());

        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message.id, id);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(queue.stats().dead_lettered_total, 1);
    }

    #[test]
    fn test_timeout_may_move_to_another_consumer() {
        let (queue, clock) = queue_with(config(DeliveryMethod::RoundRobin, 10), ErrorMode::Lenient);
        let _a = register(&queue, "A");
        let _b = register(&queue, "B");
        let id = publish(&queue, "m");
        queue.dispatch_pending();
        assert_eq!(queue.unacked_for(&"A".into()), vec![id]);

        clock.advance(Duration::from_secs(11));
        queue.sweep_expired();
        assert_eq!(queue.pending_ids(), vec![id]);
        assert_eq!(queue.pending_messages()[0].attempts, 1);

        queue.dispatch_pending();
        assert_eq!(queue.unacked_for(&"B".into()), vec![id]);
    }

    #[test]
    fn test_ack_before_sweep_wins() {
        let (queue, clock) = queue_with(QueueConfig::default(), ErrorMode::Strict);
        let _a = register(&queue, "A");
        let id = publish(&queue, "m");
        queue.dispatch_pending();

        clock.advance(Duration::from_secs(60));
        queue.ack(&"A".into(), &id).unwrap();
        assert!(queue.sweep_expired().is_empty());
        assert!(queue.pending_ids().is_empty());
    }

    #[test]
    fn test_fanout_timeout_resends_to_same_consumer() {
        let (queue, clock) = queue_with(config(DeliveryMethod::Fanout, 10), ErrorMode::Lenient);
        let mut a = register(&queue, "A");
        let mut b = register(&queue, "B");
        let id = publish(&queue, "broadcast");
        queue.dispatch_pending();
        received(&mut a);
        received(&mut b);

        queue.ack(&"B".into(), &id).unwrap();
        clock.advance(Duration::from_secs(11));
        assert_eq!(queue.sweep_expired().redelivered, 1);

        assert_eq!(received(&mut a), vec![(id, 1)]);
        assert!(received(&mut b).is_empty());
        assert_eq!(queue.unacked_for(&"A".into()), vec![id]);
        assert!(queue.pending_ids().is_empty());
    }

    #[test]
    fn test_dead_letter_ring_is_bounded() {
        let cfg = QueueConfig {
            max_retries: 0,
            dead_letter_capacity: 2,
            max_unacked: 10,
            ..QueueConfig::default()
        };
        let (queue, clock) = queue_with(cfg, ErrorMode::Lenient);
        let _a = register(&queue, "A");
        let ids: Vec<MessageId> = (0..3).map(|i| publish(&queue, &format!("m{i}"))).collect();
        queue.dispatch_pending();

        clock.advance(Duration::from_secs(11));
        assert_eq!(queue.sweep_expired().dead_lettered, 3);

        let kept: Vec<MessageId> = queue.dead_letters().iter().map(|d| d.message.id).collect();
        assert_eq!(kept, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_dead_letters_reach_sink() {
        let cfg = QueueConfig {
            max_retries: 0,
            ..QueueConfig::default()
        };
        let (queue, clock) = queue_with(cfg, ErrorMode::Lenient);
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.set_dead_letter_sink(tx);
        let _a = register(&queue, "A");
        let id = publish(&queue, "m");
        queue.dispatch_pending();

        clock.advance(Duration::from_secs(11));
        queue.sweep_expired();
        assert_eq!(rx.try_recv().unwrap().message.id, id);
    }

    #[test]
    fn test_error_threshold_moves_consumer_to_backoff() {
        let cfg = QueueConfig {
            consumer_error_threshold: 1,
            consumer_error_timeout_secs: 30,
            ..QueueConfig::default()
        };
        let (queue, clock) = queue_with(cfg, ErrorMode::Strict);
        let mut a = register(&queue, "A");
        let id = publish(&queue, "m");
        queue.dispatch_pending();
        received(&mut a);

        assert!(!queue.record_consumer_error(&"A".into()).unwrap());
        assert!(queue.record_consumer_error(&"A".into()).unwrap());
        assert_eq!(queue.consumer_state(&"A".into()), Some(ConsumerState::Backoff));
        assert!(matches!(a.try_recv(), Ok(Outbound::Reconnect { .. })));

        // Outstanding work went back, and nobody is eligible for it
        assert_eq!(queue.pending_ids(), vec![id]);
        assert!(queue.dispatch_pending().stalled);

        // Too early
        let (tx, _early) = mpsc::unbounded_channel();
        assert!(queue.register_consumer("A".into(), tx).is_err());

        // Back after the delay on a new connection
        clock.advance(Duration::from_secs(30));
        let (tx, mut again) = mpsc::unbounded_channel();
        queue.register_consumer("A".into(), tx).unwrap();
        assert_eq!(queue.consumer_state(&"A".into()), Some(ConsumerState::Active));
        queue.dispatch_pending();
        assert_eq!(received(&mut again), vec![(id, 0)]);
    }

    #[test]
    fn test_backoff_consumer_closed_when_it_never_returns() {
        let cfg = QueueConfig {
            consumer_error_threshold: 0,
            consumer_error_timeout_secs: 30,
            ..QueueConfig::default()
        };
        let (queue, clock) = queue_with(cfg, ErrorMode::Lenient);
        let (tx, _rx) = mpsc::unbounded_channel();
        queue.register_consumer("A".into(), tx.clone()).unwrap();
        assert!(queue.record_consumer_error(&"A".into()).unwrap());

        // The connection dropping does not forget a consumer in backoff
        queue.detach_consumer(&"A".into(), &tx);
        assert_eq!(queue.consumer_state(&"A".into()), Some(ConsumerState::Backoff));

        clock.advance(Duration::from_secs(59));
        assert_eq!(queue.sweep_expired().closed, 0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(queue.sweep_expired().closed, 1);
        assert_eq!(queue.consumer_state(&"A".into()), None);
    }

    #[test]
    fn test_request_consumer_shutdown() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let mut a = register(&queue, "A");
        let id = publish(&queue, "m");
        queue.dispatch_pending();
        received(&mut a);

        queue.request_consumer_shutdown(&"A".into()).unwrap();
        assert!(matches!(a.try_recv(), Ok(Outbound::Shutdown { .. })));
        assert_eq!(queue.consumer_state(&"A".into()), None);
        assert_eq!(queue.pending_ids(), vec![id]);
    }

    #[test]
    fn test_detach_only_touches_own_connection() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Lenient);
        let (first, _first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();
        queue.register_consumer("A".into(), first.clone()).unwrap();
        // Lenient duplicate from another connection is ignored
        queue.register_consumer("A".into(), second.clone()).unwrap();

        queue.detach_consumer(&"A".into(), &second);
        assert_eq!(queue.consumer_state(&"A".into()), Some(ConsumerState::Active));

        queue.detach_consumer(&"A".into(), &first);
        assert_eq!(queue.consumer_state(&"A".into()), None);
    }

    #[test]
    fn test_ping_unknown_consumer() {
        let (queue, _clock) = queue_with(QueueConfig::default(), ErrorMode::Strict);
        let _a = register(&queue, "A");
        assert!(queue.ping(&"A".into()).is_ok());
        assert!(queue.ping(&"B".into()).is_err());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let original = MessageQueue::new("orders", config(DeliveryMethod::RoundRobin, 1), ErrorMode::Lenient)
            .with_store(store.clone());
        let _a = register(&original, "A");
        let m: Vec<MessageId> = (0..3).map(|i| publish(&original, &format!("m{i}"))).collect();
        original.dispatch_pending();
        assert_eq!(original.unacked_for(&"A".into()), vec![m[0]]);

        original.dump().await.unwrap();

        let restored = MessageQueue::new("orders", config(DeliveryMethod::RoundRobin, 1), ErrorMode::Lenient)
            .with_store(store.clone());
        assert_eq!(restored.restore().await.unwrap(), 3);
        assert_eq!(restored.pending_ids(), m);

        let payloads: Vec<String> = restored
            .pending_messages()
            .iter()
            .map(|msg| msg.payload_as_str().unwrap().to_string())
            .collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_persistence_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());

        let original = MessageQueue::new("events", config(DeliveryMethod::Fanout, 10), ErrorMode::Lenient)
            .with_store(store.clone());
        let _a = register(&original, "A");
        let _b = register(&original, "B");
        let m1 = publish(&original, "m1");
        original.dispatch_pending();
        let m2 = publish(&original, "m2");
        original.dump().await.unwrap();

        let restored = MessageQueue::new("events", config(DeliveryMethod::Fanout, 10), ErrorMode::Lenient)
            .with_store(store);
        assert_eq!(restored.restore().await.unwrap(), 2);
        assert_eq!(restored.pending_ids(), vec![m1, m2]);
    }

    #[tokio::test]
    async fn test_failed_dump_is_reported_and_state_kept() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let queue = MessageQueue::new("orders", QueueConfig::default(), ErrorMode::Lenient).with_store(store.clone());
        let id = publish(&queue, "m");

        assert!(queue.dump().await.is_err());
        assert_eq!(queue.pending_ids(), vec![id]);

        store.set_failing(false);
        queue.dump().await.unwrap();
        assert_eq!(store.dump_count(), 1);
    }

    #[tokio::test]
    async fn test_started_queue_delivers_in_background() {
        let queue = Arc::new(MessageQueue::new("orders", QueueConfig::default(), ErrorMode::Lenient));
        queue.start();
        let mut a = register(&queue, "A");

        let id = publish(&queue, "hello");
        let frame = tokio::time::timeout(Duration::from_secs(5), a.recv()).await.unwrap().unwrap();
        match frame {
            Outbound::Deliver(d) => {
                assert_eq!(d.message_id, id);
                assert_eq!(d.payload.as_ref(), b"hello");
                assert_eq!(d.queue, "orders");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_and_goes_inert() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(
            MessageQueue::new("orders", QueueConfig::default(), ErrorMode::Lenient).with_store(store.clone()),
        );
        queue.start();
        let mut a = register(&queue, "A");
        let id = publish(&queue, "m");
        let _ = tokio::time::timeout(Duration::from_secs(5), a.recv()).await.unwrap();

        queue.stop().await;
        assert!(!queue.is_running());
        assert!(matches!(a.recv().await, Some(Outbound::Shutdown { .. })));

        // The unacked delivery was handed back before the final snapshot
        let snapshot = store.load("orders").await.unwrap().unwrap();
        assert_eq!(snapshot.pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![id]);
        assert!(snapshot.unacked.is_empty());

        assert!(matches!(
            queue.publish(Message::new("late")),
            Err(Error::QueueStopped(_))
        ));
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty | TryRecvError::Disconnected)));

        // Second stop is a no-op
        queue.stop().await;
        assert_eq!(store.dump_count(), 1);
    }
}
