//! Consumer sessions
//!
//! A `ConsumerSession` is one consumer's registration on one queue: its
//! identity, liveness, error rate and lifecycle state, plus the channel the
//! connection layer drains to write frames back to the client.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pulsemq_types::{ConsumerId, Message, MessageId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::delta;

/// Lifecycle of a consumer on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    /// Created by the connection layer, not yet registered
    Connecting,
    /// Registered and eligible for deliveries
    Active,
    /// Asked to reconnect later after too many errors
    Backoff,
    /// Asked to go away, outstanding work being handed back
    ShuttingDown,
    /// Gone for good
    Closed,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "CONNECTING",
            Self::Active => "ACTIVE",
            Self::Backoff => "BACKOFF",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// One message handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
    /// Redeliveries before this one
    pub attempt: u32,
}

/// Everything the core asks the connection layer to send
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Deliver(Delivery),
    /// Close the connection; the client may come back after `delay`
    Reconnect { queue: String, delay: Duration },
    /// Close the connection; the client should not come back
    Shutdown { queue: String },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// A consumer registered (or registering) on a queue
#[derive(Debug)]
pub struct ConsumerSession {
    id: ConsumerId,
    state: ConsumerState,
    last_ping: DateTime<Utc>,
    error_count: u32,
    error_window_start: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
    sender: OutboundSender,
}

impl ConsumerSession {
    /// Create a session in `Connecting` state
    pub fn new(id: ConsumerId, sender: OutboundSender) -> Self {
        Self {
            id,
            state: ConsumerState::Connecting,
            last_ping: Utc::now(),
            error_count: 0,
            error_window_start: None,
            backoff_until: None,
            sender,
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        self.last_ping
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        self.backoff_until
    }

    /// Only active consumers receive deliveries
    pub fn is_eligible(&self) -> bool {
        self.state == ConsumerState::Active
    }

    /// `CONNECTING → ACTIVE` on registration, `BACKOFF → ACTIVE` on return.
    pub(crate) fn activate(&mut self, now: DateTime<Utc>) {
        debug!(consumer = %self.id, from = %self.state, "Consumer active");
        self.state = ConsumerState::Active;
        self.last_ping = now;
        self.error_count = 0;
        self.error_window_start = None;
        self.backoff_until = None;
    }

    /// Swap in the channel of the connection the client came back on.
    pub(crate) fn reattach(&mut self, sender: OutboundSender) {
        self.sender = sender;
    }

    /// Whether deliveries currently go through `sender`
    pub fn is_attached_to(&self, sender: &OutboundSender) -> bool {
        self.sender.same_channel(sender)
    }

    pub(crate) fn ping(&mut self, now: DateTime<Utc>) {
        self.last_ping = now;
    }

    /// Count one error against the consumer.
    ///
    /// Errors are counted in windows of `window` starting at the first error;
    /// returns true when the count exceeds `threshold` inside the current
    /// window while the consumer is active.
    pub(crate) fn record_error(&mut self, now: DateTime<Utc>, threshold: u32, window: Duration) -> bool {
        let window = delta(window);
        let window_open = self
            .error_window_start
            .is_some_and(|start| now.signed_duration_since(start) <= window);

        if !window_open {
            self.error_window_start = Some(now);
            self.error_count = 0;
        }
        self.error_count += 1;

        self.state == ConsumerState::Active && self.error_count > threshold
    }

    /// `ACTIVE → BACKOFF`: tell the client to drop the connection and retry
    /// after `delay`.
    pub fn request_reconnect_after_delay(&mut self, queue: &str, now: DateTime<Utc>, delay: Duration) {
        self.state = ConsumerState::Backoff;
        self.backoff_until = Some(
            now.checked_add_signed(delta(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );

        info!(
            queue = %queue,
            consumer = %self.id,
            errors = self.error_count,
            delay_secs = delay.as_secs(),
            "Consumer moved to backoff"
        );

        // A closed channel means the client is already gone, which is the
        // outcome being asked for.
        let _ = self.sender.send(Outbound::Reconnect {
            queue: queue.to_string(),
            delay,
        });
    }

    /// The reconnect delay has elapsed, a new registration may resume it
    pub fn can_resume(&self, now: DateTime<Utc>) -> bool {
        self.state == ConsumerState::Backoff && self.backoff_until.is_some_and(|until| now >= until)
    }

    /// Still in backoff `grace` after it was allowed back
    pub fn backoff_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.state == ConsumerState::Backoff
            && self
                .backoff_until
                .and_then(|until| until.checked_add_signed(delta(grace)))
                .is_some_and(|deadline| now > deadline)
    }

    /// `ACTIVE|BACKOFF → SHUTTING_DOWN`
    pub fn request_shutdown(&mut self, queue: &str) {
        if matches!(self.state, ConsumerState::ShuttingDown | ConsumerState::Closed) {
            return;
        }
        self.state = ConsumerState::ShuttingDown;
        info!(queue = %queue, consumer = %self.id, "Consumer shutting down");
        let _ = self.sender.send(Outbound::Shutdown {
            queue: queue.to_string(),
        });
    }

    pub(crate) fn close(&mut self) {
        self.state = ConsumerState::Closed;
    }

    /// Push a delivery towards the client. False when the connection is gone.
    pub(crate) fn deliver(&self, queue: &str, message: &Message) -> bool {
        self.sender
            .send(Outbound::Deliver(Delivery {
                queue: queue.to_string(),
                message_id: message.id,
                payload: message.payload.clone(),
                timestamp: message.created_at,
                attempt: message.attempts,
            }))
            .is_ok()
    }
}
