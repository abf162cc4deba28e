//! PulseMQ Core - Queue engine for the message broker
//!
//! This crate contains:
//! - MessageQueue: per-queue backlog, delivery loop and ack-timeout sweep
//! - AckTracker and DeliveryScheduler: the pieces it is built from
//! - ConsumerSession: consumer lifecycle and error accounting
//! - Broker: queue registry and protocol entry points

pub mod ack_tracker;
pub mod broker;
pub mod clock;
pub mod consumer;
pub mod queue;
pub mod scheduler;

// Re-exports
pub use ack_tracker::{AckTracker, UnackedEntry};
pub use broker::Broker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{ConsumerSession, ConsumerState, Delivery, Outbound, OutboundReceiver, OutboundSender};
pub use queue::{DeadLetter, DispatchOutcome, MessageQueue, SweepReport};
pub use scheduler::{DeliveryScheduler, Targets};
