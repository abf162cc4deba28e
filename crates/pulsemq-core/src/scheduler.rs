//! Delivery target selection.

use pulsemq_types::{ConsumerId, DeliveryMethod};

/// Where the head of the backlog should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Round-robin pick
    One(ConsumerId),
    /// Every fanout consumer with capacity
    Many(Vec<ConsumerId>),
    /// Nobody can take it right now
    Stalled,
}

/// Picks consumers for the next message according to the delivery method.
///
/// Consumers are addressed by their position in the queue's registration
/// order; the queue reports removals through [`DeliveryScheduler::removed`]
/// so the rotation stays aligned.
#[derive(Debug)]
pub struct DeliveryScheduler {
    method: DeliveryMethod,
    cursor: usize,
}

impl DeliveryScheduler {
    pub fn new(method: DeliveryMethod) -> Self {
        Self { method, cursor: 0 }
    }

    pub fn method(&self) -> DeliveryMethod {
        self.method
    }

    pub fn select<F>(&mut self, consumers: &[ConsumerId], mut eligible: F) -> Targets
    where
        F: FnMut(&ConsumerId) -> bool,
    {
        if consumers.is_empty() {
            return Targets::Stalled;
        }

        match self.method {
            DeliveryMethod::RoundRobin => {
                let n = consumers.len();
                let start = self.cursor % n;
                for step in 0..n {
                    let idx = (start + step) % n;
                    if eligible(&consumers[idx]) {
                        self.cursor = (idx + 1) % n;
                        return Targets::One(consumers[idx].clone());
                    }
                }
                Targets::Stalled
            }
            DeliveryMethod::Fanout => {
                let targets: Vec<ConsumerId> = consumers.iter().filter(|c| eligible(c)).cloned().collect();
                if targets.is_empty() {
                    Targets::Stalled
                } else {
                    Targets::Many(targets)
                }
            }
        }
    }

    /// The consumer at `index` left; `remaining` consumers are still registered.
    pub fn removed(&mut self, index: usize, remaining: usize) {
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= remaining {
            self.cursor = 0;
        }
    }
}
