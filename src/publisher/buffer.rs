//! Bounded FIFO of messages that could not be delivered.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::warn;

use super::PendingMessage;

/// What to do when the buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep what is buffered and drop the incoming message.
    #[default]
    DropNewest,
    /// Evict the oldest buffered message to make room.
    DropOldest,
}

/// Bounded retry buffer. Dequeue order equals enqueue order.
#[derive(Debug)]
pub struct RetryBuffer {
    messages: VecDeque<PendingMessage>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl RetryBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
            policy,
        }
    }

    /// Buffer a message. Returns whether `message` itself was kept.
    pub fn push(&mut self, message: PendingMessage) -> bool {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return true;
        }

        match self.policy {
            OverflowPolicy::DropNewest => {
                warn!(
                    max_buffer = self.capacity,
                    routing_key = %message.routing_key,
                    "MaxBuffer filled, ignoring message"
                );
                false
            }
            OverflowPolicy::DropOldest => {
                let Some(evicted) = self.messages.pop_front() else {
                    warn!(max_buffer = self.capacity, "retry buffer disabled, ignoring message");
                    return false;
                };
                warn!(
                    max_buffer = self.capacity,
                    routing_key = %evicted.routing_key,
                    "MaxBuffer filled, dropping oldest message"
                );
                self.messages.push_back(message);
                true
            }
        }
    }

    pub fn front(&self) -> Option<&PendingMessage> {
        self.messages.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages.iter()
    }
}
