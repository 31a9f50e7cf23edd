//! Per-client bounded delivery outbox (spec.md §4.6).

use crate::types::OutboundMessage;
use std::collections::{HashSet, VecDeque};

/// Default bound on unacknowledged messages held per client.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1000;

/// A per-client outbox: at-least-once delivery with bounded memory. On
/// overflow the oldest unacked message is dropped; missed messages are
/// recovered on reconnect via resumption from the last ack (spec.md §4.6).
pub struct Outbox {
    capacity: usize,
    pending: VecDeque<OutboundMessage>,
    acked: HashSet<u64>,
    dropped: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: VecDeque::new(),
            acked: HashSet::new(),
            dropped: 0,
        }
    }

    /// Enqueues a message, dropping the oldest unacked one if over capacity.
    pub fn push(&mut self, message: OutboundMessage) {
        if self.pending.len() >= self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(delivery_id = dropped.delivery_id(), "outbox overflow, dropping oldest unacked");
                self.dropped += 1;
            }
        }
        self.pending.push_back(message);
    }

    /// All currently-pending (unacked) messages, in delivery order.
    pub fn pending(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.pending.iter()
    }

    /// Acknowledges a delivery id. Idempotent: re-acking is a no-op.
    pub fn ack(&mut self, id: u64) {
        if self.acked.insert(id) {
            self.pending.retain(|m| m.delivery_id() != id);
        }
    }

    pub fn is_acked(&self, id: u64) -> bool {
        self.acked.contains(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
