//! Per-message-type sent/received counters, published across threads.
//!
//! Grounded on the teacher's counter discipline (`numReceived`/`numSent`
//! publish-only atomics, §3/§5 of the design): a [`Stats`] is the same idea
//! broken out by message kind instead of collapsed into two totals.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dht_wire::Message;

/// Coarse message kind used as the counter key: fine enough to distinguish
/// queries/responses/errors without keying on every `Method` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Query,
    Response,
    Error,
}

impl MessageKind {
    pub fn of(msg: &Message) -> MessageKind {
        if msg.is_query() {
            MessageKind::Query
        } else if msg.is_response() {
            MessageKind::Response
        } else {
            MessageKind::Error
        }
    }
}

#[derive(Default)]
pub struct Stats {
    sent: DashMap<MessageKind, AtomicU64>,
    received: DashMap<MessageKind, AtomicU64>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn record_sent(&self, kind: MessageKind, bytes: usize) {
        self.sent.entry(kind).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, kind: MessageKind, bytes: usize) {
        self.received.entry(kind).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sent_count(&self, kind: MessageKind) -> u64 {
        self.sent.get(&kind).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn received_count(&self, kind: MessageKind) -> u64 {
        self.received.get(&kind).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_kind_independently() {
        let stats = Stats::new();
        stats.record_sent(MessageKind::Query, 40);
        stats.record_sent(MessageKind::Query, 40);
        stats.record_received(MessageKind::Response, 60);
        assert_eq!(stats.sent_count(MessageKind::Query), 2);
        assert_eq!(stats.sent_count(MessageKind::Response), 0);
        assert_eq!(stats.received_count(MessageKind::Response), 1);
        assert_eq!(stats.bytes_sent(), 80);
        assert_eq!(stats.bytes_received(), 60);
    }
}
