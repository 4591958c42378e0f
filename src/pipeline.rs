//! The outbound send pipeline: an ordered queue of [`EnqueuedSend`]s feeding
//! a single writer (see [`crate::socket`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dht_wire::{Message, NodeId};

use crate::call::RpcCall;

/// A pending transmission pairing a message with an optional owning call.
///
/// Constructed at enqueue time (not at write time) so the invariants in
/// §3 of the design hold before the message ever reaches the writer: it
/// always carries the server's derived id, ping/find_node responses carry
/// the destination as the "you appear as" observation, and a call's
/// expected RTT is stamped from the current stall timeout unless a caller
/// already pinned an explicit override.
pub struct EnqueuedSend {
    pub message: Message,
    pub destination: SocketAddr,
    pub call: Option<Arc<RpcCall>>,
}

impl EnqueuedSend {
    pub fn new(
        mut message: Message,
        destination: SocketAddr,
        call: Option<Arc<RpcCall>>,
        derived_id: NodeId,
        stall_timeout: Duration,
    ) -> EnqueuedSend {
        stamp_id(&mut message, derived_id);
        if let Some(response) = message.as_response_mut() {
            response.observed_addr = Some(destination);
        }
        if let Some(call) = &call {
            call.set_expected_rtt(stall_timeout);
        }
        EnqueuedSend { message, destination, call }
    }
}

fn stamp_id(message: &mut Message, derived_id: NodeId) {
    match &mut message.body {
        dht_wire::Body::Query(query) => query.args.id = derived_id,
        dht_wire::Body::Response(response) => response.id = derived_id,
        dht_wire::Body::Error(_) => {}
    }
}

/// Unbounded FIFO of [`EnqueuedSend`]s. Multiple producers enqueue freely;
/// the writer-state CAS in [`crate::socket::SocketHandler`] enforces that at
/// most one thread ever drains it at a time.
#[derive(Default)]
pub struct Pipeline {
    queue: SegQueue<EnqueuedSend>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    pub fn push(&self, send: EnqueuedSend) {
        self.queue.push(send);
    }

    pub fn pop(&self) -> Option<EnqueuedSend> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains and discards every pending send, used by `stop()` (P6).
    pub fn drain_discard(&self) {
        while self.queue.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_wire::Method;

    fn id(b: u8) -> NodeId {
        [b; 20]
    }

    #[test]
    fn new_query_is_stamped_with_derived_id() {
        let msg = Message::ping_query(b"aa".to_vec(), id(0));
        let send = EnqueuedSend::new(
            msg,
            "127.0.0.1:6881".parse().unwrap(),
            None,
            id(9),
            Duration::from_secs(2),
        );
        assert_eq!(send.message.as_query().unwrap().args.id, id(9));
        assert_eq!(send.message.as_query().unwrap().method, Method::Ping);
    }

    #[test]
    fn response_carries_destination_as_observed_addr() {
        let response = dht_wire::Response { id: id(1), ..Default::default() };
        let msg = Message::response(b"bb".to_vec(), response);
        let destination: SocketAddr = "203.0.113.9:6881".parse().unwrap();
        let send = EnqueuedSend::new(msg, destination, None, id(9), Duration::from_secs(2));
        assert_eq!(send.message.as_response().unwrap().observed_addr, Some(destination));
    }

    #[test]
    fn send_with_call_stamps_expected_rtt() {
        let call = RpcCall::new(
            Message::ping_query(b"aa".to_vec(), id(0)),
            "127.0.0.1:6881".parse().unwrap(),
            false,
        );
        let msg = Message::ping_query(b"aa".to_vec(), id(0));
        let send = EnqueuedSend::new(
            msg,
            "127.0.0.1:6881".parse().unwrap(),
            Some(call.clone()),
            id(9),
            Duration::from_millis(1500),
        );
        assert_eq!(send.call.unwrap().expected_rtt(), Duration::from_millis(1500));
    }

    #[test]
    fn pipeline_is_fifo_and_drainable() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        for t in [b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()] {
            let msg = Message::ping_query(t, id(1));
            pipeline.push(EnqueuedSend::new(
                msg,
                "127.0.0.1:6881".parse().unwrap(),
                None,
                id(1),
                Duration::from_secs(1),
            ));
        }
        assert_eq!(pipeline.pop().unwrap().message.transaction_id, b"aa");
        pipeline.drain_discard();
        assert!(pipeline.is_empty());
    }
}
