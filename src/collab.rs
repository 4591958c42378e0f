//! Trait seams for the collaborators this crate consumes but does not own:
//! the Kademlia routing table / DHT layer, and the call-timeout scheduler.
//!
//! A real node wires in a full routing table (bucket maintenance, k-closest
//! queries, token management); those concerns are out of scope here. The
//! traits below are the contract the core depends on, plus a minimal
//! in-memory stand-in so the core's own tests don't need one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dht_wire::{Message, NodeId};
use mio::Interest;
use rand::RngCore;

use crate::call::RpcCallHandle;

/// The routing table / node-bookkeeping collaborator.
///
/// `register_id` is called once at server construction to obtain this node's
/// derived id; `remove_id` releases it back on `stop()`. `timeout` is invoked
/// by the external call scheduler (not by this crate) when a call's deadline
/// elapses; `incoming_message` is notified of every message this server
/// accepts for processing, matched or not.
pub trait RoutingTable: Send + Sync {
    fn register_id(&self) -> NodeId;
    fn remove_id(&self, id: NodeId);
    fn timeout(&self, call: &RpcCallHandle);
    fn incoming_message(&self, msg: &Message, source: SocketAddr);
}

/// The message-apply visitor collaborator: each correctly classified message
/// is hooked through `incoming_message` for bookkeeping, then `apply` runs
/// its type-specific effect (e.g. a `find_node` query populating a response).
pub trait DhtLayer: Send + Sync {
    fn incoming_message(&self, msg: &Message, source: SocketAddr);
    fn apply(&self, msg: &Message, source: SocketAddr);
}

/// A routing table stand-in that hands out random ids and otherwise no-ops.
///
/// Suitable for the core's own tests and as a documented extension point:
/// an embedder plugs in a real bucket-maintaining routing table by
/// implementing [`RoutingTable`] themselves.
#[derive(Default)]
pub struct InMemoryRoutingTable {
    timeouts_observed: AtomicU64,
    messages_observed: AtomicU64,
}

impl InMemoryRoutingTable {
    pub fn new() -> Self {
        InMemoryRoutingTable::default()
    }

    pub fn timeouts_observed(&self) -> u64 {
        self.timeouts_observed.load(Ordering::Relaxed)
    }

    pub fn messages_observed(&self) -> u64 {
        self.messages_observed.load(Ordering::Relaxed)
    }
}

impl RoutingTable for InMemoryRoutingTable {
    fn register_id(&self) -> NodeId {
        let mut id = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut id);
        id
    }

    fn remove_id(&self, _id: NodeId) {}

    fn timeout(&self, _call: &RpcCallHandle) {
        self.timeouts_observed.fetch_add(1, Ordering::Relaxed);
    }

    fn incoming_message(&self, _msg: &Message, _source: SocketAddr) {
        self.messages_observed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A DHT layer stand-in that records what it was asked to apply, without
/// implementing any lookup/bucket logic.
#[derive(Default)]
pub struct NullDhtLayer {
    applied: AtomicU64,
}

impl NullDhtLayer {
    pub fn new() -> Self {
        NullDhtLayer::default()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl DhtLayer for NullDhtLayer {
    fn incoming_message(&self, _msg: &Message, _source: SocketAddr) {}

    fn apply(&self, _msg: &Message, _source: SocketAddr) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }
}

/// The connection manager / reactor collaborator (§6): registers
/// [`Selectable`]s for readiness delivery and lets them request a change in
/// the events they're interested in.
///
/// A real embedder may run one reactor shared by several sockets (one per
/// address family, per the base design's note on IPv4/IPv6 coexistence);
/// this crate's own [`crate::reactor::MioReactor`] is one concrete
/// implementation.
pub trait Reactor: Send + Sync {
    fn register(&self, selectable: std::sync::Arc<dyn Selectable>) -> std::io::Result<mio::Token>;
    fn deregister(&self, token: mio::Token);
    fn interest_ops_changed(&self, token: mio::Token);

    /// The underlying mio registry, needed by a [`Selectable`]'s own
    /// concrete socket to perform its initial `register`/`reregister`
    /// (the reactor tracks bookkeeping; the selectable owns the source).
    fn registry(&self) -> &mio::Registry;
}

/// A reactor-managed endpoint: told when it becomes readable/writable, and
/// asked what it wants to be polled for next.
pub trait Selectable: Send + Sync {
    fn selection_event(&self, readable: bool, writable: bool);
    fn calc_interest_ops(&self) -> Interest;

    /// Re-registers this endpoint's interest with `registry` using its
    /// current `calc_interest_ops()`. Called by the reactor in response to
    /// `interest_ops_changed`; the endpoint (not the reactor) owns the
    /// underlying mio source, so it alone can perform the reregister.
    fn reregister(&self, registry: &mio::Registry) -> std::io::Result<()>;
}
