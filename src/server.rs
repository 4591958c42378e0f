//! `RpcServer`: the component that ties the call table, send pipeline,
//! socket handler, reactor, worker pool, throttle, RTT estimator, and
//! consensus tracker together into the public contract of §4.1, plus the
//! inbound packet classification pipeline of §4.4.
//!
//! Grounded on the teacher's `rpc.rs`/`Rpc` struct: one object owning the
//! connection manager, dispatching calls by tag, and exposing lifecycle
//! methods to its embedder. This generalizes that shape from a TCP/protobuf
//! RPC client to a UDP DHT server with call admission and inbound
//! classification instead of protobuf framing.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dht_wire::{Body, ErrorCode, Message, ParseError};
use log::{debug, trace, warn};
use mio::net::UdpSocket as MioUdpSocket;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::call::{RpcCall, RpcCallHandle, RpcCallListener};
use crate::collab::{DhtLayer, RoutingTable};
use crate::config::RpcServerConfig;
use crate::consensus::{ConsensusTracker, is_globally_unicast};
use crate::error::{Error, Result};
use crate::estimator::{Reachability, TimeoutFilter};
use crate::mtid::MTID_LEN;
use crate::pipeline::{EnqueuedSend, Pipeline};
use crate::reactor::MioReactor;
use crate::socket::SocketHandler;
use crate::stats::{MessageKind, Stats};
use crate::table::CallTable;
use crate::throttle::SpamThrottle;
use crate::worker::Scheduler;

const WORKER_THREADS: usize = 4;
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(2000);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Initial = 0,
    Running = 1,
    Stopped = 2,
}

type EnqueueListener = dyn Fn(&RpcCallHandle) + Send + Sync;

/// One per-socket DHT RPC server (§3). Constructed with `new`, brought up
/// with `start`, torn down with `stop`; every other method may be called
/// from any thread once constructed.
pub struct RpcServer {
    state: AtomicU8,
    bind_addr: SocketAddr,
    config: RpcServerConfig,
    derived_id: dht_wire::NodeId,

    table: Arc<CallTable>,
    pipeline: Arc<Pipeline>,
    stats: Arc<Stats>,
    num_sent: Arc<AtomicU64>,
    num_received: Arc<AtomicU64>,

    start_time: Mutex<Option<Instant>>,
    reachability: Mutex<Option<Reachability>>,
    timeout_filter: Arc<TimeoutFilter>,
    throttle: SpamThrottle,
    consensus: ConsensusTracker,

    routing_table: Arc<dyn RoutingTable>,
    dht_layer: Arc<dyn DhtLayer>,

    reactor: Mutex<Option<Arc<MioReactor>>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    socket_handler: Mutex<Option<Arc<SocketHandler>>>,

    enqueue_listeners: ArcSwap<Vec<Arc<EnqueueListener>>>,
    self_ref: Mutex<Weak<RpcServer>>,
}

impl RpcServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: RpcServerConfig,
        routing_table: Arc<dyn RoutingTable>,
        dht_layer: Arc<dyn DhtLayer>,
    ) -> Arc<RpcServer> {
        let derived_id = routing_table.register_id();
        let table = Arc::new(CallTable::new(config.max_active_calls));
        let throttle = SpamThrottle::new(config.throttle_max_per_interval, config.throttle_interval);
        let consensus = ConsensusTracker::new(config.consensus_capacity, config.consensus_min_for_election);

        let server = Arc::new(RpcServer {
            state: AtomicU8::new(ServerState::Initial as u8),
            bind_addr,
            config,
            derived_id,
            table,
            pipeline: Arc::new(Pipeline::new()),
            stats: Arc::new(Stats::new()),
            num_sent: Arc::new(AtomicU64::new(0)),
            num_received: Arc::new(AtomicU64::new(0)),
            start_time: Mutex::new(None),
            reachability: Mutex::new(None),
            timeout_filter: Arc::new(TimeoutFilter::new(DEFAULT_STALL_TIMEOUT)),
            throttle,
            consensus,
            routing_table,
            dht_layer,
            reactor: Mutex::new(None),
            scheduler: Mutex::new(None),
            socket_handler: Mutex::new(None),
            enqueue_listeners: ArcSwap::from_pointee(Vec::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *server.self_ref.lock() = Arc::downgrade(&server);
        server
    }

    /// Opens the socket, registers it with a fresh reactor, and starts the
    /// shared worker pool. Requires `state == INITIAL` (§4.1).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.state
            .compare_exchange(
                ServerState::Initial as u8,
                ServerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::IllegalState("start() requires state == INITIAL"))?;

        let std_socket = bind_reusable(self.bind_addr)?;
        let mio_socket = MioUdpSocket::from_std(std_socket);

        let reactor = MioReactor::start()?;
        let scheduler = Arc::new(Scheduler::new(WORKER_THREADS));

        let weak_server = self.self_ref.lock().clone();
        let datagram_scheduler = scheduler.clone();
        let handler = SocketHandler::new(
            mio_socket,
            self.pipeline.clone(),
            self.config.max_packet_size,
            self.num_sent.clone(),
            self.num_received.clone(),
            self.stats.clone(),
            reactor.clone(),
            scheduler.clone(),
            move |payload, source| {
                let weak_server = weak_server.clone();
                datagram_scheduler.execute(move || {
                    if let Some(server) = weak_server.upgrade() {
                        server.process_datagram(payload, source);
                    }
                });
            },
        )?;

        let now = Instant::now();
        *self.start_time.lock() = Some(now);
        *self.reachability.lock() = Some(Reachability::new(self.config.reachability_timeout, now));
        self.timeout_filter.reset();
        *self.reactor.lock() = Some(reactor);
        *self.scheduler.lock() = Some(scheduler);
        *self.socket_handler.lock() = Some(handler);
        Ok(())
    }

    /// Idempotent once STOPPED (§4.1, P6): releases the derived id, closes
    /// the socket, drains the pipeline, and stops the reactor and worker
    /// pool.
    pub fn stop(&self) {
        if self.state.swap(ServerState::Stopped as u8, Ordering::AcqRel) == ServerState::Stopped as u8 {
            return;
        }
        self.routing_table.remove_id(self.derived_id);
        if let Some(handler) = self.socket_handler.lock().take() {
            handler.close();
        }
        self.pipeline.drain_discard();
        if let Some(reactor) = self.reactor.lock().take() {
            reactor.stop();
        }
        self.scheduler.lock().take();
    }

    /// Constructs a ping carrying the derived id and dispatches it.
    /// Callers that already know a peer is a verified routing-table entry
    /// should construct the `RpcCall` themselves (`RpcCall::new(.., true)`)
    /// and call [`RpcServer::do_call`] directly, since a bare address gives
    /// no way to check table membership.
    pub fn ping(self: &Arc<Self>, addr: SocketAddr) -> Arc<RpcCall> {
        let message = Message::ping_query(Vec::new(), self.derived_id);
        let call = RpcCall::new(message, addr, false);
        self.do_call(call.clone());
        call
    }

    /// Admits `call` into the call table with bounded concurrency (§4.2),
    /// notifying `on_enqueue` observers first.
    pub fn do_call(self: &Arc<Self>, call: Arc<RpcCall>) {
        self.notify_enqueue(&call);
        if let Ok(admitted) = self.table.try_admit(call) {
            self.dispatch(admitted);
        }
    }

    /// Enqueues a fire-and-forget send with no call correlation.
    pub fn send_message(self: &Arc<Self>, message: Message, destination: SocketAddr) {
        let send =
            EnqueuedSend::new(message, destination, None, self.derived_id, self.timeout_filter.stall_timeout());
        self.pipeline.push(send);
        self.kick_writer();
    }

    pub fn find_call(&self, mtid: &[u8]) -> Option<Arc<RpcCall>> {
        self.table.find(mtid)
    }

    /// Driven by an external periodic tick (§4.7). Returns the reachable
    /// state after this tick; resets the timeout filter if reachability
    /// just dropped.
    pub fn check_reachability(&self, now: Instant) -> bool {
        let num_received = self.num_received.load(Ordering::Relaxed);
        match self.reachability.lock().as_ref() {
            Some(reachability) => {
                if reachability.check(num_received, now) {
                    self.timeout_filter.reset();
                }
                reachability.is_reachable()
            }
            None => true,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability.lock().as_ref().map(Reachability::is_reachable).unwrap_or(true)
    }

    pub fn public_address(&self) -> Option<SocketAddr> {
        self.socket_handler.lock().as_ref().and_then(|h| h.local_addr().ok())
    }

    pub fn consensus_external_address(&self) -> Option<SocketAddr> {
        self.consensus.elected()
    }

    /// The locally bound globally-unicast address if one exists, else the
    /// consensus-elected address (§4.1).
    pub fn combined_public_address(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.public_address() {
            if is_globally_unicast(addr.ip()) {
                return Some(addr);
            }
        }
        self.consensus_external_address()
    }

    pub fn on_declog(&self, task: Box<dyn FnOnce() + Send>) {
        self.table.on_declog(task);
    }

    /// Registers an observer of every admitted call (§4.1, §6). The list is
    /// copy-on-write: registration is rare, iteration on every `do_call` is
    /// hot.
    pub fn on_enqueue(&self, listener: Arc<EnqueueListener>) {
        let mut updated = (**self.enqueue_listeners.load()).clone();
        updated.push(listener);
        self.enqueue_listeners.store(Arc::new(updated));
    }

    pub fn timeout_filter(&self) -> &Arc<TimeoutFilter> {
        &self.timeout_filter
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn num_active_rpc_calls(&self) -> usize {
        self.table.len()
    }

    pub fn num_sent(&self) -> u64 {
        self.num_sent.load(Ordering::Relaxed)
    }

    pub fn num_received(&self) -> u64 {
        self.num_received.load(Ordering::Relaxed)
    }

    pub fn derived_id(&self) -> dht_wire::NodeId {
        self.derived_id
    }

    fn notify_enqueue(&self, call: &Arc<RpcCall>) {
        let handle = call.handle();
        for listener in self.enqueue_listeners.load().iter() {
            listener(&handle);
        }
    }

    /// Installs the server's completion listener, stamps the call with the
    /// current stall timeout, and enqueues its send (§4.2 dispatch step).
    fn dispatch(self: &Arc<Self>, call: Arc<RpcCall>) {
        call.add_listener(Arc::new(CallCompletionListener { server: Arc::downgrade(self) }));
        // `call.request` is built before admission, when no transaction id
        // has been assigned yet; the outgoing wire message must carry the
        // id the table correlates responses against.
        let mut request = call.request.clone();
        request.transaction_id = call.mtid().expect("dispatched calls carry an assigned mtid");
        let send = EnqueuedSend::new(
            request,
            call.destination,
            Some(call.clone()),
            self.derived_id,
            self.timeout_filter.stall_timeout(),
        );
        self.pipeline.push(send);
        self.kick_writer();
    }

    fn kick_writer(&self) {
        if let Some(handler) = self.socket_handler.lock().clone() {
            handler.write_event();
        }
    }

    /// The read-loop-to-worker handoff target (§4.5 rationale): decode,
    /// parse, classify, and dispatch one datagram off the reactor thread.
    fn process_datagram(self: &Arc<Self>, payload: Vec<u8>, source: SocketAddr) {
        if self.throttle.is_spam(source.ip()) {
            trace!("dropping datagram from {source}: rate limited");
            return;
        }

        let value = match dht_wire::BValue::decode(&payload) {
            Ok(value) => value,
            Err(e) => {
                debug!("bencode decode failed from {source}: {e}");
                self.send_message(Message::error(vec![0u8; 4], ErrorCode::Protocol, "invalid bencode"), source);
                return;
            }
        };
        let transaction_id = value
            .get(b"t")
            .and_then(dht_wire::BValue::as_bytes)
            .map(|b| b.to_vec())
            .unwrap_or_else(|| vec![0u8; 4]);

        let message = match Message::decode(&payload, self.table.as_ref()) {
            Ok(message) => message,
            Err(e) => {
                debug!("message parse failed from {source}: {e}");
                self.send_message(Message::error(transaction_id, error_code_for(&e), e.to_string()), source);
                return;
            }
        };

        self.stats.record_received(MessageKind::of(&message), payload.len());
        self.classify(message, source);
    }

    fn classify(self: &Arc<Self>, message: Message, source: SocketAddr) {
        match &message.body {
            Body::Response(_) => self.classify_response(message, source),
            Body::Query(_) | Body::Error(_) => self.handle_message(message, source),
        }
    }

    /// Response dispatch (§4.4 item 4): wrong-length mtid, no matching
    /// call (stray, possibly within grace), source/destination mismatch
    /// (stall injection), or a clean match.
    fn classify_response(self: &Arc<Self>, message: Message, source: SocketAddr) {
        if message.transaction_id.len() != MTID_LEN {
            debug!("response from {source} has a wrong-length transaction id");
            self.send_message(
                Message::error(message.transaction_id.clone(), ErrorCode::Server, "invalid transaction id length"),
                source,
            );
            return;
        }

        let Some(call) = self.table.find(&message.transaction_id) else {
            let uptime = (*self.start_time.lock()).map(|t| t.elapsed()).unwrap_or_default();
            if uptime > self.config.stray_response_grace {
                debug!("stray response from {source} outside the grace window");
                self.send_message(
                    Message::error(message.transaction_id.clone(), ErrorCode::Server, "no matching transaction"),
                    source,
                );
            } else {
                trace!("dropping stray response from {source} within the grace window");
            }
            return;
        };

        if source != call.destination {
            warn!("response from {source} does not match call destination {}", call.destination);
            call.inject_stall();
            return;
        }

        if self.table.remove_if_same(&message.transaction_id, &call) {
            self.timeout_filter.record_outcome(call.known_reachable, false);
            self.timeout_filter.record_rtt(call.known_reachable, call.age());
            call.complete_with_response(message.clone());
            for freshly_admitted in self.table.do_queued_calls() {
                self.dispatch(freshly_admitted);
            }
        }
        self.handle_message(message, source);
    }

    /// Runs on any correctly-classified message (§4.4): feeds the consensus
    /// tracker from a response's observed-address field, notifies the
    /// routing table and DHT layer, then applies the message.
    fn handle_message(&self, message: Message, source: SocketAddr) {
        if let Some(response) = message.as_response() {
            if let Some(observed) = response.observed_addr {
                if is_globally_unicast(observed.ip()) {
                    self.consensus.observe(source.ip(), observed);
                }
            }
        }
        self.routing_table.incoming_message(&message, source);
        self.dht_layer.incoming_message(&message, source);
        self.dht_layer.apply(&message, source);
    }
}

fn error_code_for(e: &ParseError) -> ErrorCode {
    match e {
        ParseError::Bencode(_) | ParseError::NotADict => ErrorCode::Protocol,
        _ => ErrorCode::Server,
    }
}

fn bind_reusable(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Completes the call (response/timeout/send-failure), folds the outcome
/// into the RTT estimator, removes it from the table identity-conditionally,
/// and dispatches anything the completion freed up (§4.2).
///
/// A separate struct (rather than `RpcServer` itself implementing the
/// listener trait) so the call only ever holds a `Weak` back-reference,
/// matching §9's "listener backrefs" note.
struct CallCompletionListener {
    server: Weak<RpcServer>,
}

impl RpcCallListener for CallCompletionListener {
    // `on_response` is intentionally left at its no-op default: the
    // matched-response path (`classify_response`) already records the
    // outcome/RTT and removes the call before firing this listener.

    fn on_timeout(&self, call: &RpcCall) {
        self.terminate(call, true);
    }

    fn on_send_failed(&self, call: &RpcCall, _error: &io::Error) {
        self.terminate(call, true);
    }
}

impl CallCompletionListener {
    fn terminate(&self, call: &RpcCall, timed_out: bool) {
        let Some(server) = self.server.upgrade() else { return };
        server.timeout_filter.record_outcome(call.known_reachable, timed_out);
        if let Some(mtid) = call.mtid() {
            server.table.remove_if_same(&mtid, call);
        }
        for freshly_admitted in server.table.do_queued_calls() {
            server.dispatch(freshly_admitted);
        }
    }
}
