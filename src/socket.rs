//! The socket handler: a non-blocking UDP endpoint with a readiness-driven
//! read loop and a single-writer write state machine (§4.5).
//!
//! Grounded on the teacher's `Connection::flush`/`Connection::recv`
//! (`src/rpc/connection.rs`): loop-until-`WouldBlock` sends and receives
//! over a non-blocking socket, generalized from TCP framing to UDP
//! datagrams and from a per-connection buffer to the protocol's single
//! thread-local write buffer (§9 design note).

use std::cell::RefCell;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use log::{error, trace, warn};
use mio::{Interest, Token};
use mio::net::UdpSocket as MioUdpSocket;
use parking_lot::Mutex;

use crate::collab::{Reactor, Selectable};
use crate::pipeline::{EnqueuedSend, Pipeline};
use crate::stats::{MessageKind, Stats};
use crate::worker::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    NotInitialized = 0,
    Idle = 1,
    Writing = 2,
    AwaitingReadiness = 3,
    Closed = 4,
}

impl WriterState {
    fn from_u8(v: u8) -> WriterState {
        match v {
            0 => WriterState::NotInitialized,
            1 => WriterState::Idle,
            2 => WriterState::Writing,
            3 => WriterState::AwaitingReadiness,
            _ => WriterState::Closed,
        }
    }
}

thread_local! {
    /// Per-thread reusable buffer sized to the protocol's maximum packet.
    /// A performance contract, not a correctness one (§9): safe to replace
    /// with per-send allocation.
    static WRITE_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(1500));
}

/// `true` for the transient send failures the write state machine treats
/// as "try again once writable" rather than a permanent failure: a short
/// write (0 bytes) or the OS reporting no buffer space.
fn is_transient_send_failure(result: &io::Result<usize>) -> bool {
    match result {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_enobufs()),
    }
}

/// `ENOBUFS` on Linux; kept as a function rather than a `cfg`-gated
/// constant table since this crate only targets the one platform its
/// `socket2` dependency is exercised on.
fn libc_enobufs() -> i32 {
    105
}

pub struct SocketHandler {
    socket: Mutex<MioUdpSocket>,
    token: Mutex<Option<Token>>,
    pipeline: Arc<Pipeline>,
    state: AtomicU8,
    max_packet_size: usize,
    num_sent: Arc<AtomicU64>,
    num_received: Arc<AtomicU64>,
    stats: Arc<Stats>,
    on_datagram: Box<dyn Fn(Vec<u8>, SocketAddr) + Send + Sync>,
    reactor: Arc<dyn Reactor>,
    scheduler: Arc<Scheduler>,
    self_ref: Mutex<Weak<SocketHandler>>,
}

impl SocketHandler {
    pub fn new(
        socket: MioUdpSocket,
        pipeline: Arc<Pipeline>,
        max_packet_size: usize,
        num_sent: Arc<AtomicU64>,
        num_received: Arc<AtomicU64>,
        stats: Arc<Stats>,
        reactor: Arc<dyn Reactor>,
        scheduler: Arc<Scheduler>,
        on_datagram: impl Fn(Vec<u8>, SocketAddr) + Send + Sync + 'static,
    ) -> io::Result<Arc<SocketHandler>> {
        let handler = Arc::new(SocketHandler {
            // `register` happens below, once we have a `Token`; park the
            // socket in the mutex now so the handler is fully constructed
            // before it's shared as `Arc<dyn Selectable>`.
            socket: Mutex::new(socket),
            token: Mutex::new(None),
            pipeline,
            state: AtomicU8::new(WriterState::NotInitialized as u8),
            max_packet_size,
            num_sent,
            num_received,
            stats,
            on_datagram: Box::new(on_datagram),
            reactor,
            scheduler,
            self_ref: Mutex::new(Weak::new()),
        });
        *handler.self_ref.lock() = Arc::downgrade(&handler);

        let token = handler.reactor.register(handler.clone())?;
        {
            let mut guard = handler.socket.lock();
            handler.reactor.registry().register(&mut *guard, token, Interest::READABLE)?;
        }
        *handler.token.lock() = Some(token);
        handler.state.store(WriterState::Idle as u8, Ordering::Release);
        Ok(handler)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.lock().local_addr()
    }

    pub fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn close(&self) {
        self.state.store(WriterState::Closed as u8, Ordering::Release);
        if let Some(token) = self.token.lock().take() {
            let _ = self.reactor.registry().deregister(&mut *self.socket.lock());
            self.reactor.deregister(token);
        }
    }

    /// Drives the write state machine (§4.5). Returns once the pipeline is
    /// drained, the socket reports it would block, or a send fails
    /// permanently.
    pub fn write_event(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                WriterState::Idle as u8,
                WriterState::Writing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        loop {
            let send = match self.pipeline.pop() {
                Some(send) => send,
                None => break,
            };

            let result = self.send_one(&send);
            if is_transient_send_failure(&result) {
                trace!("write would block; requeueing send to {}", send.destination);
                self.pipeline.push(send);
                self.state.store(WriterState::AwaitingReadiness as u8, Ordering::Release);
                self.request_writable();
                return;
            }

            match result {
                Ok(n) => {
                    self.num_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_sent(MessageKind::of(&send.message), n);
                    if let Some(call) = &send.call {
                        call.notify_sent();
                    }
                }
                Err(e) => {
                    warn!("send to {} failed permanently: {e}", send.destination);
                    if let Some(call) = &send.call {
                        call.complete_with_send_failure(&e);
                    } else {
                        error!("dropping fire-and-forget send to {}: {e}", send.destination);
                    }
                    break;
                }
            }
        }

        if self
            .state
            .compare_exchange(
                WriterState::Writing as u8,
                WriterState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            && !self.pipeline.is_empty()
        {
            // A producer raced us between the drain check and the CAS
            // above; the design requires scheduling another pass rather
            // than recursing here for stack safety. The caller (the
            // server's dispatch path) resubmits via the shared scheduler.
            self.request_another_pass();
        }
    }

    fn send_one(&self, send: &EnqueuedSend) -> io::Result<usize> {
        WRITE_BUF.with(|cell| {
            let mut buf = cell.borrow_mut();
            buf.clear();
            let encoded = send.message.encode();
            if encoded.len() > self.max_packet_size {
                return Err(io::Error::new(ErrorKind::InvalidInput, "encoded message exceeds max packet size"));
            }
            buf.extend_from_slice(&encoded);
            self.socket.lock().send_to(&buf, send.destination)
        })
    }

    fn request_writable(&self) {
        if let Some(token) = *self.token.lock() {
            self.reactor.interest_ops_changed(token);
        }
    }

    /// Schedules another `write_event` pass on the shared worker pool
    /// rather than recursing, per §4.5's stack-safety requirement.
    fn request_another_pass(&self) {
        let weak = self.self_ref.lock().clone();
        self.scheduler.execute(move || {
            if let Some(handler) = weak.upgrade() {
                handler.write_event();
            }
        });
    }

    /// Reads every datagram currently available without blocking, applying
    /// the prefilter (P5) before handing `(payload, source)` off via
    /// `on_datagram`. The buffer is resized to `max_packet_size` and reused
    /// across iterations; each accepted datagram is copied into its own
    /// freshly allocated `Vec` before leaving this loop (§4.5 rationale:
    /// bound the reactor thread's worst case to O(receive+copy)).
    pub fn read_event(&self) {
        let mut buf = vec![0u8; self.max_packet_size];
        loop {
            let (len, source) = {
                let socket = self.socket.lock();
                match socket.recv_from(&mut buf) {
                    Ok(result) => result,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("recv_from failed: {e}");
                        break;
                    }
                }
            };

            self.num_received.fetch_add(1, Ordering::Relaxed);

            if !passes_prefilter(&buf[..len], source) {
                trace!("dropping datagram from {source} at prefilter");
                continue;
            }

            (self.on_datagram)(buf[..len].to_vec(), source);
        }
    }
}

/// The read-loop prefilter (P5): rejects datagrams before any decoding
/// allocation. Does not consult the spam throttle — that's applied by the
/// caller, which also needs to report `is_spam` results per-source outside
/// this module's concerns.
pub fn passes_prefilter(payload: &[u8], source: SocketAddr) -> bool {
    payload.len() >= 10 && payload[0] == b'd' && source.port() != 0
}

impl Selectable for SocketHandler {
    fn selection_event(&self, readable: bool, writable: bool) {
        if readable {
            self.read_event();
        }
        if writable {
            self.state.store(WriterState::Idle as u8, Ordering::Release);
            if let Some(token) = *self.token.lock() {
                if let Err(e) = self.reactor.registry().reregister(&mut *self.socket.lock(), token, Interest::READABLE) {
                    error!("failed to clear writable interest: {e}");
                }
            }
            self.request_another_pass();
        }
    }

    fn calc_interest_ops(&self) -> Interest {
        match self.state() {
            WriterState::AwaitingReadiness => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    fn reregister(&self, registry: &mio::Registry) -> io::Result<()> {
        if let Some(token) = *self.token.lock() {
            registry.reregister(&mut *self.socket.lock(), token, self.calc_interest_ops())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefilter_rejects_short_payloads() {
        let source: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(!passes_prefilter(b"short", source));
    }

    #[test]
    fn prefilter_rejects_non_dict_payloads() {
        let source: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(!passes_prefilter(b"l1:ae-not-a-dict", source));
    }

    #[test]
    fn prefilter_rejects_zero_source_port() {
        let source: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(!passes_prefilter(b"d1:ad1:id20:aaaaaaaaaaaaaaaaaaaaee", source));
    }

    #[test]
    fn prefilter_accepts_well_formed_dict_payload() {
        let source: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(passes_prefilter(b"d1:ad1:id20:aaaaaaaaaaaaaaaaaaaaee", source));
    }
}
