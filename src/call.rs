use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dht_wire::Message;
use parking_lot::Mutex;

/// Observer of a single [`RpcCall`]'s lifecycle events.
///
/// Implementors must not block: these fire from whichever thread completed
/// the call (a worker thread for `on_response`, the external call scheduler
/// for `on_timeout`, the reactor/writer for `on_sent`/`on_send_failed`).
pub trait RpcCallListener: Send + Sync {
    fn on_sent(&self, _call: &RpcCall) {}
    fn on_response(&self, _call: &RpcCall, _response: &Message) {}
    fn on_timeout(&self, _call: &RpcCall) {}
    fn on_stall(&self, _call: &RpcCall) {}
    fn on_send_failed(&self, _call: &RpcCall, _error: &std::io::Error) {}
}

/// A cheap, `Clone`-able reference to a call, handed to external
/// collaborators (e.g. [`crate::collab::RoutingTable::timeout`]) that should
/// not be able to mutate the call directly.
#[derive(Clone)]
pub struct RpcCallHandle(pub(crate) Arc<RpcCall>);

impl RpcCallHandle {
    pub fn mtid(&self) -> Option<Vec<u8>> {
        self.0.mtid()
    }

    pub fn destination(&self) -> SocketAddr {
        self.0.destination
    }

    pub fn is_completed(&self) -> bool {
        self.0.completed.load(Ordering::Acquire)
    }
}

/// An outbound request awaiting a response, a timeout, or a send failure.
///
/// Constructed by a caller (`ping`/`do_call`), queued or dispatched by the
/// server, and terminal exactly once: the first of {response, timeout,
/// send-failure} to arrive wins, and every subsequent one is a no-op.
impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("request", &self.request)
            .field("destination", &self.destination)
            .field("known_reachable", &self.known_reachable)
            .field("completed", &self.completed.load(Ordering::Acquire))
            .field("stalled", &self.stalled.load(Ordering::Acquire))
            .finish()
    }
}

pub struct RpcCall {
    pub request: Message,
    pub destination: SocketAddr,
    mtid: OnceLock<Vec<u8>>,
    /// True when the destination was already a verified routing-table entry
    /// at construction time; excludes the call from the unverified-peer RTT
    /// population (see `TimeoutFilter`).
    pub known_reachable: bool,
    expected_rtt_millis: AtomicU64,
    expected_rtt_overridden: AtomicBool,
    response: OnceLock<Message>,
    completed: AtomicBool,
    stalled: AtomicBool,
    created_at: Instant,
    listeners: Mutex<Vec<Arc<dyn RpcCallListener>>>,
}

impl RpcCall {
    pub fn new(request: Message, destination: SocketAddr, known_reachable: bool) -> Arc<RpcCall> {
        Arc::new(RpcCall {
            request,
            destination,
            mtid: OnceLock::new(),
            known_reachable,
            expected_rtt_millis: AtomicU64::new(0),
            expected_rtt_overridden: AtomicBool::new(false),
            response: OnceLock::new(),
            completed: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            created_at: Instant::now(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> RpcCallHandle {
        RpcCallHandle(self.clone())
    }

    pub fn mtid(&self) -> Option<Vec<u8>> {
        self.mtid.get().cloned()
    }

    /// Stamps the call with its assigned transaction id. Called exactly once,
    /// by the server at the moment the call is admitted into the call table.
    ///
    /// Returns `false` if the call already had an id (a bug in the caller).
    pub fn assign_mtid(&self, mtid: Vec<u8>) -> bool {
        self.mtid.set(mtid).is_ok()
    }

    pub fn add_listener(&self, listener: Arc<dyn RpcCallListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.get()
    }

    pub fn expected_rtt(&self) -> Duration {
        Duration::from_millis(self.expected_rtt_millis.load(Ordering::Relaxed))
    }

    /// Sets the adaptive expected-RTT, unless a caller has already pinned an
    /// explicit override via [`RpcCall::set_expected_rtt_override`]. This is
    /// the hook `EnqueuedSend` uses to copy in the timeout filter's current
    /// `stall_timeout` at send time.
    pub fn set_expected_rtt(&self, rtt: Duration) {
        if !self.expected_rtt_overridden.load(Ordering::Relaxed) {
            self.expected_rtt_millis.store(rtt.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Pins an explicit expected-RTT that future `set_expected_rtt` calls
    /// (e.g. from `EnqueuedSend`) will not overwrite. Exists so experiments
    /// with loss-rate-scaled timeouts have somewhere to plug in without
    /// reintroducing dead, permanently-disabled code.
    pub fn set_expected_rtt_override(&self, rtt: Duration) {
        self.expected_rtt_millis.store(rtt.as_millis() as u64, Ordering::Relaxed);
        self.expected_rtt_overridden.store(true, Ordering::Relaxed);
    }

    /// Marks the call stalled: a response arrived from an unexpected source,
    /// so it could not be used to complete the call, but the call should
    /// still be expected to time out rather than be treated as silently
    /// abandoned.
    pub fn inject_stall(&self) {
        self.stalled.store(true, Ordering::Relaxed);
        for listener in self.listeners.lock().iter() {
            listener.on_stall(self);
        }
    }

    pub fn notify_sent(&self) {
        for listener in self.listeners.lock().iter() {
            listener.on_sent(self);
        }
    }

    /// Completes the call with a matching response. Returns `true` if this
    /// call was the one that transitioned the call to completed; `false` if
    /// another thread already completed it (timeout/send-failure race).
    pub fn complete_with_response(self: &Arc<Self>, response: Message) -> bool {
        if self.completed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        let _ = self.response.set(response);
        let response_ref = self.response.get().expect("just set");
        for listener in self.listeners.lock().iter() {
            listener.on_response(self, response_ref);
        }
        true
    }

    pub fn complete_with_timeout(self: &Arc<Self>) -> bool {
        if self.completed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        for listener in self.listeners.lock().iter() {
            listener.on_timeout(self);
        }
        true
    }

    pub fn complete_with_send_failure(self: &Arc<Self>, error: &std::io::Error) -> bool {
        if self.completed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        for listener in self.listeners.lock().iter() {
            listener.on_send_failed(self, error);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_wire::Method;
    use std::sync::atomic::AtomicUsize;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn ping() -> Message {
        Message::ping_query(b"aa".to_vec(), [1u8; 20])
    }

    #[test]
    fn mtid_assigned_once() {
        let call = RpcCall::new(ping(), addr(), false);
        assert!(call.assign_mtid(vec![1, 2, 3, 4, 5, 6]));
        assert!(!call.assign_mtid(vec![9, 9, 9, 9, 9, 9]));
        assert_eq!(call.mtid(), Some(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn only_first_terminal_event_wins() {
        struct Counter(AtomicUsize);
        impl RpcCallListener for Counter {
            fn on_response(&self, _call: &RpcCall, _r: &Message) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_timeout(&self, _call: &RpcCall) {
                self.0.fetch_add(100, Ordering::SeqCst);
            }
        }
        let call = RpcCall::new(ping(), addr(), false);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        call.add_listener(counter.clone());

        assert!(call.complete_with_response(Message::ping_query(b"aa".to_vec(), [2u8; 20])));
        // A racing timeout must not also fire.
        assert!(!call.complete_with_timeout());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expected_rtt_override_is_sticky() {
        let call = RpcCall::new(ping(), addr(), false);
        call.set_expected_rtt_override(Duration::from_millis(500));
        call.set_expected_rtt(Duration::from_millis(50));
        assert_eq!(call.expected_rtt(), Duration::from_millis(500));
    }

    #[test]
    fn known_reachable_flag_is_preserved() {
        let call = RpcCall::new(ping(), addr(), true);
        assert!(call.known_reachable);
        assert_eq!(call.request.as_query().unwrap().method, Method::Ping);
    }
}
