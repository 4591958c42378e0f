//! `MioReactor`: the one dedicated reactor thread that owns an `mio::Poll`
//! and delivers readiness events to registered [`Selectable`]s.
//!
//! Grounded on the teacher's `ConnectionManager` (`src/rpc.rs`): a
//! `Slab<Connection, Token>` driven by a single event-loop thread. This
//! generalizes that to mio 1.0's `Poll`/`Registry` API and a generic
//! `Selectable` trait object instead of a connection type hardcoded to
//! kudu's TCP negotiation state machine.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, trace, warn};
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::collab::{Reactor, Selectable};

const WAKER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

struct Registration {
    selectable: Arc<dyn Selectable>,
}

pub struct MioReactor {
    registry: mio::Registry,
    waker: Waker,
    slab: Mutex<Slab<Registration>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MioReactor {
    pub fn start() -> io::Result<Arc<MioReactor>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let reactor = Arc::new(MioReactor {
            registry,
            waker,
            slab: Mutex::new(Slab::new()),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        });

        let event_loop_reactor = reactor.clone();
        let handle = thread::Builder::new()
            .name("dht-rpc-reactor".into())
            .spawn(move || event_loop_reactor.run(poll))
            .expect("failed to spawn reactor thread");
        *reactor.thread.lock() = Some(handle);

        Ok(reactor)
    }

    fn run(&self, mut poll: Poll) {
        let mut events = Events::with_capacity(256);
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {e}");
                break;
            }
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let selectable = {
                    let slab = self.slab.lock();
                    slab.get(event.token().0).map(|r| r.selectable.clone())
                };
                match selectable {
                    Some(selectable) => {
                        trace!("reactor event: token={:?} readable={} writable={}", event.token(), event.is_readable(), event.is_writable());
                        selectable.selection_event(event.is_readable(), event.is_writable());
                    }
                    None => warn!("readiness event for unregistered token {:?}", event.token()),
                }
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Reactor for MioReactor {
    fn register(&self, selectable: Arc<dyn Selectable>) -> io::Result<Token> {
        let interest = selectable.calc_interest_ops();
        let mut slab = self.slab.lock();
        let index = slab.insert(Registration { selectable });
        let token = Token(index);
        // `mio::Registry::register` needs the concrete source, which lives
        // behind the caller's own handle; this reactor only tracks the
        // bookkeeping side (slab slot + interest changes) and expects the
        // caller to have already called `registry().register(..)` with the
        // token it receives back. See `SocketHandler::start`.
        let _ = interest;
        Ok(token)
    }

    fn deregister(&self, token: Token) {
        let mut slab = self.slab.lock();
        if slab.contains(token.0) {
            slab.remove(token.0);
        }
    }

    fn interest_ops_changed(&self, token: Token) {
        let selectable = {
            let slab = self.slab.lock();
            slab.get(token.0).map(|r| r.selectable.clone())
        };
        if let Some(selectable) = selectable {
            if let Err(e) = selectable.reregister(&self.registry) {
                error!("failed to reregister token {:?}: {e}", token);
            }
        }
    }

    fn registry(&self) -> &mio::Registry {
        &self.registry
    }
}
