//! The call table: a concurrent mapping from transaction id to in-flight
//! [`RpcCall`], plus the bounded-concurrency admission queue and declog
//! callbacks described in §4.2.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dht_wire::{Method, MethodResolver};

use crate::call::RpcCall;
use crate::mtid::random_mtid;

type DeclogTask = Box<dyn FnOnce() + Send>;

pub struct CallTable {
    calls: DashMap<Vec<u8>, Arc<RpcCall>>,
    call_queue: SegQueue<Arc<RpcCall>>,
    declog_queue: SegQueue<DeclogTask>,
    max_active_calls: usize,
    queued_len: AtomicUsize,
}

impl CallTable {
    pub fn new(max_active_calls: usize) -> CallTable {
        CallTable {
            calls: DashMap::new(),
            call_queue: SegQueue::new(),
            declog_queue: SegQueue::new(),
            max_active_calls,
            queued_len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queued_len.load(Ordering::Relaxed)
    }

    pub fn find(&self, mtid: &[u8]) -> Option<Arc<RpcCall>> {
        self.calls.get(mtid).map(|entry| entry.clone())
    }

    /// Admits `call` if the table has room, assigning it a fresh,
    /// collision-free transaction id (I3). If the table is at the ceiling
    /// (I2), the call is appended to `call_queue` instead and will be
    /// admitted later by [`CallTable::do_queued_calls`].
    pub fn try_admit(&self, call: Arc<RpcCall>) -> Result<Arc<RpcCall>, Arc<RpcCall>> {
        if self.calls.len() >= self.max_active_calls {
            self.call_queue.push(call.clone());
            self.queued_len.fetch_add(1, Ordering::Relaxed);
            return Err(call);
        }
        Ok(self.admit_now(call))
    }

    /// Assigns a transaction id and inserts unconditionally. Callers must
    /// have already confirmed there is capacity; this only guards against
    /// the (statistically negligible) id collision, not the ceiling.
    fn admit_now(&self, call: Arc<RpcCall>) -> Arc<RpcCall> {
        loop {
            let mtid = random_mtid();
            match self.calls.entry(mtid.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    call.assign_mtid(mtid);
                    vacant.insert(call.clone());
                    return call;
                }
            }
        }
    }

    /// Removes `mtid` only if the table's current entry is the same call
    /// (I4): a late duplicate response racing a timeout can never evict a
    /// call it didn't actually complete. Takes `&RpcCall` rather than
    /// `&Arc<RpcCall>` so listener callbacks (which only ever see a
    /// borrowed call, §9 "listener backrefs") can drive removal without
    /// reconstructing an `Arc`.
    pub fn remove_if_same(&self, mtid: &[u8], call: &RpcCall) -> bool {
        self.calls.remove_if(mtid, |_, stored| std::ptr::eq(stored.as_ref(), call)).is_some()
    }

    /// Registers a one-shot task to run once the table has free capacity.
    /// Runs interleaved with queued-call admission in
    /// [`CallTable::do_queued_calls`].
    pub fn on_declog(&self, task: DeclogTask) {
        self.declog_queue.push(task);
    }

    /// Drains as many queued calls as free capacity allows, then runs
    /// declog callbacks until capacity is saturated again, repeating until
    /// neither makes progress. Returns the calls that were freshly
    /// admitted (with their transaction id assigned) so the caller can
    /// enqueue their sends.
    pub fn do_queued_calls(&self) -> Vec<Arc<RpcCall>> {
        let mut dispatched = Vec::new();
        loop {
            let mut progressed = false;
            while self.calls.len() < self.max_active_calls {
                match self.call_queue.pop() {
                    Some(call) => {
                        self.queued_len.fetch_sub(1, Ordering::Relaxed);
                        dispatched.push(self.admit_now(call));
                        progressed = true;
                    }
                    None => break,
                }
            }
            if self.calls.len() < self.max_active_calls {
                if let Some(task) = self.declog_queue.pop() {
                    task();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        dispatched
    }
}

/// A response's `t` resolves to the method of the query that's still
/// waiting on it, so the decoder knows which `r` schema to apply (§4.9).
/// A transaction id with no in-flight call resolves to `None`, which the
/// caller treats as a stray.
impl MethodResolver for CallTable {
    fn resolve(&self, transaction_id: &[u8]) -> Option<Method> {
        self.find(transaction_id).and_then(|call| call.request.as_query().map(|q| q.method.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_wire::Message;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn call() -> Arc<RpcCall> {
        RpcCall::new(Message::ping_query(vec![], [1u8; 20]), addr(), false)
    }

    #[test]
    fn admits_under_ceiling_with_a_fresh_mtid() {
        let table = CallTable::new(4);
        let admitted = table.try_admit(call()).unwrap();
        assert!(admitted.mtid().is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn queues_instead_of_exceeding_the_ceiling() {
        let table = CallTable::new(1);
        table.try_admit(call()).unwrap();
        let queued = table.try_admit(call());
        assert!(queued.is_err());
        assert!(queued.unwrap_err().mtid().is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.queued_len(), 1);
    }

    #[test]
    fn remove_is_identity_conditional() {
        let table = CallTable::new(4);
        let admitted = table.try_admit(call()).unwrap();
        let mtid = admitted.mtid().unwrap();
        let impostor = call();
        assert!(!table.remove_if_same(&mtid, &impostor));
        assert!(table.remove_if_same(&mtid, &admitted));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn completing_a_call_drains_the_queue() {
        let table = CallTable::new(1);
        let first = table.try_admit(call()).unwrap();
        let second = call();
        table.try_admit(second.clone()).unwrap_err();

        let mtid = first.mtid().unwrap();
        assert!(table.remove_if_same(&mtid, &first));
        let dispatched = table.do_queued_calls();

        assert_eq!(dispatched.len(), 1);
        assert!(Arc::ptr_eq(&dispatched[0], &second));
        assert!(second.mtid().is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(table.queued_len(), 0);
    }

    #[test]
    fn declog_tasks_run_once_capacity_frees_up() {
        let table = CallTable::new(1);
        let first = table.try_admit(call()).unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        table.on_declog(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));

        let mtid = first.mtid().unwrap();
        table.remove_if_same(&mtid, &first);
        table.do_queued_calls();

        assert!(ran.load(Ordering::SeqCst));
    }
}
