//! The shared worker pool: a small, fixed-size pool of threads that
//! executes packet decoding, message handling, and deferred `write_event`
//! runs off the reactor thread (§4.5, §5).
//!
//! Grounded on the teacher's `ConnectionManager` event-loop thread
//! (`src/rpc.rs`), generalized from "the one thread that also does the
//! work" into a dedicated pool so decode/classify/apply never blocks
//! readiness delivery. `crossbeam-channel` is used the way the wider
//! example pack uses it for worker-pool fan-out (see `aptos-core`).

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Scheduler {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(num_threads: usize) -> Scheduler {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..num_threads.max(1))
            .map(|i| spawn_worker(i, receiver.clone()))
            .collect();
        Scheduler { sender, workers }
    }

    /// Submits a short-lived job. Never blocks the caller: the channel is
    /// unbounded, matching the design's "workers may block only on the
    /// origin-pairs mutex" guarantee (the reactor thread must never stall
    /// waiting for a worker slot).
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            error!("scheduler worker channel closed; dropping job");
        }
    }
}

fn spawn_worker(index: usize, receiver: Receiver<Job>) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("dht-rpc-worker-{index}"))
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        })
        .expect("failed to spawn worker thread")
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel once this is the last
        // handle, which lets `recv()` in each worker return `Err` and the
        // thread exit; join to avoid leaking detached threads.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_submitted_jobs() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            scheduler.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Jobs run asynchronously; give the pool a moment to drain before
        // asserting (avoids a flaky sleep-free spin in a 2-worker pool).
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
