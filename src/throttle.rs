//! Per-source-IP spam throttle: a fixed-window counter with a periodic
//! sweep of idle entries so memory stays bounded under churn.
//!
//! Grounded on the teacher's throttle discipline (`Connection::throttle`,
//! `src/rpc/connection.rs` in the original kudu sources) generalized from a
//! per-connection backoff to a per-source-IP rate gate, since the DHT server
//! has no persistent per-peer connection object to hang a counter off.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Window {
    count: u32,
    window_start: Instant,
}

/// How many `is_spam` calls between opportunistic sweeps of idle entries.
/// A fixed call count (rather than a wall-clock timer) keeps the sweep
/// self-driving without a background thread.
const SWEEP_EVERY: u64 = 4096;

pub struct SpamThrottle {
    max_per_interval: u32,
    interval: Duration,
    windows: Mutex<HashMap<IpAddr, Window>>,
    calls_since_sweep: AtomicU64,
}

impl SpamThrottle {
    pub fn new(max_per_interval: u32, interval: Duration) -> SpamThrottle {
        SpamThrottle {
            max_per_interval,
            interval,
            windows: Mutex::new(HashMap::new()),
            calls_since_sweep: AtomicU64::new(0),
        }
    }

    /// Observes one datagram from `ip` and reports whether it should be
    /// dropped as spam. Idempotent in the sense that every call both counts
    /// towards the window and returns the current verdict; there is no
    /// separate "just observe" mode.
    pub fn is_spam(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if self.calls_since_sweep.fetch_add(1, Ordering::Relaxed) >= SWEEP_EVERY {
            self.calls_since_sweep.store(0, Ordering::Relaxed);
            self.sweep(&mut windows, now);
        }

        let window = windows.entry(ip).or_insert_with(|| Window { count: 0, window_start: now });
        if now.duration_since(window.window_start) > self.interval {
            window.window_start = now;
            window.count = 0;
        }
        window.count += 1;
        window.count > self.max_per_interval
    }

    fn sweep(&self, windows: &mut HashMap<IpAddr, Window>, now: Instant) {
        windows.retain(|_, w| now.duration_since(w.window_start) <= self.interval * 2);
    }

    #[cfg(test)]
    fn tracked_sources(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    #[test]
    fn tolerates_burst_under_the_limit() {
        let throttle = SpamThrottle::new(5, Duration::from_secs(1));
        for _ in 0..5 {
            assert!(!throttle.is_spam(ip(1)));
        }
    }

    #[test]
    fn flags_source_exceeding_the_rate() {
        let throttle = SpamThrottle::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(!throttle.is_spam(ip(2)));
        }
        assert!(throttle.is_spam(ip(2)));
        assert!(throttle.is_spam(ip(2)));
    }

    #[test]
    fn distinct_sources_have_independent_windows() {
        let throttle = SpamThrottle::new(1, Duration::from_secs(60));
        assert!(!throttle.is_spam(ip(1)));
        assert!(!throttle.is_spam(ip(2)));
        assert!(throttle.is_spam(ip(1)));
    }

    #[test]
    fn sweep_does_not_evict_active_sources() {
        let throttle = SpamThrottle::new(100, Duration::from_secs(60));
        for i in 0..(SWEEP_EVERY as u32 + 10) {
            throttle.is_spam(ip((i % 250) as u8 + 1));
        }
        assert!(throttle.tracked_sources() > 0);
    }
}
