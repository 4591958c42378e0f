//! Consensus external-address tracker: an LRU-bounded map of reporting-peer
//! IP to the (ip, port) that peer claims to see for us, with majority
//! election once enough reports have accumulated.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub struct ConsensusTracker {
    min_for_election: usize,
    origin_pairs: Mutex<LruCache<IpAddr, SocketAddr>>,
    elected: Mutex<Option<SocketAddr>>,
}

impl ConsensusTracker {
    pub fn new(capacity: usize, min_for_election: usize) -> ConsensusTracker {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        ConsensusTracker {
            min_for_election,
            origin_pairs: Mutex::new(LruCache::new(capacity)),
            elected: Mutex::new(None),
        }
    }

    /// Feeds one peer's "you appear as" observation. Ignored if not
    /// globally unicast (loopback/private/link-local reports are useless
    /// for learning our public endpoint and would let a single LAN skew
    /// the election).
    pub fn observe(&self, source_ip: IpAddr, observed: SocketAddr) {
        if !is_globally_unicast(observed.ip()) {
            return;
        }
        let mut map = self.origin_pairs.lock();
        map.put(source_ip, observed);
        if map.len() > self.min_for_election {
            let winner = elect(&map);
            *self.elected.lock() = winner;
        }
    }

    pub fn elected(&self) -> Option<SocketAddr> {
        *self.elected.lock()
    }

    pub fn observed_sources(&self) -> usize {
        self.origin_pairs.lock().len()
    }
}

/// Picks the mode of the reported addresses. Ties are broken by whichever
/// candidate first reached the eventual maximum count, replayed in
/// least-recently-used-first (i.e. oldest access) order: `best` is only
/// overwritten on a strictly greater count, so a later candidate that only
/// *matches* the leader's count never displaces it.
fn elect(map: &LruCache<IpAddr, SocketAddr>) -> Option<SocketAddr> {
    let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
    let mut best: Option<(SocketAddr, usize)> = None;
    for (_, addr) in map.iter().rev() {
        let count = counts.entry(*addr).or_insert(0);
        *count += 1;
        match best {
            Some((_, best_count)) if *count <= best_count => {}
            _ => best = Some((*addr, *count)),
        }
    }
    best.map(|(addr, _)| addr)
}

/// Globally-routable unicast check implemented without relying on the
/// unstable `IpAddr::is_global`: excludes loopback, unspecified, multicast,
/// RFC1918/CGNAT/link-local (v4), and unique-local/link-local (v6).
pub fn is_globally_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast() || ip.is_link_local() {
        return false;
    }
    let octets = ip.octets();
    // RFC 1918 private ranges.
    if octets[0] == 10 {
        return false;
    }
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return false;
    }
    if octets[0] == 192 && octets[1] == 168 {
        return false;
    }
    // RFC 6598 carrier-grade NAT.
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return false;
    }
    // RFC 5737 documentation ranges.
    if (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
    {
        return false;
    }
    true
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    let segments = ip.segments();
    // fe80::/10 link-local.
    if (segments[0] & 0xffc0) == 0xfe80 {
        return false;
    }
    // fc00::/7 unique local.
    if (segments[0] & 0xfe00) == 0xfc00 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn public_addr(n: u8) -> SocketAddr {
        format!("203.0.113.{n}:6881").parse().unwrap()
    }

    #[test]
    fn elects_majority_once_population_exceeds_threshold() {
        let tracker = ConsensusTracker::new(64, 20);
        let majority: SocketAddr = "203.0.113.1:6881".parse().unwrap();
        let minority: SocketAddr = "198.51.100.2:6881".parse().unwrap();
        for i in 0..15u8 {
            tracker.observe(ip(i), majority);
        }
        for i in 15..21u8 {
            tracker.observe(ip(i), minority);
        }
        assert_eq!(tracker.elected(), Some(majority));
    }

    #[test]
    fn no_election_below_threshold() {
        let tracker = ConsensusTracker::new(64, 20);
        for i in 0..5u8 {
            tracker.observe(ip(i), public_addr(1));
        }
        assert_eq!(tracker.elected(), None);
    }

    #[test]
    fn private_and_loopback_observations_are_ignored() {
        let tracker = ConsensusTracker::new(64, 1);
        tracker.observe(ip(1), "10.0.0.5:6881".parse().unwrap());
        tracker.observe(ip(2), "127.0.0.1:6881".parse().unwrap());
        assert_eq!(tracker.observed_sources(), 0);
    }

    #[test]
    fn bounded_capacity_evicts_least_recently_used() {
        let tracker = ConsensusTracker::new(2, 100);
        tracker.observe(ip(1), public_addr(1));
        tracker.observe(ip(2), public_addr(2));
        tracker.observe(ip(3), public_addr(3));
        assert_eq!(tracker.observed_sources(), 2);
    }
}
