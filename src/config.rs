use std::time::Duration;

/// Tunables for an [`RpcServer`](crate::server::RpcServer).
///
/// Mirrors the constants named throughout the design: the active-call
/// ceiling, the reachability watchdog timeout, the stray-response grace
/// period, the wire packet size ceiling, and the spam throttle's rate limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcServerConfig {
    /// Maximum number of calls with an assigned transaction id in flight at
    /// once. Additional calls queue in `call_queue` until one frees up.
    pub max_active_calls: usize,

    /// How long `check_reachability` will tolerate a quiet socket before
    /// declaring the node unreachable.
    pub reachability_timeout: Duration,

    /// How long after `start()` a response with no matching call is treated
    /// as harmless residue from a prior run (dropped silently) rather than
    /// reported back to the sender as `ServerError`.
    pub stray_response_grace: Duration,

    /// Upper bound on an encoded outbound packet, used to size the
    /// thread-local write buffer.
    pub max_packet_size: usize,

    /// Spam throttle: number of datagrams tolerated from one source address
    /// within `throttle_interval` before `is_spam` starts returning `true`.
    pub throttle_max_per_interval: u32,
    pub throttle_interval: Duration,

    /// Origin-pairs LRU capacity and the minimum population before a
    /// consensus address is elected.
    pub consensus_capacity: usize,
    pub consensus_min_for_election: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        RpcServerConfig {
            max_active_calls: 2048,
            reachability_timeout: Duration::from_secs(60),
            stray_response_grace: Duration::from_secs(120),
            max_packet_size: 1500,
            throttle_max_per_interval: 20,
            throttle_interval: Duration::from_secs(1),
            consensus_capacity: 64,
            consensus_min_for_election: 20,
        }
    }
}
