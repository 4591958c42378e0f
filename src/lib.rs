//! The per-socket RPC server core of a Kademlia-style (BitTorrent) DHT node:
//! call correlation, a readiness-driven send/receive loop, spam throttling,
//! RTT/reachability estimation, and external-address consensus.
//!
//! `dht_wire` (a sibling crate) owns the wire format; this crate owns
//! everything that happens around it.

pub mod call;
pub mod collab;
pub mod config;
pub mod consensus;
pub mod error;
pub mod estimator;
pub mod mtid;
pub mod pipeline;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod stats;
pub mod table;
pub mod throttle;
pub mod worker;

pub use call::{RpcCall, RpcCallHandle, RpcCallListener};
pub use collab::{DhtLayer, InMemoryRoutingTable, NullDhtLayer, Reactor, RoutingTable, Selectable};
pub use config::RpcServerConfig;
pub use error::{Error, Result};
pub use server::RpcServer;
