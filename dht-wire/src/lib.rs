//! Bencode codec and BEP-5 message schema shared by the DHT RPC core.
//!
//! This crate knows nothing about sockets, call tables, or concurrency: it is
//! the pure encode/decode boundary, kept separate so it can be tested (and
//! versioned) independently of the runtime that drives it.

pub mod bencode;
pub mod message;

pub use bencode::{BValue, BencodeError};
pub use message::{
    AlwaysPing, Body, ErrorBody, ErrorCode, Message, Method, MethodResolver, NodeId, ParseError,
    Query, QueryArgs, Response,
};
