use std::io;

use dht_wire::{BencodeError, ParseError};

/// Errors surfaced by the RPC core.
///
/// Nothing reachable through normal packet processing is fatal to the
/// server; the variants here are either programmer errors (`IllegalState`),
/// transport failures surfaced to callers of `start`/`stop`, or malformed
/// input that the caller may want to log before the server auto-replies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lifecycle method was called from a state that doesn't permit it,
    /// e.g. `start()` on a server that is already RUNNING or STOPPED.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bencode decode failed: {0}")]
    Bencode(#[from] BencodeError),

    #[error("message parse failed: {0}")]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
