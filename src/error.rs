//! Error types for the block pool.
//!
//! Mirrors the error shape used throughout the host node: a thin `Error`
//! wrapper around a `failure::Context<ErrorKind>`, so call sites can
//! propagate with `?` while still matching on `.kind()` when they need to
//! decide whether to disconnect a peer.

use std::fmt::{self, Display};

use failure::{Backtrace, Context, Fail};
use serde::{Deserialize, Serialize};

/// Who gets penalised when a completed section's claimed total difficulty
/// doesn't match what `insert_chain` reports back.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum TdOffender {
    /// Penalise the peer that first announced the hash.
    Announcer,
    /// Penalise the peer that supplied the block body.
    Provider,
}

impl Default for TdOffender {
    fn default() -> TdOffender {
        TdOffender::Announcer
    }
}

/// Error definition.
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

/// Block pool error kinds, ordered roughly by how the caller should react.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// `insert_chain` rejected a section's blocks.
    #[fail(display = "blockchain rejected block: {}", _0)]
    InvalidBlock(String),
    /// `verify` returned false for an arriving block.
    #[fail(display = "proof of work verification failed")]
    InvalidPoW,
    /// Peer failed to supply its head block and ancestor hashes in time.
    #[fail(display = "peer did not provide sufficient chain info in time")]
    InsufficientChainInfo,
    /// Best peer went silent past `idle_best_peer_timeout` while we're caught up.
    #[fail(display = "best peer idle for too long")]
    IdleTooLong,
    /// A completed section's claimed total difficulty disagreed with the chain.
    #[fail(display = "total difficulty mismatch on insert")]
    IncorrectTD,
    /// `add_block` received a block we never asked for and that isn't the peer's head.
    #[fail(display = "unrequested block")]
    UnrequestedBlock,
    /// A `PeerRequestor` callback returned an error; soft, retried on the normal cadence.
    #[fail(display = "peer I/O error: {}", _0)]
    PeerIo(String),
    /// Config file failed to parse.
    #[fail(display = "configuration error: {}", _0)]
    Configuration(String),
}

impl ErrorKind {
    /// Whether this error kind should cause the peer to be disconnected and
    /// blacklisted, per §7 of the spec.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidBlock(_)
                | ErrorKind::InvalidPoW
                | ErrorKind::InsufficientChainInfo
                | ErrorKind::IdleTooLong
                | ErrorKind::IncorrectTD
        )
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Error {
    /// The underlying kind, for callers that need to branch on it.
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }

    /// Whether the wire layer should disconnect the peer that triggered this.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
