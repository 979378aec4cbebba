//! Error types for the spawning server.

use std::io;

use thiserror::Error;

use crate::spawn::SpawnError;

/// Errors raised by `accept(2)` on the listening socket.
///
/// A broken listening socket cannot self-heal, so accept failures are
/// fatal by default; only the connection-scoped kinds reported by
/// [`AcceptError::is_transient`] are survivable.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The underlying accept operation failed.
    #[error("accept on listening socket '{socket}' failed: {source}")]
    Io {
        socket: String,
        #[source]
        source: io::Error,
    },
}

impl AcceptError {
    /// Whether the failure concerned a single pending connection rather
    /// than the listening socket itself.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let Self::Io { source, .. } = self;
        matches!(
            source.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        )
    }
}

/// Errors raised by the readiness wait.
#[derive(Debug, Error)]
pub enum PollError {
    /// `poll(2)` failed for a reason other than an interrupted wait.
    #[error("readiness wait failed: {source}")]
    Wait {
        #[source]
        source: nix::Error,
    },
}

/// Per-peer failures surfaced by a single command step.
///
/// These are caught at the dispatcher's per-descriptor boundary and
/// converted into "drop this peer"; they never take down the server.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Reading from the peer socket failed.
    #[error("failed to read spawn request: {source}")]
    Read {
        #[source]
        source: io::Error,
    },
    /// The peer sent a request larger than the framing limit.
    #[error("spawn request exceeds {limit} bytes")]
    Oversize { limit: usize },
    /// The request line was not a valid spawn request.
    #[error("malformed spawn request: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },
    /// The peer asked for an ABI the server does not advertise.
    #[error("requested ABI '{abi}' is not supported")]
    UnsupportedAbi { abi: String },
    /// Encoding the spawn response failed.
    #[error("failed to encode spawn response: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    /// Writing the spawn response back to the peer failed.
    #[error("failed to write spawn response: {source}")]
    Respond {
        #[source]
        source: io::Error,
    },
    /// Forking the worker failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Fatal errors that terminate the dispatch loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// `serve` was invoked before a listening socket was registered.
    #[error("no listening socket registered")]
    NotRegistered,
    /// The readiness wait failed irrecoverably.
    #[error(transparent)]
    Poll(#[from] PollError),
    /// The listening socket failed irrecoverably.
    #[error(transparent)]
    Accept(#[from] AcceptError),
}
