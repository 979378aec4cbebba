//! Ownership of the inherited listening socket.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use tracing::{debug, warn};

use super::SERVER_TARGET;
use super::connection::PeerConnection;
use super::errors::AcceptError;

/// The bound listening socket for spawn-command peers.
///
/// The descriptor arrives pre-bound and pre-listening from the bootstrap
/// environment; this type only owns its lifecycle from registration to
/// close.
#[derive(Debug)]
pub struct CommandSocket {
    listener: UnixListener,
    name: String,
}

impl CommandSocket {
    /// Adopts an already-bound, already-listening descriptor.
    #[must_use]
    pub fn new(descriptor: OwnedFd, name: impl Into<String>) -> Self {
        Self {
            listener: UnixListener::from(descriptor),
            name: name.into(),
        }
    }

    /// Name the socket was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw descriptor value, exposed so post-fork code can confirm the
    /// listener is not retained by a worker.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts exactly one pending peer connection, handing the ABI list
    /// through unchanged for the protocol layer.
    pub fn accept_one(&self, abi_list: Arc<[String]>) -> Result<PeerConnection, AcceptError> {
        let (stream, _) = self.listener.accept().map_err(|source| AcceptError::Io {
            socket: self.name.clone(),
            source,
        })?;
        debug!(
            target: SERVER_TARGET,
            socket = %self.name,
            peer_fd = stream.as_raw_fd(),
            "accepted command peer"
        );
        PeerConnection::new(stream, abi_list).map_err(|source| AcceptError::Io {
            socket: self.name.clone(),
            source,
        })
    }

    /// Releases the listening descriptor. Close failures are logged and
    /// swallowed; shutdown must be unconditional.
    pub(crate) fn close(self) {
        let Self { listener, name } = self;
        let fd = listener.into_raw_fd();
        if let Err(error) = nix::unistd::close(fd) {
            warn!(
                target: SERVER_TARGET,
                socket = %name,
                fd,
                error = %error,
                "error closing listening socket"
            );
        } else {
            debug!(
                target: SERVER_TARGET,
                socket = %name,
                fd,
                "listening socket closed"
            );
        }
    }
}
