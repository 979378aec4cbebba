//! The spawning server: listening socket, peer connections, and the
//! readiness-driven dispatch loop.

mod connection;
mod errors;
mod select_loop;
#[cfg(test)]
mod select_loop_tests;
mod socket;

use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

use tracing::{info, warn};

pub use self::connection::{CommandOutcome, PeerConnection, SpawnRequest, SpawnResponse};
pub use self::errors::{AcceptError, PeerError, PollError, ServeError};
pub use self::socket::CommandSocket;

use self::select_loop::{SelectLoop, SocketAcceptor, SystemPoller};
use crate::spawn::{ForkSpawner, WorkerTakeover};

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Explicit server state: the registered listening socket plus the ABI
/// list advertised to peers.
///
/// There is exactly one of these per server process. Construction and
/// teardown are explicit; nothing here lives in process-wide mutable
/// state.
#[derive(Debug)]
pub struct SpawnServer {
    socket: Option<CommandSocket>,
    abi_list: Arc<[String]>,
}

impl SpawnServer {
    /// Builds a server that will advertise `abi_list` to every peer.
    #[must_use]
    pub fn new(abi_list: impl IntoIterator<Item = String>) -> Self {
        Self {
            socket: None,
            abi_list: abi_list.into_iter().collect(),
        }
    }

    /// Registers the listening socket for spawn-command connections.
    ///
    /// Idempotent: while a socket is registered, further calls are no-ops
    /// and the original descriptor stays authoritative. The rejected
    /// descriptor is released here rather than leaked.
    pub fn register_socket(&mut self, descriptor: OwnedFd, name: impl Into<String>) {
        if let Some(existing) = &self.socket {
            warn!(
                target: SERVER_TARGET,
                socket = existing.name(),
                "listening socket already registered; ignoring replacement"
            );
            return;
        }
        let socket = CommandSocket::new(descriptor, name);
        info!(
            target: SERVER_TARGET,
            socket = socket.name(),
            fd = socket.fd(),
            "registered listening socket"
        );
        self.socket = Some(socket);
    }

    /// Raw descriptor of the registered listening socket, if any.
    #[must_use]
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(CommandSocket::fd)
    }

    /// Releases the listening socket. Idempotent; callable from normal
    /// shutdown and from a worker's exit path alike. Failures are logged,
    /// never raised.
    pub fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    /// Runs the dispatch loop until a worker takes over or a fatal error
    /// surfaces. The server is consumed: on the worker path the listening
    /// socket and every peer descriptor are released before the takeover
    /// reaches the caller, so a worker can never participate in future
    /// accepts or observe unrelated connections.
    pub fn serve(self) -> Result<WorkerTakeover, ServeError> {
        let Self { socket, abi_list } = self;
        let Some(socket) = socket else {
            return Err(ServeError::NotRegistered);
        };
        info!(
            target: SERVER_TARGET,
            socket = socket.name(),
            abis = ?abi_list,
            "entering dispatch loop"
        );
        let acceptor = SocketAcceptor::new(socket, abi_list);
        SelectLoop::new(acceptor, SystemPoller, Box::new(ForkSpawner::new())).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixListener;

    fn bound_listener(dir: &tempfile::TempDir, name: &str) -> OwnedFd {
        let path = dir.path().join(name);
        let listener = UnixListener::bind(path).expect("bind listener");
        OwnedFd::from(listener)
    }

    #[test]
    fn second_registration_is_a_no_op() {
        let dir = tempfile::tempdir().expect("temp dir");
        let first = bound_listener(&dir, "first.sock");
        let second = bound_listener(&dir, "second.sock");
        let first_fd = first.as_raw_fd();

        let mut server = SpawnServer::new(["x86_64".to_string()]);
        server.register_socket(first, "hatch");
        server.register_socket(second, "hatch-replacement");

        assert_eq!(server.socket_fd(), Some(first_fd));
    }

    #[test]
    fn closing_an_unregistered_socket_is_a_no_op() {
        let mut server = SpawnServer::new(["x86_64".to_string()]);
        assert_eq!(server.socket_fd(), None);
        server.close_socket();
        server.close_socket();
        assert_eq!(server.socket_fd(), None);
    }

    #[test]
    fn close_releases_the_descriptor_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let descriptor = bound_listener(&dir, "hatch.sock");

        let mut server = SpawnServer::new(["x86_64".to_string()]);
        server.register_socket(descriptor, "hatch");
        assert!(server.socket_fd().is_some());
        server.close_socket();
        assert_eq!(server.socket_fd(), None);
        // A second close must not touch the already-released descriptor.
        server.close_socket();
    }

    #[test]
    fn serving_without_registration_is_fatal() {
        let server = SpawnServer::new(["x86_64".to_string()]);
        let error = server.serve().expect_err("serve should fail");
        assert!(matches!(error, ServeError::NotRegistered));
    }
}
