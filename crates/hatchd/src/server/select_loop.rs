//! Readiness-driven dispatch loop for the spawning server.
//!
//! The loop is single-threaded and cooperative: one `poll(2)` wait across
//! the listening socket and every peer socket, then exactly one unit of
//! work per ready descriptor. There is no timeout; the server has no
//! periodic work and exists only to react to events.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::warn;

use super::SERVER_TARGET;
use super::connection::{CommandOutcome, PeerConnection};
use super::errors::{AcceptError, PeerError, PollError, ServeError};
use super::socket::CommandSocket;
use crate::spawn::{Spawner, WorkerTakeover};

/// Drives exactly one command step for a registered peer.
pub(crate) trait CommandPeer: AsRawFd {
    fn process_one(&mut self, spawner: &mut dyn Spawner) -> Result<CommandOutcome, PeerError>;
}

impl CommandPeer for PeerConnection {
    fn process_one(&mut self, spawner: &mut dyn Spawner) -> Result<CommandOutcome, PeerError> {
        PeerConnection::process_one(self, spawner)
    }
}

/// Accepts peers on behalf of the dispatch loop.
pub(crate) trait Acceptor {
    type Peer: CommandPeer;

    /// Accepts exactly one pending connection.
    fn accept_one(&mut self) -> Result<Self::Peer, AcceptError>;

    /// Descriptor of the listening socket, watched at the sentinel index.
    fn fd(&self) -> RawFd;
}

/// Production acceptor: the registered socket plus the ABI list handed to
/// every new peer.
pub(crate) struct SocketAcceptor {
    socket: CommandSocket,
    abi_list: Arc<[String]>,
}

impl SocketAcceptor {
    pub(crate) fn new(socket: CommandSocket, abi_list: Arc<[String]>) -> Self {
        Self { socket, abi_list }
    }
}

impl Acceptor for SocketAcceptor {
    type Peer = PeerConnection;

    fn accept_one(&mut self) -> Result<PeerConnection, AcceptError> {
        self.socket.accept_one(Arc::clone(&self.abi_list))
    }

    fn fd(&self) -> RawFd {
        self.socket.fd()
    }
}

/// Blocks until registered descriptors report pending input.
pub(crate) trait ReadinessPoller {
    /// Returns one readiness flag per descriptor, in the same order.
    fn wait(&mut self, descriptors: &[RawFd]) -> Result<Vec<bool>, PollError>;
}

/// Poller backed by `poll(2)` with an infinite timeout.
#[derive(Debug, Default)]
pub(crate) struct SystemPoller;

impl ReadinessPoller for SystemPoller {
    fn wait(&mut self, descriptors: &[RawFd]) -> Result<Vec<bool>, PollError> {
        loop {
            let mut poll_fds: Vec<PollFd<'_>> = descriptors
                .iter()
                .map(|&fd| {
                    // SAFETY: every descriptor in the watch set is owned by
                    // the listener or a registered peer and outlives this
                    // call.
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    PollFd::new(borrowed, PollFlags::POLLIN)
                })
                .collect();
            match poll(&mut poll_fds, PollTimeout::NONE) {
                Ok(_) => {
                    // Hang-ups and errors count as readable so a dead peer
                    // is driven to its end-of-stream step instead of being
                    // parked forever.
                    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                    return Ok(poll_fds
                        .iter()
                        .map(|entry| {
                            entry
                                .revents()
                                .is_some_and(|revents| revents.intersects(ready))
                        })
                        .collect());
                }
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(PollError::Wait { source }),
            }
        }
    }
}

/// Ordered watch set of descriptors. Index 0 is the listener sentinel and
/// has no owning peer; peers occupy indices 1.. in insertion order, and
/// removing one shifts later entries down.
pub(crate) struct WatchSet<P> {
    listener_fd: RawFd,
    peers: Vec<P>,
}

impl<P: AsRawFd> WatchSet<P> {
    pub(crate) fn new(listener_fd: RawFd) -> Self {
        Self {
            listener_fd,
            peers: Vec::new(),
        }
    }

    /// Number of watched descriptors, listener sentinel included.
    pub(crate) fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn listener_fd(&self) -> RawFd {
        self.listener_fd
    }

    /// Descriptors in watch order: sentinel first, then peers.
    pub(crate) fn descriptors(&self) -> Vec<RawFd> {
        std::iter::once(self.listener_fd)
            .chain(self.peers.iter().map(AsRawFd::as_raw_fd))
            .collect()
    }

    pub(crate) fn push_peer(&mut self, peer: P) {
        self.peers.push(peer);
    }

    /// Peer behind a watch index; the sentinel at index 0 has none.
    pub(crate) fn peer_mut(&mut self, index: usize) -> Option<&mut P> {
        index
            .checked_sub(1)
            .and_then(|slot| self.peers.get_mut(slot))
    }

    /// Removes the peer behind a watch index, shifting later entries
    /// down. The sentinel at index 0 cannot be removed.
    pub(crate) fn remove_peer(&mut self, index: usize) -> Option<P> {
        let slot = index.checked_sub(1)?;
        (slot < self.peers.len()).then(|| self.peers.remove(slot))
    }
}

/// Outcome of a single dispatch iteration.
#[derive(Debug)]
pub(crate) enum LoopStep {
    /// Keep serving.
    Continue,
    /// Control now belongs to a freshly forked worker.
    Worker(WorkerTakeover),
}

/// The dispatch loop: watch set, acceptor, poller, and spawner.
pub(crate) struct SelectLoop<A: Acceptor, R: ReadinessPoller> {
    acceptor: A,
    poller: R,
    spawner: Box<dyn Spawner>,
    watch: WatchSet<A::Peer>,
}

impl<A: Acceptor, R: ReadinessPoller> SelectLoop<A, R> {
    pub(crate) fn new(acceptor: A, poller: R, spawner: Box<dyn Spawner>) -> Self {
        let watch = WatchSet::new(acceptor.fd());
        Self {
            acceptor,
            poller,
            spawner,
            watch,
        }
    }

    #[cfg(test)]
    pub(crate) fn watch(&self) -> &WatchSet<A::Peer> {
        &self.watch
    }

    #[cfg(test)]
    pub(crate) fn watch_mut(&mut self) -> &mut WatchSet<A::Peer> {
        &mut self.watch
    }

    /// Runs the dispatch loop until a worker takes over or a fatal error
    /// surfaces. The loop is consumed on return, so on the worker path
    /// every server-owned descriptor is released exactly once before the
    /// takeover reaches the caller.
    pub(crate) fn run(mut self) -> Result<WorkerTakeover, ServeError> {
        loop {
            if let LoopStep::Worker(takeover) = self.run_once()? {
                return Ok(takeover);
            }
        }
    }

    /// One poll-and-dispatch pass.
    pub(crate) fn run_once(&mut self) -> Result<LoopStep, ServeError> {
        let descriptors = self.watch.descriptors();
        let ready = self.poller.wait(&descriptors)?;
        // Scan newest entries first: removing a finished peer then only
        // shifts indices this pass has already visited, and a peer
        // accepted during the pass is never mistaken for one with a
        // pending command.
        for index in (0..ready.len()).rev() {
            if !ready.get(index).copied().unwrap_or(false) {
                continue;
            }
            if index == 0 {
                self.accept_pending()?;
            } else if let LoopStep::Worker(takeover) = self.step_peer(index)? {
                return Ok(LoopStep::Worker(takeover));
            }
        }
        Ok(LoopStep::Continue)
    }

    /// Accepts exactly one pending peer. Bounded per-iteration work keeps
    /// latency low for peers that are already connected.
    fn accept_pending(&mut self) -> Result<(), ServeError> {
        match self.acceptor.accept_one() {
            Ok(peer) => {
                self.watch.push_peer(peer);
                Ok(())
            }
            Err(error) if error.is_transient() => {
                warn!(
                    target: SERVER_TARGET,
                    error = %error,
                    "transient accept failure; pending peer skipped"
                );
                Ok(())
            }
            Err(error) => Err(ServeError::Accept(error)),
        }
    }

    fn step_peer(&mut self, index: usize) -> Result<LoopStep, ServeError> {
        let Some(peer) = self.watch.peer_mut(index) else {
            return Ok(LoopStep::Continue);
        };
        match peer.process_one(self.spawner.as_mut()) {
            Ok(CommandOutcome::KeepOpen) => Ok(LoopStep::Continue),
            Ok(CommandOutcome::Finished) => {
                drop(self.watch.remove_peer(index));
                Ok(LoopStep::Continue)
            }
            Ok(CommandOutcome::WorkerHandoff(takeover)) => {
                // This execution is the worker. Its own slot goes first;
                // the rest of the watch set dies with the loop as the
                // takeover unwinds.
                drop(self.watch.remove_peer(index));
                Ok(LoopStep::Worker(takeover))
            }
            Err(error) => {
                warn!(
                    target: SERVER_TARGET,
                    index,
                    error = %error,
                    "dropping peer after command failure"
                );
                drop(self.watch.remove_peer(index));
                Ok(LoopStep::Continue)
            }
        }
    }
}
