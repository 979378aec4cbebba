//! Fork-based worker creation.
//!
//! A spawn duplicates the running server process. Exactly one side of the
//! duplication is the new worker, and the type system keeps that side out
//! of the dispatch loop: [`Spawner::spawn`] returns a tagged
//! [`ForkOutcome`] that every caller must match structurally, never a
//! plain status the worker branch could fall through.

use nix::unistd::{self, ForkResult, Pid};
use thiserror::Error;
use tracing::info;

use crate::server::SpawnRequest;

pub(crate) const SPAWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::spawn");

/// State handed to a freshly forked worker.
///
/// Reaching the embedder's worker entry point with this value means the
/// dispatch loop has already been consumed on the way out, closing the
/// listening socket and every peer descriptor the worker inherited but
/// does not own.
#[derive(Debug)]
pub struct WorkerTakeover {
    request: SpawnRequest,
}

impl WorkerTakeover {
    pub(crate) fn new(request: SpawnRequest) -> Self {
        Self { request }
    }

    /// The spawn request this worker was created for.
    #[must_use]
    pub fn request(&self) -> &SpawnRequest {
        &self.request
    }

    /// Consumes the takeover, yielding the request for the worker entry.
    #[must_use]
    pub fn into_request(self) -> SpawnRequest {
        self.request
    }
}

/// Tagged result of a fork: exactly one side is the new worker.
#[derive(Debug)]
pub enum ForkOutcome {
    /// The calling process is still the server and continues serving.
    Parent {
        /// Process id of the spawned worker.
        child: Pid,
    },
    /// The calling process is the worker and must unwind out of the
    /// dispatch loop without returning into it.
    Worker(WorkerTakeover),
}

/// Errors raised while creating a worker process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The fork system call failed.
    #[error("failed to fork worker process: {source}")]
    Fork {
        #[source]
        source: nix::Error,
    },
}

/// Creates worker processes for spawn requests.
pub trait Spawner {
    /// Duplicates the calling process to service `request`.
    fn spawn(&mut self, request: &SpawnRequest) -> Result<ForkOutcome, SpawnError>;
}

/// Production spawner backed by `fork(2)`.
#[derive(Debug, Default)]
pub struct ForkSpawner;

impl ForkSpawner {
    /// Builds a new fork-backed spawner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for ForkSpawner {
    fn spawn(&mut self, request: &SpawnRequest) -> Result<ForkOutcome, SpawnError> {
        // SAFETY: the server is single-threaded by design, so no other
        // thread can hold a lock or be mid-allocation across the fork.
        match unsafe { unistd::fork() }.map_err(|source| SpawnError::Fork { source })? {
            ForkResult::Parent { child } => {
                info!(
                    target: SPAWN_TARGET,
                    pid = child.as_raw(),
                    "forked worker"
                );
                Ok(ForkOutcome::Parent { child })
            }
            ForkResult::Child => Ok(ForkOutcome::Worker(WorkerTakeover::new(request.clone()))),
        }
    }
}
