//! Default worker entry point.
//!
//! What a worker does after specialisation belongs to the embedding
//! runtime; deployments substitute their own entry through [`crate::run`].
//! This default records the handoff and exits cleanly so the binary is
//! usable end to end.

use std::process::ExitCode;

use tracing::info;

use crate::spawn::WorkerTakeover;

pub(crate) const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");

/// Runs a freshly specialised worker to completion.
///
/// By the time this is reached the dispatch loop has been consumed: the
/// listening socket and every inherited peer descriptor are already
/// closed, and returning from here ends the worker process.
#[must_use]
pub fn run(takeover: WorkerTakeover) -> ExitCode {
    let request = takeover.into_request();
    info!(
        target: WORKER_TARGET,
        args = ?request.args,
        abi = ?request.abi,
        "worker specialised; handing off to the runtime entry"
    );
    ExitCode::SUCCESS
}
