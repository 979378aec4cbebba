//! Warm-fork spawning daemon.
//!
//! `hatchd` is a long-running server that accepts connections on an
//! inherited Unix socket, reads spawn requests from each connected peer,
//! and forks worker processes that inherit the server's preloaded
//! in-memory state. Forking a warm process skips redundant initialisation
//! work, amortising startup cost across many short-lived workers.
//!
//! The crate is organised around a single-threaded, readiness-driven
//! dispatch loop ([`server`]): the listening socket and every peer socket
//! are multiplexed with `poll(2)`, each ready peer is driven through
//! exactly one command step, and a successful spawn surfaces as a tagged
//! [`spawn::WorkerTakeover`] value that unwinds out of the loop instead of
//! returning into it. The worker side of a fork therefore can never
//! re-enter the dispatcher, and the server-owned descriptors it inherited
//! are released when the loop's state is dropped on the way out.

mod bootstrap;
pub mod server;
pub mod spawn;
mod telemetry;
pub mod worker;

use std::process::ExitCode;

use tracing::error;

pub use bootstrap::{
    BootstrapError, ConfigLoader, EnvConfigLoader, StaticConfigLoader, bootstrap_with,
};
pub use telemetry::{TelemetryError, TelemetryHandle};

use crate::spawn::WorkerTakeover;

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Runs the daemon until a fatal error occurs or this execution becomes a
/// freshly forked worker, in which case `worker_main` receives the
/// takeover and the dispatch loop is never re-entered.
pub fn run<W>(worker_main: W) -> ExitCode
where
    W: FnOnce(WorkerTakeover) -> ExitCode,
{
    match bootstrap::bootstrap_with(&EnvConfigLoader) {
        Ok(server) => match server.serve() {
            Ok(takeover) => worker_main(takeover),
            Err(error) => {
                error!(
                    target: PROCESS_TARGET,
                    error = %error,
                    "spawning server terminated"
                );
                ExitCode::FAILURE
            }
        },
        Err(error) => {
            error!(
                target: PROCESS_TARGET,
                error = %error,
                "daemon bootstrap failed"
            );
            ExitCode::FAILURE
        }
    }
}
