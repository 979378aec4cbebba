//! One accepted spawn-command peer and its single-step processing.
//!
//! A peer sends newline-framed JSON spawn requests. Each call to
//! [`PeerConnection::process_one`] consumes exactly one logical request,
//! so requests from a single peer are always handled in arrival order.

use std::io::{self, BufRead, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SERVER_TARGET;
use super::errors::PeerError;
use crate::spawn::{ForkOutcome, Spawner, WorkerTakeover};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// One logical spawn request read from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Argument vector for the worker entry point.
    pub args: Vec<String>,
    /// Requested execution ABI; when present it must be one the server
    /// advertises.
    #[serde(default)]
    pub abi: Option<String>,
}

/// Reply written to the peer once a worker has been forked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResponse {
    /// Process id of the spawned worker.
    pub pid: i32,
}

/// Result of driving one peer through exactly one command step.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The request was handled; the peer stays registered for more.
    KeepOpen,
    /// The peer has no more work; the caller removes and closes it.
    Finished,
    /// Control now belongs to a freshly forked worker and must unwind
    /// out of the dispatch loop without returning into it.
    WorkerHandoff(WorkerTakeover),
}

/// Wraps one accepted peer socket together with the ABI list it was
/// accepted under.
#[derive(Debug)]
pub struct PeerConnection {
    reader: io::BufReader<UnixStream>,
    writer: UnixStream,
    abi_list: Arc<[String]>,
}

impl PeerConnection {
    pub(crate) fn new(stream: UnixStream, abi_list: Arc<[String]>) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: io::BufReader::new(stream),
            writer,
            abi_list,
        })
    }

    /// ABI list advertised to this peer, passed through unchanged.
    #[must_use]
    pub fn abi_list(&self) -> &[String] {
        &self.abi_list
    }

    /// Consumes exactly one spawn request from the peer.
    ///
    /// End of stream and a blank line are both orderly end markers; any
    /// error here is peer-scoped and handled by dropping the connection.
    pub fn process_one(
        &mut self,
        spawner: &mut dyn Spawner,
    ) -> Result<CommandOutcome, PeerError> {
        let Some(line) = self.read_request_line()? else {
            return Ok(CommandOutcome::Finished);
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(CommandOutcome::Finished);
        }

        let request: SpawnRequest =
            serde_json::from_slice(&line).map_err(|source| PeerError::Malformed { source })?;
        self.check_abi(&request)?;
        debug!(
            target: SERVER_TARGET,
            peer_fd = self.as_raw_fd(),
            args = ?request.args,
            "processing spawn request"
        );

        match spawner.spawn(&request)? {
            ForkOutcome::Parent { child } => {
                self.respond(&SpawnResponse {
                    pid: child.as_raw(),
                })?;
                Ok(CommandOutcome::KeepOpen)
            }
            ForkOutcome::Worker(takeover) => Ok(CommandOutcome::WorkerHandoff(takeover)),
        }
    }

    fn check_abi(&self, request: &SpawnRequest) -> Result<(), PeerError> {
        let Some(abi) = &request.abi else {
            return Ok(());
        };
        if self.abi_list.iter().any(|supported| supported == abi) {
            Ok(())
        } else {
            Err(PeerError::UnsupportedAbi { abi: abi.clone() })
        }
    }

    /// Reads one newline-framed request, bounded by the framing limit.
    /// Returns `None` on an orderly end of stream.
    fn read_request_line(&mut self) -> Result<Option<Vec<u8>>, PeerError> {
        let mut line = Vec::new();
        let mut bounded = Read::take(&mut self.reader, (MAX_REQUEST_BYTES + 1) as u64);
        let bytes_read = bounded
            .read_until(b'\n', &mut line)
            .map_err(|source| PeerError::Read { source })?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_REQUEST_BYTES {
            return Err(PeerError::Oversize {
                limit: MAX_REQUEST_BYTES,
            });
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn respond(&mut self, response: &SpawnResponse) -> Result<(), PeerError> {
        let mut payload =
            serde_json::to_vec(response).map_err(|source| PeerError::Encode { source })?;
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .and_then(|()| self.writer.flush())
            .map_err(|source| PeerError::Respond { source })
    }
}

impl AsRawFd for PeerConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }
}
