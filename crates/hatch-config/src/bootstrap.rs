//! Environment-driven bootstrap for the inherited listening descriptor.
//!
//! The launching process binds the listening socket and publishes its
//! descriptor number through a well-known environment variable before
//! starting the daemon. The daemon never binds a socket itself; it only
//! resolves the variable and adopts the descriptor.

use std::env;
use std::num::ParseIntError;
use std::os::fd::RawFd;

use thiserror::Error;

/// Prefix shared by all inherited-socket environment variables.
pub const SOCKET_ENV_PREFIX: &str = "HATCH_SOCKET_";

/// Full environment variable name for a socket registered under `name`.
#[must_use]
pub fn socket_env_var(name: &str) -> String {
    format!("{SOCKET_ENV_PREFIX}{name}")
}

/// Resolves the descriptor number inherited for the named socket.
///
/// The descriptor is returned as a raw value; validating that it refers to
/// an open, listening socket is the caller's responsibility.
pub fn inherited_socket_fd(name: &str) -> Result<RawFd, SocketBootstrapError> {
    let variable = socket_env_var(name);
    let value = env::var(&variable).map_err(|_| SocketBootstrapError::Unset {
        variable: variable.clone(),
    })?;
    let fd = value
        .trim()
        .parse::<RawFd>()
        .map_err(|source| SocketBootstrapError::Invalid {
            variable: variable.clone(),
            value: value.clone(),
            source,
        })?;
    if fd < 0 {
        return Err(SocketBootstrapError::Negative { variable, fd });
    }
    Ok(fd)
}

/// Errors raised while resolving the inherited socket descriptor.
#[derive(Debug, Error)]
pub enum SocketBootstrapError {
    /// The environment variable for the socket was not set.
    #[error("{variable} is unset; no listening descriptor was inherited")]
    Unset { variable: String },
    /// The variable was set but did not hold a descriptor number.
    #[error("{variable} ('{value}') is not a descriptor number: {source}")]
    Invalid {
        variable: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
    /// The variable held a negative descriptor value.
    #[error("{variable} holds negative descriptor {fd}")]
    Negative { variable: String, fd: RawFd },
}
