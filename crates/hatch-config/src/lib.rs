//! Shared configuration for the hatch spawning daemon.
//!
//! The daemon inherits its listening socket from the process that launched
//! it, so the configuration surface is deliberately small: the socket name
//! used to locate the inherited descriptor, the list of execution ABIs the
//! server advertises to peers, and the logging settings consumed by the
//! daemon's telemetry layer. Everything is sourced from the environment,
//! matching how the descriptor itself is handed over.

mod bootstrap;
mod defaults;
mod logging;

use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bootstrap::{SOCKET_ENV_PREFIX, SocketBootstrapError, inherited_socket_fd, socket_env_var};
pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_SOCKET_NAME, default_abi_list, default_log_filter_string,
    default_log_format, default_socket_name,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Environment variable naming the inherited listening socket.
pub const SOCKET_NAME_VAR: &str = "HATCHD_SOCKET_NAME";
/// Environment variable holding the comma-separated ABI list.
pub const ABI_LIST_VAR: &str = "HATCHD_ABI_LIST";
/// Environment variable holding the tracing filter expression.
pub const LOG_FILTER_VAR: &str = "HATCHD_LOG_FILTER";
/// Environment variable selecting the logging output format.
pub const LOG_FORMAT_VAR: &str = "HATCHD_LOG_FORMAT";

/// Resolved daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "defaults::default_socket_name")]
    socket_name: String,
    #[serde(default = "defaults::default_abi_list")]
    abi_list: Vec<String>,
    #[serde(default = "defaults::default_log_filter_string")]
    log_filter: String,
    #[serde(default = "defaults::default_log_format")]
    log_format: LogFormat,
}

impl Config {
    /// Builds a configuration from explicit parts.
    #[must_use]
    pub fn new(
        socket_name: impl Into<String>,
        abi_list: Vec<String>,
        log_filter: impl Into<String>,
        log_format: LogFormat,
    ) -> Self {
        Self {
            socket_name: socket_name.into(),
            abi_list,
            log_filter: log_filter.into(),
            log_format,
        }
    }

    /// Loads the configuration from the process environment.
    ///
    /// Unset variables fall back to the documented defaults; present but
    /// malformed values are rejected rather than silently replaced.
    pub fn from_env() -> Result<Self, ConfigError> {
        let socket_name = match env::var(SOCKET_NAME_VAR) {
            Ok(value) if value.trim().is_empty() => {
                return Err(ConfigError::EmptySocketName);
            }
            Ok(value) => value,
            Err(_) => defaults::default_socket_name(),
        };
        let abi_list = match env::var(ABI_LIST_VAR) {
            Ok(value) => parse_abi_list(&value)?,
            Err(_) => defaults::default_abi_list(),
        };
        let log_filter =
            env::var(LOG_FILTER_VAR).unwrap_or_else(|_| defaults::default_log_filter_string());
        let log_format = match env::var(LOG_FORMAT_VAR) {
            Ok(value) => value
                .parse::<LogFormat>()
                .map_err(|source| ConfigError::LogFormat { value, source })?,
            Err(_) => defaults::default_log_format(),
        };
        Ok(Self {
            socket_name,
            abi_list,
            log_filter,
            log_format,
        })
    }

    /// Name under which the listening descriptor was inherited.
    #[must_use]
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Execution ABIs advertised to connecting peers, in order.
    #[must_use]
    pub fn abi_list(&self) -> &[String] {
        &self.abi_list
    }

    /// Filter expression consumed by the telemetry subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Logging output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_name: defaults::default_socket_name(),
            abi_list: defaults::default_abi_list(),
            log_filter: defaults::default_log_filter_string(),
            log_format: defaults::default_log_format(),
        }
    }
}

fn parse_abi_list(value: &str) -> Result<Vec<String>, ConfigError> {
    let entries: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    if entries.is_empty() {
        return Err(ConfigError::EmptyAbiList {
            value: value.to_string(),
        });
    }
    Ok(entries)
}

/// Errors raised while loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The socket name variable was present but blank.
    #[error("{SOCKET_NAME_VAR} is set but empty")]
    EmptySocketName,
    /// The ABI list variable contained no usable entries.
    #[error("{ABI_LIST_VAR} ('{value}') contains no ABI entries")]
    EmptyAbiList { value: String },
    /// The log format variable did not name a known format.
    #[error("unrecognised log format '{value}': {source}")]
    LogFormat {
        value: String,
        #[source]
        source: LogFormatParseError,
    },
}
