//! Daemon bootstrap orchestration.
//!
//! Bootstrap loads configuration, initialises telemetry, then adopts the
//! listening descriptor the launcher published through the environment.
//! The server never binds a socket itself; a missing or unusable
//! descriptor is a fatal configuration error because the daemon cannot
//! serve without one.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, fcntl};
use thiserror::Error;
use tracing::info;

use hatch_config::{Config, ConfigError, SocketBootstrapError};

use crate::PROCESS_TARGET;
use crate::server::SpawnServer;
use crate::telemetry::{self, TelemetryError};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader {
    /// Loads the daemon configuration.
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Loader that delegates to [`Config::from_env`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigLoader;

impl ConfigLoader for EnvConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::from_env()
    }
}

/// Loader that returns a pre-built configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already-resolved configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        #[source]
        source: ConfigError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        #[source]
        source: TelemetryError,
    },
    /// No listening descriptor was inherited from the environment.
    #[error("failed to resolve listening descriptor: {source}")]
    Socket {
        #[source]
        source: SocketBootstrapError,
    },
    /// The inherited descriptor does not refer to an open file.
    #[error("inherited descriptor {fd} is not open: {source}")]
    InvalidDescriptor {
        fd: RawFd,
        #[source]
        source: nix::Error,
    },
}

/// Bootstraps the spawning server using the supplied loader.
pub fn bootstrap_with(loader: &dyn ConfigLoader) -> Result<SpawnServer, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    info!(
        target: PROCESS_TARGET,
        socket = config.socket_name(),
        abis = ?config.abi_list(),
        "bootstrapping spawning server"
    );

    let descriptor = inherited_listener(config.socket_name())?;
    let mut server = SpawnServer::new(config.abi_list().iter().cloned());
    server.register_socket(descriptor, config.socket_name());
    Ok(server)
}

fn inherited_listener(name: &str) -> Result<OwnedFd, BootstrapError> {
    let fd = hatch_config::inherited_socket_fd(name)
        .map_err(|source| BootstrapError::Socket { source })?;
    // Confirm the descriptor is actually open before adopting it.
    fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|source| BootstrapError::InvalidDescriptor { fd, source })?;
    // SAFETY: the bootstrap contract hands this process sole ownership of
    // the descriptor published in the environment.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingLoader;

    impl ConfigLoader for FailingLoader {
        fn load(&self) -> Result<Config, ConfigError> {
            Err(ConfigError::EmptySocketName)
        }
    }

    #[test]
    fn configuration_failures_are_fatal() {
        let error = bootstrap_with(&FailingLoader).expect_err("bootstrap should fail");
        assert!(matches!(error, BootstrapError::Configuration { .. }));
    }

    #[test]
    fn a_missing_descriptor_is_fatal() {
        // No HATCH_SOCKET_ variable exists for this name.
        let loader = StaticConfigLoader::new(Config::new(
            "hatch-bootstrap-missing",
            vec!["x86_64".to_string()],
            "info",
            hatch_config::LogFormat::Compact,
        ));
        let error = bootstrap_with(&loader).expect_err("bootstrap should fail");
        assert!(matches!(error, BootstrapError::Socket { .. }));
    }

    #[test]
    fn static_loader_round_trips_its_configuration() {
        let config = Config::default();
        let loader = StaticConfigLoader::new(config.clone());
        assert_eq!(loader.load().expect("load should succeed"), config);
    }
}
