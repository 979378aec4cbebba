use std::env;

use crate::logging::LogFormat;

/// Default socket name used to locate the inherited descriptor.
pub const DEFAULT_SOCKET_NAME: &str = "hatch";

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default socket name, owned for serde defaults.
pub fn default_socket_name() -> String {
    DEFAULT_SOCKET_NAME.to_string()
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

/// Default logging format for the daemon.
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default ABI list: the architecture the server itself was built for.
pub fn default_abi_list() -> Vec<String> {
    vec![env::consts::ARCH.to_string()]
}
