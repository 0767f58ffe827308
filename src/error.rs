//! Errors raised by the plugin subsystem itself.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use lockbox_logical::LogicalError;
use lockbox_logical::PluginType;
use snafu::Snafu;

use crate::rpc::Status;

/// Failures spawning, connecting to, or serving a plugin.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PluginError {
    #[snafu(display("plugin binary '{}' is not accessible: {source}", path.display()))]
    BinaryNotFound { path: PathBuf, source: io::Error },

    #[snafu(display("plugin command '{command}' escapes the plugin directory"))]
    CommandOutsideDirectory { command: String },

    #[snafu(display("plugin directory is not configured, cannot resolve relative command '{command}'"))]
    NoPluginDirectory { command: String },

    #[snafu(display("checksum mismatch for plugin '{name}': expected {expected}, got {actual}"))]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[snafu(display("failed to spawn plugin '{name}': {source}"))]
    Spawn { name: String, source: io::Error },

    #[snafu(display("plugin '{name}' did not complete the handshake within {timeout:?}"))]
    HandshakeTimeout { name: String, timeout: Duration },

    #[snafu(display("plugin '{name}' exited before completing the handshake"))]
    ExitedBeforeHandshake { name: String },

    #[snafu(display("malformed handshake line '{line}': {reason}"))]
    MalformedHandshake { line: String, reason: String },

    #[snafu(display("incompatible core plugin protocol version {version}"))]
    IncompatibleCoreProtocol { version: u32 },

    #[snafu(display("no common plugin protocol version: host supports {host:?}, plugin supports {plugin:?}"))]
    NoCommonVersion { host: Vec<u32>, plugin: Vec<u32> },

    #[snafu(display(
        "this binary is a plugin and is not meant to be executed directly; \
         execute the program that consumes it, which will load the plugin"
    ))]
    MagicCookieMismatch,

    #[snafu(display("failed to connect to plugin at {addr}: {source}"))]
    Connect { addr: String, source: io::Error },

    #[snafu(display("failed to listen on {addr}: {source}"))]
    Listen { addr: String, source: io::Error },

    #[snafu(display("TLS configuration failed: {reason}"))]
    TlsConfig { reason: String },

    #[snafu(display("TLS handshake failed: {source}"))]
    TlsHandshake { source: io::Error },

    #[snafu(display("invalid reattach configuration: {source}"))]
    ReattachConfig { source: serde_json::Error },

    #[snafu(display("unsupported reattach network '{network}'"))]
    UnsupportedNetwork { network: String },

    #[snafu(display("plugin '{name}' ({}) version '{version}' not found in catalog", plugin_type.as_str()))]
    PluginNotFound {
        name: String,
        plugin_type: PluginType,
        version: String,
    },

    #[snafu(display("plugin catalog is shut down"))]
    CatalogShutdown,

    #[snafu(display("plugin rpc failed: {source}"))]
    Rpc { source: Status },

    #[snafu(display("{source}"))]
    Backend { source: LogicalError },

    #[snafu(display("I/O error: {source}"))]
    Io { source: io::Error },
}

impl From<Status> for PluginError {
    fn from(source: Status) -> Self {
        Self::Rpc { source }
    }
}

impl From<LogicalError> for PluginError {
    fn from(source: LogicalError) -> Self {
        Self::Backend { source }
    }
}

/// Subsystem failures seen through the backend contract. Anything that
/// means the plugin is unreachable becomes `plugin-shutdown`.
impl From<PluginError> for LogicalError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Rpc { source } => source.into(),
            PluginError::Backend { source } => source,
            PluginError::Connect { .. }
            | PluginError::ExitedBeforeHandshake { .. }
            | PluginError::TlsHandshake { .. }
            | PluginError::HandshakeTimeout { .. }
            | PluginError::CatalogShutdown => LogicalError::PluginShutdown,
            other => LogicalError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_plugin_maps_to_shutdown() {
        let err = PluginError::Connect {
            addr: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(LogicalError::from(err), LogicalError::PluginShutdown);
        assert_eq!(LogicalError::from(PluginError::from(Status::unavailable("gone"))), LogicalError::PluginShutdown);
        assert_eq!(LogicalError::from(PluginError::CatalogShutdown), LogicalError::PluginShutdown);
    }

    #[test]
    fn test_backend_error_passes_through() {
        let err = PluginError::from(LogicalError::PermissionDenied);
        assert_eq!(LogicalError::from(err), LogicalError::PermissionDenied);
    }

    #[test]
    fn test_other_errors_become_internal() {
        let err = LogicalError::from(PluginError::MagicCookieMismatch);
        assert!(matches!(err, LogicalError::Internal { .. }));
    }
}
