//! Error taxonomy shared by backends, the host, and the plugin transport.
//!
//! Sentinel kinds are unit variants. Decoding a sentinel from the wire always
//! yields the same variant, so `==` comparisons against the canonical value
//! keep working after a round trip between host and plugin.

use snafu::Snafu;

/// Errors produced by logical backends and the plugin boundary.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum LogicalError {
    /// An error with no registered kind. The message is preserved.
    #[snafu(display("{message}"))]
    Unknown {
        /// Original error text.
        message: String,
    },

    /// A caller mistake (bad input, missing field).
    #[snafu(display("{message}"))]
    User {
        /// Human readable description.
        message: String,
    },

    /// A failure inside the backend that the caller cannot fix.
    #[snafu(display("{message}"))]
    Internal {
        /// Human readable description.
        message: String,
    },

    /// An error carrying an explicit HTTP-like status code.
    #[snafu(display("{message}"))]
    Coded {
        /// HTTP-like status code.
        code: u16,
        /// Human readable description.
        message: String,
    },

    /// A request rejected with a 400-class status.
    #[snafu(display("{message}"))]
    StatusBadRequest {
        /// Human readable description.
        message: String,
    },

    #[snafu(display("unsupported operation"))]
    UnsupportedOperation,

    #[snafu(display("unsupported path"))]
    UnsupportedPath,

    #[snafu(display("invalid request"))]
    InvalidRequest,

    #[snafu(display("permission denied"))]
    PermissionDenied,

    #[snafu(display("request needs further approval"))]
    MultiAuthzPending,

    /// The backend hit a state it cannot recover from; retrying will not help.
    #[snafu(display("unrecoverable error: {message}"))]
    Unrecoverable {
        /// Human readable description.
        message: String,
    },

    /// The plugin process went away or the transport to it closed.
    #[snafu(display("plugin is shut down"))]
    PluginShutdown,

    #[snafu(display("plugin client can not perform action while in metadata mode"))]
    ClientInMetadataMode,

    #[snafu(display("plugin server can not perform action while in metadata mode"))]
    ServerInMetadataMode,

    #[snafu(display(
        "missing storage implementation: this method should not be called during plugin Setup, but only during and after Initialize"
    ))]
    MissingStorage,

    #[snafu(display(
        "missing system view implementation: this method should not be called during plugin Setup, but only during and after Initialize"
    ))]
    MissingSystemView,

    #[snafu(display("lease expired"))]
    LeaseExpired,

    #[snafu(display("request expired"))]
    ExpiredRequest,

    /// The plugin has no instance registered under the routed key.
    #[snafu(display("no backend instance found"))]
    NoBackendInstance,

    /// The caller or the host cancelled the call.
    #[snafu(display("context canceled"))]
    Canceled,
}

impl LogicalError {
    /// Build an `unknown` error from any displayable value.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn coded(code: u16, message: impl Into<String>) -> Self {
        Self::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::StatusBadRequest {
            message: message.into(),
        }
    }

    /// True when the error means the plugin process is gone.
    pub fn is_plugin_shutdown(&self) -> bool {
        matches!(self, Self::PluginShutdown)
    }

    /// True for errors raised because one side is in metadata mode.
    ///
    /// These are never retried.
    pub fn is_metadata_mode(&self) -> bool {
        matches!(self, Self::ClientInMetadataMode | Self::ServerInMetadataMode)
    }

    /// HTTP status the host surfaces to the end user for this error.
    ///
    /// Coded errors keep their own status. Everything without a better
    /// mapping is a server error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::User { .. } | Self::InvalidRequest | Self::StatusBadRequest { .. } => 400,
            Self::LeaseExpired | Self::ExpiredRequest => 400,
            Self::Coded { code, .. } => *code,
            Self::PermissionDenied => 403,
            Self::UnsupportedPath => 404,
            Self::UnsupportedOperation => 405,
            Self::MultiAuthzPending => 202,
            Self::Unknown { .. }
            | Self::Internal { .. }
            | Self::Unrecoverable { .. }
            | Self::PluginShutdown
            | Self::ClientInMetadataMode
            | Self::ServerInMetadataMode
            | Self::MissingStorage
            | Self::MissingSystemView
            | Self::NoBackendInstance
            | Self::Canceled => 500,
        }
    }
}

/// Result alias used throughout the logical layer.
pub type Result<T, E = LogicalError> = std::result::Result<T, E>;
