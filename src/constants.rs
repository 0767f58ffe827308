//! Fixed names and limits shared by host and plugin.

use std::time::Duration;

// ============================================================================
// Handshake
// ============================================================================

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "VAULT_BACKEND_PLUGIN";

/// Value the host places in [`MAGIC_COOKIE_KEY`].
pub const MAGIC_COOKIE_VALUE: &str = "6669da05-b1c8-4f49-97d9-c8e5bed98e20";

/// Protocol name announced in the handshake line.
pub const WIRE_PROTOCOL: &str = "lbrpc";

// ============================================================================
// Environment handed to plugin processes
// ============================================================================

/// Comma separated list of application protocol versions the host accepts.
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Base64 DER of the host's client certificate. Presence requests auto-mTLS.
pub const ENV_CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";

/// `true` while the host runs the plugin in metadata mode.
pub const ENV_METADATA_MODE: &str = "VAULT_PLUGIN_METADATA_MODE";

/// Host version string.
pub const ENV_VAULT_VERSION: &str = "VAULT_VERSION";

/// Whether the plugin should lock its memory.
pub const ENV_MLOCK_ENABLED: &str = "VAULT_PLUGIN_MLOCK_ENABLED";

/// Directory the plugin creates its listening socket in.
pub const ENV_UNIX_SOCKET_DIR: &str = "PLUGIN_UNIX_SOCKET_DIR";

/// JSON map from plugin name to reattach configuration.
pub const ENV_REATTACH_PLUGINS: &str = "VAULT_REATTACH_PLUGINS";

/// Whether a multiplexing-capable plugin should actually multiplex.
pub const ENV_MULTIPLEXING_DISABLED: &str = "LOCKBOX_PLUGIN_MULTIPLEXING_DISABLED";

// ============================================================================
// Timeouts
// ============================================================================

/// How long the host waits for the handshake line.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a graceful shutdown may take before the child is killed.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long a plugin waits for the host to connect after announcing itself.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Instances
// ============================================================================

/// Instance key used when the plugin does not multiplex.
pub const SINGLE_INSTANCE_KEY: &str = "single";

/// Length of the random connection id handed to each plugin client.
pub const CONNECTION_ID_LENGTH: usize = 10;

/// Version reported by plugins that do not declare one.
pub const EMPTY_PLUGIN_VERSION: &str = "";
