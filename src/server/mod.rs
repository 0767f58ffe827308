//! Plugin side of the subsystem.
//!
//! A plugin binary builds a [`ServeConfig`] around its backend factory and
//! hands it to [`serve`]; everything else (cookie check, negotiation,
//! listening, TLS, the handshake line and instance bookkeeping) happens here.

pub mod backend;
pub mod serve;

pub use backend::BackendServer;
pub use serve::ConnectionSettings;
pub use serve::PluginEnv;
pub use serve::ServeConfig;
pub use serve::run_connection;
pub use serve::serve;
pub use serve::serve_with_env;
