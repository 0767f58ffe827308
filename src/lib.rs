//! External plugin subsystem for lockbox.
//!
//! Backends can run in separate plugin processes. This crate contains both
//! ends of that arrangement:
//!
//! - plugin side: [`server::serve`] runs a plugin binary's backends behind
//!   the handshake, negotiation and RPC server
//! - host side: [`supervisor`] spawns, reattaches, shares and restarts
//!   plugin processes; [`client::BackendClient`] speaks the backend
//!   contract over the connection
//! - shared: the [`wire`] model, the [`rpc`] transport, the reverse
//!   [`services`] plugins call back into, and [`handshake`]
//!
//! The backend contract itself lives in `lockbox-logical`.

pub mod audit;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod middleware;
pub mod rpc;
pub mod server;
pub mod services;
pub mod state;
pub mod supervisor;
pub mod tls;
pub mod wire;

pub use audit::AuditFormatter;
pub use client::BackendClient;
pub use config::PluginSubsystemConfig;
pub use error::PluginError;
pub use server::ServeConfig;
pub use server::serve;
pub use state::InstanceState;
pub use supervisor::PluginCatalog;
pub use supervisor::PluginRunner;
pub use supervisor::new_plugin_backend;
