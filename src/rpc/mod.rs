//! Framed RPC between host and plugin.
//!
//! A single stream carries calls in both directions. Channel
//! [`MAIN_CHANNEL`] hosts the plugin's services; the host allocates further
//! channels for the reverse services of each backend instance and passes
//! the channel id to the plugin during setup.

pub mod connection;
pub mod frame;
pub mod metadata;
pub mod service;
pub mod status;

pub use connection::ConnectionTasks;
pub use connection::Role;
pub use connection::RpcConnection;
pub use frame::MAIN_CHANNEL;
pub use frame::MAX_MESSAGE_SIZE;
pub use frame::Metadata;
pub use service::IncomingCall;
pub use service::Router;
pub use service::Service;
pub use status::Code;
pub use status::Status;
