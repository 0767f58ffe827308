//! Host side of the plugin connection.

pub mod backend;

pub use backend::BackendClient;
pub use backend::multiplexing_support;
pub use backend::request_shutdown;
