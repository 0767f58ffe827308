//! Wire model for the plugin connection.
//!
//! - [`types`]: postcard-encoded message structs for every RPC
//! - [`translate`]: loss-free conversion to and from the logical model
//! - [`error`]: stable integer tags for the error taxonomy

pub mod error;
pub mod translate;
pub mod types;

pub use error::WireError;
pub use error::decode_err;
pub use error::encode_err;
pub use translate::TranslateError;
pub use translate::duration_from_wire;
pub use translate::duration_to_wire;
pub use translate::map_from_wire;
pub use translate::map_to_wire;
pub use types::*;
