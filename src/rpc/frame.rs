//! Frames exchanged on a plugin connection.
//!
//! Each frame is postcard encoded and prefixed with its length as a 4-byte
//! big-endian integer.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

use super::status::Status;

/// Largest accepted frame. Secrets can carry large payloads.
pub const MAX_MESSAGE_SIZE: usize = i32::MAX as usize;

/// Channel carrying the host-to-plugin services.
pub const MAIN_CHANNEL: u32 = 0;

/// Key/value metadata attached to a call.
pub type Metadata = BTreeMap<String, String>;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Invoke `method` on the services registered for `channel`.
    Call {
        id: u64,
        channel: u32,
        method: String,
        metadata: Metadata,
        body: Vec<u8>,
    },
    /// Outcome of the sender's call `id`.
    Reply { id: u64, result: Result<Vec<u8>, Status> },
    /// The caller of `id` gave up; abort the handler.
    Cancel { id: u64 },
    /// The sender is closing the connection.
    Goodbye,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Length-prefix codec with the plugin frame limit applied.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}
