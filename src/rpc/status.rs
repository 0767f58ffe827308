//! Transport-level call status.

use std::fmt;

use lockbox_logical::LogicalError;
use serde::Deserialize;
use serde::Serialize;

use crate::wire::WireError;

/// Why a call failed before or outside the business logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

/// A failed call.
///
/// `detail` carries a logical error when the failure has a canonical kind,
/// so the receiver can rebuild the exact sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub detail: Option<WireError>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// A status carrying a logical error.
    pub fn from_logical(err: &LogicalError) -> Self {
        let code = match err {
            LogicalError::MissingStorage | LogicalError::MissingSystemView => Code::FailedPrecondition,
            LogicalError::ServerInMetadataMode | LogicalError::ClientInMetadataMode => Code::FailedPrecondition,
            LogicalError::NoBackendInstance => Code::NotFound,
            LogicalError::Canceled => Code::Cancelled,
            LogicalError::PluginShutdown => Code::Unavailable,
            _ => Code::Unknown,
        };
        Self {
            code,
            message: err.to_string(),
            detail: Some(WireError::from(err)),
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        self.code == Code::Unimplemented
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == Code::Unavailable
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {:?} desc = {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<LogicalError> for Status {
    fn from(err: LogicalError) -> Self {
        Self::from_logical(&err)
    }
}

/// Transport failures become `plugin-shutdown`; cancellations become
/// `canceled`. Everything else keeps its detail or message.
impl From<Status> for LogicalError {
    fn from(status: Status) -> Self {
        if let Some(detail) = status.detail {
            return detail.into();
        }
        match status.code {
            Code::Unavailable => LogicalError::PluginShutdown,
            Code::Cancelled => LogicalError::Canceled,
            _ => LogicalError::unknown(status.message),
        }
    }
}
