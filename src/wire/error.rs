//! Wire form of [`LogicalError`].
//!
//! Each kind has a stable integer tag. Tags are append-only; renumbering
//! breaks every plugin built against an older host.

use lockbox_logical::LogicalError;
use serde::Deserialize;
use serde::Serialize;

pub const ERR_TYPE_UNKNOWN: u32 = 0;
pub const ERR_TYPE_USER: u32 = 1;
pub const ERR_TYPE_INTERNAL: u32 = 2;
pub const ERR_TYPE_CODED: u32 = 3;
pub const ERR_TYPE_STATUS_BAD_REQUEST: u32 = 4;
pub const ERR_TYPE_UNSUPPORTED_OPERATION: u32 = 5;
pub const ERR_TYPE_UNSUPPORTED_PATH: u32 = 6;
pub const ERR_TYPE_INVALID_REQUEST: u32 = 7;
pub const ERR_TYPE_PERMISSION_DENIED: u32 = 8;
pub const ERR_TYPE_MULTI_AUTHZ_PENDING: u32 = 9;
pub const ERR_TYPE_UNRECOVERABLE: u32 = 10;
pub const ERR_TYPE_PLUGIN_SHUTDOWN: u32 = 11;
pub const ERR_TYPE_CLIENT_IN_METADATA_MODE: u32 = 12;
pub const ERR_TYPE_SERVER_IN_METADATA_MODE: u32 = 13;
pub const ERR_TYPE_MISSING_STORAGE: u32 = 14;
pub const ERR_TYPE_MISSING_SYSTEM_VIEW: u32 = 15;
pub const ERR_TYPE_LEASE_EXPIRED: u32 = 16;
pub const ERR_TYPE_EXPIRED_REQUEST: u32 = 17;
pub const ERR_TYPE_NO_BACKEND_INSTANCE: u32 = 18;
pub const ERR_TYPE_CANCELED: u32 = 19;

/// Error kind, message and optional HTTP-like code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub err_type: u32,
    pub err_msg: String,
    pub err_code: i64,
}

impl From<&LogicalError> for WireError {
    fn from(err: &LogicalError) -> Self {
        let err_type = match err {
            LogicalError::Unknown { .. } => ERR_TYPE_UNKNOWN,
            LogicalError::User { .. } => ERR_TYPE_USER,
            LogicalError::Internal { .. } => ERR_TYPE_INTERNAL,
            LogicalError::Coded { .. } => ERR_TYPE_CODED,
            LogicalError::StatusBadRequest { .. } => ERR_TYPE_STATUS_BAD_REQUEST,
            LogicalError::UnsupportedOperation => ERR_TYPE_UNSUPPORTED_OPERATION,
            LogicalError::UnsupportedPath => ERR_TYPE_UNSUPPORTED_PATH,
            LogicalError::InvalidRequest => ERR_TYPE_INVALID_REQUEST,
            LogicalError::PermissionDenied => ERR_TYPE_PERMISSION_DENIED,
            LogicalError::MultiAuthzPending => ERR_TYPE_MULTI_AUTHZ_PENDING,
            LogicalError::Unrecoverable { .. } => ERR_TYPE_UNRECOVERABLE,
            LogicalError::PluginShutdown => ERR_TYPE_PLUGIN_SHUTDOWN,
            LogicalError::ClientInMetadataMode => ERR_TYPE_CLIENT_IN_METADATA_MODE,
            LogicalError::ServerInMetadataMode => ERR_TYPE_SERVER_IN_METADATA_MODE,
            LogicalError::MissingStorage => ERR_TYPE_MISSING_STORAGE,
            LogicalError::MissingSystemView => ERR_TYPE_MISSING_SYSTEM_VIEW,
            LogicalError::LeaseExpired => ERR_TYPE_LEASE_EXPIRED,
            LogicalError::ExpiredRequest => ERR_TYPE_EXPIRED_REQUEST,
            LogicalError::NoBackendInstance => ERR_TYPE_NO_BACKEND_INSTANCE,
            LogicalError::Canceled => ERR_TYPE_CANCELED,
        };
        let err_msg = match err {
            LogicalError::Unknown { message }
            | LogicalError::User { message }
            | LogicalError::Internal { message }
            | LogicalError::Coded { message, .. }
            | LogicalError::StatusBadRequest { message }
            | LogicalError::Unrecoverable { message } => message.clone(),
            other => other.to_string(),
        };
        let err_code = match err {
            LogicalError::Coded { code, .. } => i64::from(*code),
            _ => 0,
        };
        Self {
            err_type,
            err_msg,
            err_code,
        }
    }
}

impl From<LogicalError> for WireError {
    fn from(err: LogicalError) -> Self {
        Self::from(&err)
    }
}

impl From<WireError> for LogicalError {
    fn from(err: WireError) -> Self {
        let message = err.err_msg;
        match err.err_type {
            ERR_TYPE_USER => LogicalError::User { message },
            ERR_TYPE_INTERNAL => LogicalError::Internal { message },
            ERR_TYPE_CODED => LogicalError::Coded {
                code: u16::try_from(err.err_code).unwrap_or(500),
                message,
            },
            ERR_TYPE_STATUS_BAD_REQUEST => LogicalError::StatusBadRequest { message },
            ERR_TYPE_UNSUPPORTED_OPERATION => LogicalError::UnsupportedOperation,
            ERR_TYPE_UNSUPPORTED_PATH => LogicalError::UnsupportedPath,
            ERR_TYPE_INVALID_REQUEST => LogicalError::InvalidRequest,
            ERR_TYPE_PERMISSION_DENIED => LogicalError::PermissionDenied,
            ERR_TYPE_MULTI_AUTHZ_PENDING => LogicalError::MultiAuthzPending,
            ERR_TYPE_UNRECOVERABLE => LogicalError::Unrecoverable { message },
            ERR_TYPE_PLUGIN_SHUTDOWN => LogicalError::PluginShutdown,
            ERR_TYPE_CLIENT_IN_METADATA_MODE => LogicalError::ClientInMetadataMode,
            ERR_TYPE_SERVER_IN_METADATA_MODE => LogicalError::ServerInMetadataMode,
            ERR_TYPE_MISSING_STORAGE => LogicalError::MissingStorage,
            ERR_TYPE_MISSING_SYSTEM_VIEW => LogicalError::MissingSystemView,
            ERR_TYPE_LEASE_EXPIRED => LogicalError::LeaseExpired,
            ERR_TYPE_EXPIRED_REQUEST => LogicalError::ExpiredRequest,
            ERR_TYPE_NO_BACKEND_INSTANCE => LogicalError::NoBackendInstance,
            ERR_TYPE_CANCELED => LogicalError::Canceled,
            // Unregistered tags from newer plugins degrade to unknown.
            _ => LogicalError::Unknown { message },
        }
    }
}

/// Encode an optional error field of a reply.
pub fn encode_err<T>(result: &Result<T, LogicalError>) -> Option<WireError> {
    result.as_ref().err().map(WireError::from)
}

/// Decode an optional error field of a reply.
pub fn decode_err(err: Option<WireError>) -> Result<(), LogicalError> {
    match err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip(err: &LogicalError) -> LogicalError {
        let wire = WireError::from(err);
        let bytes = postcard::to_allocvec(&wire).unwrap();
        let decoded: WireError = postcard::from_bytes(&bytes).unwrap();
        decoded.into()
    }

    #[test]
    fn test_sentinels_decode_to_canonical_variant() {
        let sentinels = [
            LogicalError::UnsupportedOperation,
            LogicalError::UnsupportedPath,
            LogicalError::InvalidRequest,
            LogicalError::PermissionDenied,
            LogicalError::MultiAuthzPending,
            LogicalError::PluginShutdown,
            LogicalError::ClientInMetadataMode,
            LogicalError::ServerInMetadataMode,
            LogicalError::MissingStorage,
            LogicalError::MissingSystemView,
            LogicalError::LeaseExpired,
            LogicalError::ExpiredRequest,
            LogicalError::NoBackendInstance,
            LogicalError::Canceled,
        ];
        for sentinel in sentinels {
            assert_eq!(roundtrip(&sentinel), sentinel);
        }
    }

    #[test]
    fn test_unregistered_tag_becomes_unknown_with_message() {
        let wire = WireError {
            err_type: 4242,
            err_msg: "something new".into(),
            err_code: 0,
        };
        assert_eq!(LogicalError::from(wire), LogicalError::unknown("something new"));
    }

    #[test]
    fn test_coded_keeps_code() {
        assert_eq!(roundtrip(&LogicalError::coded(429, "slow down")), LogicalError::coded(429, "slow down"));
    }

    #[test]
    fn test_out_of_range_code_falls_back_to_500() {
        let wire = WireError {
            err_type: ERR_TYPE_CODED,
            err_msg: "odd".into(),
            err_code: -1,
        };
        assert_eq!(LogicalError::from(wire), LogicalError::coded(500, "odd"));
    }

    #[test]
    fn test_reply_field_helpers() {
        let ok: Result<(), LogicalError> = Ok(());
        assert_eq!(encode_err(&ok), None);
        assert!(decode_err(None).is_ok());

        let failed: Result<(), LogicalError> = Err(LogicalError::PermissionDenied);
        assert_eq!(decode_err(encode_err(&failed)), Err(LogicalError::PermissionDenied));
    }

    proptest! {
        #[test]
        fn prop_message_kinds_roundtrip(message in ".{0,64}", code in 100u16..600, kind in 0usize..7) {
            let err = match kind {
                0 => LogicalError::unknown(message),
                1 => LogicalError::user(message),
                2 => LogicalError::internal(message),
                3 => LogicalError::coded(code, message),
                4 => LogicalError::bad_request(message),
                5 => LogicalError::Unrecoverable { message },
                _ => LogicalError::unknown(message),
            };
            prop_assert_eq!(roundtrip(&err), err);
        }
    }
}
