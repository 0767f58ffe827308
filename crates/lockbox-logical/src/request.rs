//! Requests routed from the host to a backend.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::auth::Auth;
use crate::error::LogicalError;
use crate::secret::Secret;
use crate::storage::StorageHandle;

/// The verb of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Create,
    #[default]
    Read,
    Update,
    Patch,
    Delete,
    List,
    Help,
    AliasLookahead,
    ResolveRole,
    Header,
    // Only sent by the host's expiration manager.
    Revoke,
    Renew,
    Rollback,
}

impl Operation {
    pub const ALL: [Operation; 13] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Patch,
        Operation::Delete,
        Operation::List,
        Operation::Help,
        Operation::AliasLookahead,
        Operation::ResolveRole,
        Operation::Header,
        Operation::Revoke,
        Operation::Renew,
        Operation::Rollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Help => "help",
            Self::AliasLookahead => "alias-lookahead",
            Self::ResolveRole => "resolve-role",
            Self::Header => "header",
            Self::Revoke => "revoke",
            Self::Renew => "renew",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = LogicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| LogicalError::user(format!("unknown operation '{s}'")))
    }
}

/// Response wrapping requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestWrapInfo {
    pub ttl: Duration,
    pub format: String,
    pub seal_wrap: bool,
}

/// TLS session details of the client connection.
///
/// Certificates are DER encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub version: u16,
    pub handshake_complete: bool,
    pub did_resume: bool,
    pub cipher_suite: u16,
    pub negotiated_protocol: String,
    pub negotiated_protocol_is_mutual: bool,
    pub server_name: String,
    pub peer_certificates: Vec<Vec<u8>>,
    pub verified_chains: Vec<Vec<Vec<u8>>>,
    pub signed_certificate_timestamps: Vec<Vec<u8>>,
    pub ocsp_response: Vec<u8>,
    pub tls_unique: Vec<u8>,
}

/// Where the request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub remote_addr: String,
    pub remote_port: i32,
    pub connection_state: Option<ConnectionState>,
}

/// A structured command addressed to a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub operation: Operation,
    /// Path relative to the mount point.
    pub path: String,
    pub data: Map<String, Value>,
    /// Set for renew and revoke of a secret.
    pub secret: Option<Secret>,
    /// Set for renew of a token.
    pub auth: Option<Auth>,
    pub headers: HashMap<String, Vec<String>>,
    pub client_token: String,
    pub client_token_accessor: String,
    pub client_token_remaining_uses: i64,
    pub display_name: String,
    pub mount_point: String,
    pub mount_type: String,
    pub mount_accessor: String,
    pub wrap_info: Option<RequestWrapInfo>,
    pub entity_id: String,
    pub policy_override: bool,
    pub unauthenticated: bool,
    pub connection: Option<Connection>,
    /// Storage view the backend should use while serving this request.
    #[serde(skip)]
    pub storage: StorageHandle,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// String value of a data field, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_string_form() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert_eq!(Operation::AliasLookahead.to_string(), "alias-lookahead");
        assert!("frobnicate".parse::<Operation>().is_err());
    }

    #[test]
    fn test_operation_serde_matches_string_form() {
        let json = serde_json::to_string(&Operation::ResolveRole).unwrap();
        assert_eq!(json, "\"resolve-role\"");
    }

    #[test]
    fn test_get_str() {
        let mut data = Map::new();
        data.insert("value".into(), Value::from("bar"));
        data.insert("count".into(), Value::from(3));
        let req = Request::new(Operation::Create, "kv/foo").with_data(data);
        assert_eq!(req.get_str("value"), Some("bar"));
        assert_eq!(req.get_str("count"), None);
    }
}
