//! Responses returned by backends.

use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::auth::Auth;
use crate::secret::Secret;

/// Details of a response that was wrapped into a single-use token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseWrapInfo {
    pub ttl: Duration,
    pub token: String,
    pub accessor: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub wrapped_accessor: String,
    pub wrapped_entity_id: String,
    pub format: String,
    pub creation_path: String,
    pub seal_wrap: bool,
}

/// A structured reply from a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub secret: Option<Secret>,
    pub auth: Option<Auth>,
    pub data: Map<String, Value>,
    pub redirect: String,
    pub warnings: Vec<String>,
    pub wrap_info: Option<ResponseWrapInfo>,
    pub headers: HashMap<String, Vec<String>>,
    pub mount_type: String,
    /// Audit-only data describing the request. Never returned to the caller.
    pub supplemental_audit_request_data: Option<Map<String, Value>>,
    /// Audit-only data describing the response. Never returned to the caller.
    pub supplemental_audit_response_data: Option<Map<String, Value>>,
}

impl Response {
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// A response whose data carries a single `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self::with_data(data)
    }

    pub fn is_error(&self) -> bool {
        self.data.get("error").is_some_and(Value::is_string) && self.data.len() == 1
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}
