//! Audit rendering of plugin responses.
//!
//! Plugins may attach supplemental audit maps to a response. They never
//! reach the caller; the formatter writes them under
//! `supplemental_audit_data` in the audit entry, HMAC-ing every string
//! leaf whose top-level key is not in the mount's non-HMAC allow-list.

use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use hmac::digest::InvalidLength;
use lockbox_logical::LogicalError;
use lockbox_logical::Request;
use lockbox_logical::Response;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use sha2::Sha256;

/// Prefix of every hashed value in an audit entry.
pub const HMAC_PREFIX: &str = "hmac-sha256:";

const SUPPLEMENTAL_KEY: &str = "supplemental_audit_data";

/// Per-mount audit tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountAuditConfig {
    #[serde(default)]
    pub non_hmac_request_keys: Vec<String>,
    #[serde(default)]
    pub non_hmac_response_keys: Vec<String>,
}

impl MountAuditConfig {
    pub fn new<R, S>(request_keys: R, response_keys: S) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            non_hmac_request_keys: request_keys.into_iter().map(Into::into).collect(),
            non_hmac_response_keys: response_keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Renders request/response pairs into JSON audit entries.
#[derive(Clone)]
pub struct AuditFormatter {
    mac: Hmac<Sha256>,
}

impl AuditFormatter {
    pub fn new(key: &[u8]) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: Hmac::<Sha256>::new_from_slice(key)?,
        })
    }

    /// `hmac-sha256:<64 hex chars>` of `value` under the audit key.
    pub fn hash(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        format!("{HMAC_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Audit entry for a request that has not been answered yet.
    pub fn format_request(&self, req: &Request, mount: &MountAuditConfig) -> Value {
        json!({
            "time": Utc::now().to_rfc3339(),
            "type": "request",
            "request": self.request_section(req, None, mount),
        })
    }

    /// Audit entry for a completed request.
    ///
    /// The supplemental maps come from the plugin's response; the request
    /// map is recorded under `request`, the response map under `response`.
    pub fn format_response(
        &self,
        req: &Request,
        resp: Option<&Response>,
        err: Option<&LogicalError>,
        mount: &MountAuditConfig,
    ) -> Value {
        let supplemental_request = resp.and_then(|r| r.supplemental_audit_request_data.as_ref());
        let mut entry = Map::new();
        entry.insert("time".into(), Value::String(Utc::now().to_rfc3339()));
        entry.insert("type".into(), Value::String("response".into()));
        entry.insert("request".into(), self.request_section(req, supplemental_request, mount));
        if let Some(resp) = resp {
            entry.insert("response".into(), self.response_section(resp, mount));
        }
        if let Some(err) = err {
            entry.insert("error".into(), Value::String(err.to_string()));
        }
        Value::Object(entry)
    }

    fn request_section(&self, req: &Request, supplemental: Option<&Map<String, Value>>, mount: &MountAuditConfig) -> Value {
        let mut section = Map::new();
        section.insert("id".into(), Value::String(req.id.clone()));
        section.insert("operation".into(), Value::String(req.operation.as_str().into()));
        section.insert("path".into(), Value::String(req.path.clone()));
        section.insert("mount_point".into(), Value::String(req.mount_point.clone()));
        section.insert("mount_type".into(), Value::String(req.mount_type.clone()));
        if !req.client_token.is_empty() {
            section.insert("client_token".into(), Value::String(self.hash(&req.client_token)));
        }
        if !req.data.is_empty() {
            section.insert("data".into(), Value::Object(self.hash_map(&req.data, &mount.non_hmac_request_keys)));
        }
        if let Some(map) = supplemental {
            section.insert(SUPPLEMENTAL_KEY.into(), Value::Object(self.hash_map(map, &mount.non_hmac_request_keys)));
        }
        Value::Object(section)
    }

    fn response_section(&self, resp: &Response, mount: &MountAuditConfig) -> Value {
        let mut section = Map::new();
        if !resp.mount_type.is_empty() {
            section.insert("mount_type".into(), Value::String(resp.mount_type.clone()));
        }
        if !resp.data.is_empty() {
            section.insert("data".into(), Value::Object(self.hash_map(&resp.data, &mount.non_hmac_response_keys)));
        }
        if !resp.warnings.is_empty() {
            section.insert("warnings".into(), json!(resp.warnings));
        }
        if !resp.redirect.is_empty() {
            section.insert("redirect".into(), Value::String(resp.redirect.clone()));
        }
        if let Some(map) = resp.supplemental_audit_response_data.as_ref() {
            section.insert(SUPPLEMENTAL_KEY.into(), Value::Object(self.hash_map(map, &mount.non_hmac_response_keys)));
        }
        Value::Object(section)
    }

    fn hash_map(&self, map: &Map<String, Value>, allow: &[String]) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let rendered = if allow.iter().any(|k| k == key) {
                    value.clone()
                } else {
                    self.hash_value(value)
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    fn hash_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.hash(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.hash_value(v)).collect()),
            Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), self.hash_value(v))).collect()),
            other => other.clone(),
        }
    }
}
