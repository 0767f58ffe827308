//! Lease-bearing secrets returned by backends.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Lease parameters shared by secrets and auth responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseOptions {
    pub ttl: Duration,
    pub max_ttl: Duration,
    pub renewable: bool,
    /// Requested renewal increment.
    pub increment: Duration,
    pub issue_time: Option<DateTime<Utc>>,
}

impl LeaseOptions {
    /// The instant the lease expires, if it has an issue time and a TTL.
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        let issued = self.issue_time?;
        if self.ttl.is_zero() {
            return None;
        }
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        issued.checked_add_signed(ttl)
    }
}

/// Dynamic credential metadata.
///
/// `internal_data` is opaque to the host. It comes back unchanged on renew
/// and revoke so the backend remembers what it handed out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub lease_options: LeaseOptions,
    pub internal_data: Map<String, Value>,
    pub lease_id: String,
}

impl Secret {
    pub fn new(internal_data: Map<String, Value>, ttl: Duration) -> Self {
        Self {
            lease_options: LeaseOptions {
                ttl,
                renewable: true,
                ..LeaseOptions::default()
            },
            internal_data,
            lease_id: String::new(),
        }
    }
}
