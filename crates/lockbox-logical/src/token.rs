//! Token entries as seen by backends.

use std::collections::HashMap;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;

use crate::auth::TokenType;

/// A stored token and everything the host knows about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: String,
    pub accessor: String,
    pub parent: String,
    pub policies: Vec<String>,
    pub inline_policy: String,
    pub path: String,
    pub meta: HashMap<String, String>,
    pub internal_meta: HashMap<String, String>,
    pub display_name: String,
    pub num_uses: i64,
    /// Unix seconds.
    pub creation_time: i64,
    pub ttl: Duration,
    pub explicit_max_ttl: Duration,
    pub role: String,
    pub period: Duration,
    pub entity_id: String,
    pub no_identity_policies: bool,
    pub bound_cidrs: Vec<IpNet>,
    pub namespace_id: String,
    pub cubbyhole_id: String,
    pub token_type: TokenType,
    pub external_id: String,
}
