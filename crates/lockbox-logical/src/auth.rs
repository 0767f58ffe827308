//! Authentication results and identity aliases.

use std::collections::HashMap;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::secret::LeaseOptions;

/// Kind of token the host should mint for an auth response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    #[default]
    Default,
    Service,
    Batch,
    DefaultService,
    DefaultBatch,
}

impl TokenType {
    /// Stable integer form used on the wire.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::Service => 1,
            Self::Batch => 2,
            Self::DefaultService => 3,
            Self::DefaultBatch => 4,
        }
    }

    /// Unknown values fall back to [`TokenType::Default`].
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Service,
            2 => Self::Batch,
            3 => Self::DefaultService,
            4 => Self::DefaultBatch,
            _ => Self::Default,
        }
    }
}

/// An identity alias reported by an auth backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub mount_type: String,
    pub mount_accessor: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
    pub id: String,
    pub custom_metadata: HashMap<String, String>,
    pub local: bool,
}

/// The result of a successful login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub lease_options: LeaseOptions,
    pub token_type: TokenType,
    pub internal_data: Map<String, Value>,
    pub display_name: String,
    pub policies: Vec<String>,
    pub token_policies: Vec<String>,
    pub identity_policies: Vec<String>,
    pub no_default_policy: bool,
    pub metadata: HashMap<String, String>,
    pub client_token: String,
    pub accessor: String,
    pub period: Duration,
    pub explicit_max_ttl: Duration,
    pub num_uses: i64,
    pub entity_id: String,
    pub alias: Option<Alias>,
    pub group_aliases: Vec<Alias>,
    pub bound_cidrs: Vec<IpNet>,
}
