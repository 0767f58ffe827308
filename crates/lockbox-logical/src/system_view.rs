//! Host capabilities exposed to backends at runtime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::auth::Alias;
use crate::context::Context;
use crate::error::LogicalError;
use crate::error::Result;
use crate::response::ResponseWrapInfo;

bitflags! {
    /// Replication role of the host cluster.
    ///
    /// An empty set means replication is not configured.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReplicationState: u32 {
        const PERFORMANCE_SECONDARY = 1 << 0;
        const DR_SECONDARY = 1 << 1;
        const PERFORMANCE_PRIMARY = 1 << 2;
        const DR_PRIMARY = 1 << 3;
        const PERFORMANCE_BOOTSTRAPPING = 1 << 4;
        const DR_BOOTSTRAPPING = 1 << 5;
        const PERFORMANCE_STANDBY = 1 << 6;
    }
}

/// Version of the host a plugin is running under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEnvironment {
    pub host_version: String,
    pub host_version_prerelease: String,
    pub host_version_metadata: String,
}

/// An identity entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub aliases: Vec<Alias>,
    pub metadata: HashMap<String, String>,
    pub disabled: bool,
    pub namespace_id: String,
}

/// An identity group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
    pub namespace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTokenRequest {
    pub audience: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTokenResponse {
    pub token: String,
    /// TTL actually granted, which may be shorter than requested.
    pub ttl: Duration,
}

/// A credential rotation the host should drive on the backend's behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJobConfig {
    pub name: String,
    pub mount_type: String,
    pub path: String,
    pub schedule: String,
    pub rotation_window: i64,
    pub rotation_period: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJobDeregisterRequest {
    pub mount_point: String,
    pub req_path: String,
}

/// Category of plugin in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    #[default]
    Unknown,
    Credential,
    Database,
    Secrets,
}

impl PluginType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Credential => "auth",
            Self::Database => "database",
            Self::Secrets => "secret",
        }
    }
}

/// Catalog entry visible through [`SystemView::lookup_plugin`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginLookup {
    pub name: String,
    pub plugin_type: PluginType,
    pub version: String,
    pub builtin: bool,
}

fn refused(method: &str) -> LogicalError {
    LogicalError::internal(format!("cannot call {method} from a plugin backend"))
}

/// Host capabilities a backend may call at runtime.
///
/// The plugin lookup methods default to refusing: only the host itself may
/// resolve or spawn plugins.
#[async_trait]
pub trait SystemView: Send + Sync {
    async fn default_lease_ttl(&self, ctx: &Context) -> Result<Duration>;

    async fn max_lease_ttl(&self, ctx: &Context) -> Result<Duration>;

    /// Whether the mount is tainted (being unmounted or remounted).
    async fn tainted(&self, ctx: &Context) -> Result<bool>;

    async fn caching_disabled(&self, ctx: &Context) -> Result<bool>;

    /// Whether the mount is local to this cluster (not replicated).
    async fn local_mount(&self, ctx: &Context) -> Result<bool>;

    async fn mlock_enabled(&self, ctx: &Context) -> Result<bool>;

    async fn replication_state(&self, ctx: &Context) -> Result<ReplicationState>;

    /// Wrap `data` into a single-use token valid for `ttl`.
    async fn response_wrap_data(
        &self,
        ctx: &Context,
        data: Map<String, Value>,
        ttl: Duration,
        jwt: bool,
    ) -> Result<ResponseWrapInfo>;

    async fn entity_info(&self, ctx: &Context, entity_id: &str) -> Result<Option<Entity>>;

    async fn groups_for_entity(&self, ctx: &Context, entity_id: &str) -> Result<Vec<Group>>;

    async fn plugin_env(&self, ctx: &Context) -> Result<PluginEnvironment>;

    async fn generate_password_from_policy(&self, ctx: &Context, policy_name: &str) -> Result<String>;

    async fn cluster_id(&self, ctx: &Context) -> Result<String>;

    async fn generate_identity_token(&self, ctx: &Context, req: IdentityTokenRequest) -> Result<IdentityTokenResponse>;

    /// Returns the rotation ID assigned by the host.
    async fn register_rotation_job(&self, ctx: &Context, cfg: RotationJobConfig) -> Result<String>;

    /// Removing a job that does not exist succeeds.
    async fn deregister_rotation_job(&self, ctx: &Context, req: RotationJobDeregisterRequest) -> Result<()>;

    async fn lookup_plugin(&self, _ctx: &Context, _name: &str, _plugin_type: PluginType) -> Result<PluginLookup> {
        Err(refused("LookupPlugin"))
    }

    async fn lookup_plugin_version(
        &self,
        _ctx: &Context,
        _name: &str,
        _plugin_type: PluginType,
        _version: &str,
    ) -> Result<PluginLookup> {
        Err(refused("LookupPluginVersion"))
    }

    async fn list_versioned_plugins(&self, _ctx: &Context, _plugin_type: PluginType) -> Result<Vec<PluginLookup>> {
        Err(refused("ListVersionedPlugins"))
    }

    async fn new_plugin_client(&self, _ctx: &Context, _name: &str) -> Result<()> {
        Err(refused("NewPluginClient"))
    }
}

/// A [`SystemView`] answering from fixed values.
///
/// Used for backends running without a live host, and swapped in for the
/// real view while the host is in metadata mode.
#[derive(Debug, Clone, Default)]
pub struct StaticSystemView {
    pub default_lease_ttl: Duration,
    pub max_lease_ttl: Duration,
    pub tainted: bool,
    pub caching_disabled: bool,
    pub local_mount: bool,
    pub mlock_enabled: bool,
    pub replication_state: ReplicationState,
    pub entity: Option<Entity>,
    pub groups: Vec<Group>,
    pub plugin_environment: PluginEnvironment,
    /// Passwords handed out per policy name.
    pub password_policies: HashMap<String, String>,
    pub cluster_id: String,
    pub identity_token: Option<IdentityTokenResponse>,
}

#[async_trait]
impl SystemView for StaticSystemView {
    async fn default_lease_ttl(&self, _ctx: &Context) -> Result<Duration> {
        Ok(self.default_lease_ttl)
    }

    async fn max_lease_ttl(&self, _ctx: &Context) -> Result<Duration> {
        Ok(self.max_lease_ttl)
    }

    async fn tainted(&self, _ctx: &Context) -> Result<bool> {
        Ok(self.tainted)
    }

    async fn caching_disabled(&self, _ctx: &Context) -> Result<bool> {
        Ok(self.caching_disabled)
    }

    async fn local_mount(&self, _ctx: &Context) -> Result<bool> {
        Ok(self.local_mount)
    }

    async fn mlock_enabled(&self, _ctx: &Context) -> Result<bool> {
        Ok(self.mlock_enabled)
    }

    async fn replication_state(&self, _ctx: &Context) -> Result<ReplicationState> {
        Ok(self.replication_state)
    }

    async fn response_wrap_data(
        &self,
        _ctx: &Context,
        _data: Map<String, Value>,
        _ttl: Duration,
        _jwt: bool,
    ) -> Result<ResponseWrapInfo> {
        Err(LogicalError::UnsupportedOperation)
    }

    async fn entity_info(&self, _ctx: &Context, _entity_id: &str) -> Result<Option<Entity>> {
        Ok(self.entity.clone())
    }

    async fn groups_for_entity(&self, _ctx: &Context, _entity_id: &str) -> Result<Vec<Group>> {
        Ok(self.groups.clone())
    }

    async fn plugin_env(&self, _ctx: &Context) -> Result<PluginEnvironment> {
        Ok(self.plugin_environment.clone())
    }

    async fn generate_password_from_policy(&self, _ctx: &Context, policy_name: &str) -> Result<String> {
        self.password_policies
            .get(policy_name)
            .cloned()
            .ok_or_else(|| LogicalError::user(format!("password policy '{policy_name}' not found")))
    }

    async fn cluster_id(&self, _ctx: &Context) -> Result<String> {
        Ok(self.cluster_id.clone())
    }

    async fn generate_identity_token(
        &self,
        _ctx: &Context,
        _req: IdentityTokenRequest,
    ) -> Result<IdentityTokenResponse> {
        self.identity_token.clone().ok_or(LogicalError::UnsupportedOperation)
    }

    async fn register_rotation_job(&self, _ctx: &Context, _cfg: RotationJobConfig) -> Result<String> {
        Err(LogicalError::UnsupportedOperation)
    }

    async fn deregister_rotation_job(&self, _ctx: &Context, _req: RotationJobDeregisterRequest) -> Result<()> {
        Ok(())
    }
}
