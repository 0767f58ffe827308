//! The contract every backend implements, built in or external.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::context::Context;
use crate::error::Result;
use crate::events::EventSender;
use crate::events::ObservationRecorder;
use crate::request::Request;
use crate::response::Response;
use crate::storage::Storage;
use crate::system_view::SystemView;

/// What a backend provides: secrets or authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    #[default]
    Unknown,
    Logical,
    Credential,
}

impl BackendType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Logical => 1,
            Self::Credential => 2,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Logical,
            2 => Self::Credential,
            _ => Self::Unknown,
        }
    }
}

/// Path sets with special handling, declared by the backend.
///
/// Entries are path patterns relative to the mount; a trailing `*` matches
/// any suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paths {
    /// Require a root token.
    pub root: Vec<String>,
    /// Served without a token.
    pub unauthenticated: Vec<String>,
    /// Stored locally, never replicated.
    pub local_storage: Vec<String>,
    pub seal_wrap_storage: Vec<String>,
    pub write_forwarded_storage: Vec<String>,
    /// Accept raw bodies instead of JSON.
    pub binary: Vec<String>,
    pub limited: Vec<String>,
    /// Readable while the host serves a snapshot.
    pub allow_snapshot_read: Vec<String>,
}

/// Version a plugin reports for itself. Empty means "no version".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersion {
    pub version: String,
}

/// Passed to [`Backend::initialize`].
#[derive(Clone)]
pub struct InitializationRequest {
    pub storage: Arc<dyn Storage>,
}

impl fmt::Debug for InitializationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializationRequest").finish_non_exhaustive()
    }
}

/// Everything a backend receives when it is set up.
#[derive(Clone)]
pub struct BackendConfig {
    pub storage_view: Arc<dyn Storage>,
    pub system: Arc<dyn SystemView>,
    pub events: Option<Arc<dyn EventSender>>,
    pub observations: Option<Arc<dyn ObservationRecorder>>,
    pub backend_uuid: String,
    pub config: HashMap<String, String>,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("backend_uuid", &self.backend_uuid)
            .field("config", &self.config)
            .field("events", &self.events.is_some())
            .field("observations", &self.observations.is_some())
            .finish_non_exhaustive()
    }
}

/// A pluggable provider of a path subtree.
///
/// `setup` runs once before anything else. `initialize` runs at most once
/// afterwards and is the first point where storage may be touched.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn setup(&self, ctx: &Context, config: BackendConfig) -> Result<()>;

    async fn initialize(&self, ctx: &Context, req: InitializationRequest) -> Result<()>;

    /// `Ok(None)` means the backend handled the request without a body.
    async fn handle_request(&self, ctx: &Context, req: Request) -> Result<Option<Response>>;

    /// Returns `(check_found, exists)`. When `check_found` is false the host
    /// falls back to treating the write as an update.
    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> Result<(bool, bool)>;

    async fn special_paths(&self) -> Option<Paths>;

    async fn invalidate_key(&self, ctx: &Context, key: &str);

    async fn cleanup(&self, ctx: &Context);

    async fn backend_type(&self) -> BackendType;

    /// The version the backend reports, when it reports one.
    async fn plugin_version(&self) -> Option<PluginVersion> {
        None
    }

    /// True for backends hosted in an external plugin process.
    fn is_external(&self) -> bool {
        false
    }
}

/// Builds backends from a setup configuration.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Construct a backend and run its `setup`.
    async fn create(&self, ctx: &Context, config: BackendConfig) -> Result<Arc<dyn Backend>>;
}
