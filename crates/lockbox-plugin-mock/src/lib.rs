//! A mock backend for exercising the plugin subsystem.
//!
//! Paths served relative to the mount:
//!
//! | Path | Behaviour |
//! |---|---|
//! | `kv/<key>` | CRUD and list through the request's storage view |
//! | `internal` | in-memory value, cleared by invalidating the `internal` key |
//! | `audit`, `audit/plain` | a secret with and without supplemental audit data |
//! | `system/ttl` | the default lease TTL read from the system view |
//! | `events` | publishes a `mock-event` |
//! | `error` | fails with a user error |
//! | `crash` | runs the crash hook (exits the process by default) |

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::BackendFactory;
use lockbox_logical::BackendType;
use lockbox_logical::Context;
use lockbox_logical::EventData;
use lockbox_logical::EventSender;
use lockbox_logical::InitializationRequest;
use lockbox_logical::LogicalError;
use lockbox_logical::Operation;
use lockbox_logical::Paths;
use lockbox_logical::PluginVersion;
use lockbox_logical::Request;
use lockbox_logical::Response;
use lockbox_logical::Result;
use lockbox_logical::StorageEntry;
use lockbox_logical::SystemView;
use parking_lot::RwLock;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

/// Version every mock instance reports.
pub const MOCK_VERSION: &str = "v0.0.0+mock";

/// Initial value served at `internal`.
pub const INTERNAL_VALUE: &str = "bar";

/// Setup config key selecting the backend type (`logical` or `credential`).
pub const CONFIG_BACKEND_TYPE: &str = "backend_type";

const KV_PREFIX: &str = "kv/";

type CrashHook = Arc<dyn Fn() + Send + Sync>;

pub struct MockBackend {
    backend_type: BackendType,
    internal: RwLock<String>,
    system: Arc<dyn SystemView>,
    events: Option<Arc<dyn EventSender>>,
    crash: CrashHook,
}

impl MockBackend {
    fn new(config: &BackendConfig, crash: CrashHook) -> Self {
        let backend_type = match config.config.get(CONFIG_BACKEND_TYPE).map(String::as_str) {
            Some("credential") => BackendType::Credential,
            _ => BackendType::Logical,
        };
        Self {
            backend_type,
            internal: RwLock::new(INTERNAL_VALUE.to_string()),
            system: config.system.clone(),
            events: config.events.clone(),
            crash,
        }
    }

    async fn handle_kv(&self, ctx: &Context, req: &Request) -> Result<Option<Response>> {
        let storage = req.storage.require()?;
        let key = req.path.as_str();
        match req.operation {
            Operation::Create | Operation::Update => {
                let entry = StorageEntry::from_json(key, &req.data)?;
                storage.put(ctx, &entry).await?;
                Ok(Some(Response::with_data(req.data.clone())))
            }
            Operation::Read => match storage.get(ctx, key).await? {
                Some(entry) => Ok(Some(Response::with_data(entry.decode_json()?))),
                None => Ok(None),
            },
            Operation::Delete => {
                storage.delete(ctx, key).await?;
                Ok(None)
            }
            Operation::List => {
                let keys = storage.list(ctx, key).await?;
                Ok(Some(Response::with_data(object(json!({ "keys": keys })))))
            }
            _ => Err(LogicalError::UnsupportedOperation),
        }
    }

    async fn handle_internal(&self, req: &Request) -> Result<Option<Response>> {
        match req.operation {
            Operation::Read => {
                let value = self.internal.read().clone();
                Ok(Some(Response::with_data(object(json!({ "value": value })))))
            }
            Operation::Create | Operation::Update => {
                let value = req.get_str("value").ok_or(LogicalError::InvalidRequest)?;
                *self.internal.write() = value.to_string();
                Ok(None)
            }
            _ => Err(LogicalError::UnsupportedOperation),
        }
    }

    fn handle_audit(&self, with_supplemental: bool) -> Response {
        let mut resp = Response::with_data(object(json!({ "secret": "my-fancy-secret" })));
        if with_supplemental {
            resp.supplemental_audit_request_data = Some(object(json!({ "foo": "bar", "baz": "qux" })));
            resp.supplemental_audit_response_data = Some(object(json!({ "foo": "bar", "baz": "qux", "quux": "corge" })));
        }
        resp
    }

    async fn handle_event(&self, ctx: &Context, req: &Request) -> Result<Option<Response>> {
        let Some(events) = &self.events else {
            return Err(LogicalError::internal("no event sender configured"));
        };
        let event = EventData {
            id: req.id.clone(),
            metadata: req.data.clone(),
            entity_ids: Vec::new(),
            note: "mock event".to_string(),
        };
        events.send_event(ctx, "mock-event", event).await?;
        Ok(None)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn setup(&self, _ctx: &Context, _config: BackendConfig) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, _ctx: &Context, _req: InitializationRequest) -> Result<()> {
        Ok(())
    }

    async fn handle_request(&self, ctx: &Context, req: Request) -> Result<Option<Response>> {
        debug!(operation = %req.operation, path = %req.path, "mock request");
        if req.operation == Operation::Help {
            return Ok(Some(Response::with_data(object(json!({ "help": "mock backend" })))));
        }

        match req.path.as_str() {
            path if path.starts_with(KV_PREFIX) => self.handle_kv(ctx, &req).await,
            "internal" => self.handle_internal(&req).await,
            "audit" => Ok(Some(self.handle_audit(true))),
            "audit/plain" => Ok(Some(self.handle_audit(false))),
            "system/ttl" => {
                let ttl = self.system.default_lease_ttl(ctx).await?;
                Ok(Some(Response::with_data(object(json!({ "ttl": ttl.as_secs() })))))
            }
            "events" => self.handle_event(ctx, &req).await,
            "error" => Err(LogicalError::user("mock failure")),
            "crash" => {
                info!("mock backend crashing on request");
                (self.crash)();
                Err(LogicalError::internal("crash hook returned"))
            }
            _ => Err(LogicalError::UnsupportedPath),
        }
    }

    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> Result<(bool, bool)> {
        if !req.path.starts_with(KV_PREFIX) {
            return Ok((false, false));
        }
        let storage = req.storage.require()?;
        let exists = storage.get(ctx, &req.path).await?.is_some();
        Ok((true, exists))
    }

    async fn special_paths(&self) -> Option<Paths> {
        Some(Paths {
            root: vec!["root/*".to_string()],
            unauthenticated: vec!["login".to_string()],
            local_storage: vec!["local/*".to_string()],
            seal_wrap_storage: vec!["wrapped/*".to_string()],
            allow_snapshot_read: vec!["kv/*".to_string()],
            ..Paths::default()
        })
    }

    async fn invalidate_key(&self, _ctx: &Context, key: &str) {
        if key == "internal" {
            self.internal.write().clear();
        }
    }

    async fn cleanup(&self, _ctx: &Context) {
        debug!("mock backend cleaned up");
    }

    async fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    async fn plugin_version(&self) -> Option<PluginVersion> {
        Some(PluginVersion {
            version: MOCK_VERSION.to_string(),
        })
    }
}

/// Builds [`MockBackend`]s.
#[derive(Clone)]
pub struct MockFactory {
    crash: CrashHook,
}

impl MockFactory {
    /// A factory whose backends exit the process on `crash`.
    pub fn new() -> Self {
        Self {
            crash: Arc::new(|| {
                std::process::exit(1);
            }),
        }
    }

    /// A factory whose backends run `hook` on `crash` instead of exiting.
    pub fn with_crash_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self { crash: Arc::new(hook) }
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn create(&self, ctx: &Context, config: BackendConfig) -> Result<Arc<dyn Backend>> {
        let backend = MockBackend::new(&config, self.crash.clone());
        backend.setup(ctx, config).await?;
        Ok(Arc::new(backend))
    }
}
