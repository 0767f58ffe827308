//! Host handles for plugins spoken to over protocol versions 3 and 4.
//!
//! [`ClassicBackend`] owns its process outright and kills it on cleanup.
//! [`RestartingBackend`] puts a canary in front of any loader so a crashed
//! plugin is rebuilt once and the failed call retried once, however many
//! requests observed the crash.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::BackendType;
use lockbox_logical::Context;
use lockbox_logical::InitializationRequest;
use lockbox_logical::Paths;
use lockbox_logical::PluginVersion;
use lockbox_logical::Request;
use lockbox_logical::Response;
use lockbox_logical::Result;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use super::catalog::PluginClient;
use crate::client::BackendClient;
use crate::state::InstanceState;
use crate::state::StateTracker;

// ============================================================================
// Classic client
// ============================================================================

pub struct ClassicBackend {
    client: Arc<BackendClient>,
    plugin: PluginClient,
}

impl ClassicBackend {
    pub fn new(client: Arc<BackendClient>, plugin: PluginClient) -> Self {
        Self { client, plugin }
    }
}

#[async_trait]
impl Backend for ClassicBackend {
    async fn setup(&self, ctx: &Context, config: BackendConfig) -> Result<()> {
        self.client.setup(ctx, config).await
    }

    async fn initialize(&self, ctx: &Context, req: InitializationRequest) -> Result<()> {
        self.client.initialize(ctx, req).await
    }

    async fn handle_request(&self, ctx: &Context, req: Request) -> Result<Option<Response>> {
        self.client.handle_request(ctx, req).await
    }

    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> Result<(bool, bool)> {
        self.client.handle_existence_check(ctx, req).await
    }

    async fn special_paths(&self) -> Option<Paths> {
        self.client.special_paths().await
    }

    async fn invalidate_key(&self, ctx: &Context, key: &str) {
        self.client.invalidate_key(ctx, key).await
    }

    async fn cleanup(&self, ctx: &Context) {
        self.client.cleanup(ctx).await;
        self.plugin.close().await;
    }

    async fn backend_type(&self) -> BackendType {
        self.client.backend_type().await
    }

    async fn plugin_version(&self) -> Option<PluginVersion> {
        self.client.plugin_version().await
    }

    fn is_external(&self) -> bool {
        true
    }
}

// ============================================================================
// Restart on crash
// ============================================================================

/// Produces a fully set up backend; called once up front and again after
/// every crash.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn load(&self, ctx: &Context) -> Result<Arc<dyn Backend>>;

    /// A shut down loader is never asked to rebuild.
    fn is_shut_down(&self) -> bool {
        false
    }
}

struct Loaded {
    backend: Arc<dyn Backend>,
    /// Changes on every rebuild.
    canary: String,
}

pub struct RestartingBackend {
    name: String,
    loader: Arc<dyn BackendLoader>,
    loaded: RwLock<Loaded>,
    /// Replayed into rebuilt backends once the original was initialized.
    init: Mutex<Option<InitializationRequest>>,
    state: Arc<StateTracker>,
}

impl RestartingBackend {
    /// Load the first backend through `loader`.
    pub async fn start(ctx: &Context, name: impl Into<String>, loader: Arc<dyn BackendLoader>) -> Result<Self> {
        let name = name.into();
        let state = Arc::new(StateTracker::new(name.clone()));
        state.advance(InstanceState::Spawned);
        let backend = loader.load(ctx).await?;
        state.advance(InstanceState::SetupComplete);
        Ok(Self {
            name,
            loader,
            loaded: RwLock::new(Loaded {
                backend,
                canary: new_canary(),
            }),
            init: Mutex::new(None),
            state,
        })
    }

    pub fn state(&self) -> InstanceState {
        self.state.current()
    }

    /// Run `call` against the current backend. On `plugin-shutdown`, rebuild
    /// unless another caller already did, then retry exactly once. Nothing
    /// is rebuilt once the loader has shut down.
    async fn with_restart<T, F, Fut>(&self, ctx: &Context, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let canary = {
            let loaded = self.loaded.read().await;
            match call(Arc::clone(&loaded.backend)).await {
                Err(err) if err.is_plugin_shutdown() && !self.loader.is_shut_down() => loaded.canary.clone(),
                other => return other,
            }
        };

        self.rebuild(ctx, &canary).await?;

        let loaded = self.loaded.read().await;
        call(Arc::clone(&loaded.backend)).await
    }

    async fn rebuild(&self, ctx: &Context, seen: &str) -> Result<()> {
        let mut loaded = self.loaded.write().await;
        if loaded.canary != seen {
            return Ok(());
        }

        warn!(plugin = %self.name, "plugin shut down, rebuilding");
        self.state.advance(InstanceState::Spawned);
        loaded.backend.cleanup(ctx).await;

        let backend = self.loader.load(ctx).await?;
        self.state.advance(InstanceState::SetupComplete);
        let init = self.init.lock().clone();
        if let Some(req) = init {
            backend.initialize(ctx, req).await?;
            self.state.advance(InstanceState::Initialized);
            self.state.advance(InstanceState::Serving);
        }

        loaded.backend = backend;
        loaded.canary = new_canary();
        info!(plugin = %self.name, "plugin rebuilt");
        Ok(())
    }
}

fn new_canary() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl Backend for RestartingBackend {
    /// The loader already ran setup; this re-runs it on the current backend.
    async fn setup(&self, ctx: &Context, config: BackendConfig) -> Result<()> {
        let loaded = self.loaded.read().await;
        loaded.backend.setup(ctx, config).await
    }

    async fn initialize(&self, ctx: &Context, req: InitializationRequest) -> Result<()> {
        *self.init.lock() = Some(req.clone());
        self.with_restart(ctx, |b| {
            let req = req.clone();
            async move { b.initialize(ctx, req).await }
        })
        .await?;
        self.state.advance(InstanceState::Initialized);
        self.state.advance(InstanceState::Serving);
        Ok(())
    }

    async fn handle_request(&self, ctx: &Context, req: Request) -> Result<Option<Response>> {
        self.with_restart(ctx, |b| {
            let req = req.clone();
            async move { b.handle_request(ctx, req).await }
        })
        .await
    }

    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> Result<(bool, bool)> {
        self.with_restart(ctx, |b| {
            let req = req.clone();
            async move { b.handle_existence_check(ctx, req).await }
        })
        .await
    }

    async fn special_paths(&self) -> Option<Paths> {
        self.loaded.read().await.backend.special_paths().await
    }

    async fn invalidate_key(&self, ctx: &Context, key: &str) {
        self.loaded.read().await.backend.invalidate_key(ctx, key).await
    }

    async fn cleanup(&self, ctx: &Context) {
        self.state.advance(InstanceState::CleaningUp);
        let loaded = self.loaded.write().await;
        loaded.backend.cleanup(ctx).await;
        self.state.advance(InstanceState::Terminated);
    }

    async fn backend_type(&self) -> BackendType {
        self.loaded.read().await.backend.backend_type().await
    }

    async fn plugin_version(&self) -> Option<PluginVersion> {
        self.loaded.read().await.backend.plugin_version().await
    }

    fn is_external(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use lockbox_logical::InmemStorage;
    use lockbox_logical::LogicalError;
    use lockbox_logical::Operation;

    use super::*;

    /// Answers every request unless it has crashed.
    struct FakePlugin {
        dead: AtomicBool,
        initialized: AtomicBool,
        generation: usize,
    }

    #[async_trait]
    impl Backend for FakePlugin {
        async fn setup(&self, _ctx: &Context, _config: BackendConfig) -> Result<()> {
            Ok(())
        }

        async fn initialize(&self, _ctx: &Context, _req: InitializationRequest) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn handle_request(&self, _ctx: &Context, _req: Request) -> Result<Option<Response>> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.dead.load(Ordering::SeqCst) {
                return Err(LogicalError::PluginShutdown);
            }
            let mut data = serde_json::Map::new();
            data.insert("generation".into(), self.generation.into());
            Ok(Some(Response::with_data(data)))
        }

        async fn handle_existence_check(&self, _ctx: &Context, _req: Request) -> Result<(bool, bool)> {
            if self.dead.load(Ordering::SeqCst) {
                return Err(LogicalError::PluginShutdown);
            }
            Ok((true, false))
        }

        async fn special_paths(&self) -> Option<Paths> {
            None
        }

        async fn invalidate_key(&self, _ctx: &Context, _key: &str) {}

        async fn cleanup(&self, _ctx: &Context) {}

        async fn backend_type(&self) -> BackendType {
            BackendType::Logical
        }
    }

    /// The first load crashes immediately; later loads depend on `healthy`.
    struct FakeLoader {
        loads: AtomicUsize,
        healthy: bool,
        shut_down: AtomicBool,
        last: Mutex<Option<Arc<FakePlugin>>>,
    }

    impl FakeLoader {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                healthy,
                shut_down: AtomicBool::new(false),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl BackendLoader for FakeLoader {
        async fn load(&self, _ctx: &Context) -> Result<Arc<dyn Backend>> {
            let generation = self.loads.fetch_add(1, Ordering::SeqCst);
            let plugin = Arc::new(FakePlugin {
                dead: AtomicBool::new(generation == 0 || !self.healthy),
                initialized: AtomicBool::new(false),
                generation,
            });
            *self.last.lock() = Some(Arc::clone(&plugin));
            Ok(plugin)
        }

        fn is_shut_down(&self) -> bool {
            self.shut_down.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_concurrent_crash_rebuilds_once() {
        let loader = FakeLoader::new(true);
        let ctx = Context::background();
        let backend = Arc::new(RestartingBackend::start(&ctx, "fake", loader.clone()).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                backend.handle_request(&Context::background(), Request::new(Operation::Read, "x")).await
            }));
        }
        for task in tasks {
            let resp = task.await.unwrap().unwrap().unwrap();
            assert_eq!(resp.data["generation"], 1);
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_reported() {
        let loader = FakeLoader::new(false);
        let ctx = Context::background();
        let backend = RestartingBackend::start(&ctx, "fake", loader.clone()).await.unwrap();

        let err = backend.handle_request(&ctx, Request::new(Operation::Read, "x")).await.unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        let err = backend.handle_existence_check(&ctx, Request::new(Operation::Read, "x")).await.unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_rebuild_after_loader_shut_down() {
        let loader = FakeLoader::new(true);
        let ctx = Context::background();
        let backend = RestartingBackend::start(&ctx, "fake", loader.clone()).await.unwrap();
        loader.shut_down.store(true, Ordering::SeqCst);

        let err = backend.handle_request(&ctx, Request::new(Operation::Read, "x")).await.unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
        let err = backend.handle_existence_check(&ctx, Request::new(Operation::Read, "x")).await.unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rebuild_replays_initialize() {
        let loader = FakeLoader::new(true);
        let ctx = Context::background();
        let backend = RestartingBackend::start(&ctx, "fake", loader.clone()).await.unwrap();

        // Initialize itself does not fail on a dead plugin.
        backend
            .initialize(&ctx, InitializationRequest {
                storage: Arc::new(InmemStorage::new()),
            })
            .await
            .unwrap();
        assert_eq!(backend.state(), InstanceState::Serving);

        backend.handle_request(&ctx, Request::new(Operation::Read, "x")).await.unwrap();
        let rebuilt = loader.last.lock().clone().unwrap();
        assert_eq!(rebuilt.generation, 1);
        assert!(rebuilt.initialized.load(Ordering::SeqCst));
        assert_eq!(backend.state(), InstanceState::Serving);

        backend.cleanup(&ctx).await;
        assert_eq!(backend.state(), InstanceState::Terminated);
    }

    #[tokio::test]
    async fn test_business_errors_not_retried() {
        struct Failing;

        #[async_trait]
        impl Backend for Failing {
            async fn setup(&self, _ctx: &Context, _config: BackendConfig) -> Result<()> {
                Ok(())
            }
            async fn initialize(&self, _ctx: &Context, _req: InitializationRequest) -> Result<()> {
                Ok(())
            }
            async fn handle_request(&self, _ctx: &Context, _req: Request) -> Result<Option<Response>> {
                Err(LogicalError::PermissionDenied)
            }
            async fn handle_existence_check(&self, _ctx: &Context, _req: Request) -> Result<(bool, bool)> {
                Ok((false, false))
            }
            async fn special_paths(&self) -> Option<Paths> {
                None
            }
            async fn invalidate_key(&self, _ctx: &Context, _key: &str) {}
            async fn cleanup(&self, _ctx: &Context) {}
            async fn backend_type(&self) -> BackendType {
                BackendType::Logical
            }
        }

        struct Once(AtomicUsize);

        #[async_trait]
        impl BackendLoader for Once {
            async fn load(&self, _ctx: &Context) -> Result<Arc<dyn Backend>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Failing))
            }
        }

        let loader = Arc::new(Once(AtomicUsize::new(0)));
        let ctx = Context::background();
        let backend = RestartingBackend::start(&ctx, "failing", loader.clone()).await.unwrap();
        let err = backend.handle_request(&ctx, Request::new(Operation::Read, "x")).await.unwrap_err();
        assert_eq!(err, LogicalError::PermissionDenied);
        assert_eq!(loader.0.load(Ordering::SeqCst), 1);
    }
}
