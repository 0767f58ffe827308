//! Host-side [`Backend`] that forwards every call to a plugin.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::BackendType;
use lockbox_logical::Context;
use lockbox_logical::InitializationRequest;
use lockbox_logical::LogicalError;
use lockbox_logical::NoopStorage;
use lockbox_logical::Paths;
use lockbox_logical::PluginVersion;
use lockbox_logical::Request;
use lockbox_logical::Response;
use lockbox_logical::StaticSystemView;
use lockbox_logical::Storage;
use lockbox_logical::SystemView;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::rpc::MAIN_CHANNEL;
use crate::rpc::Metadata;
use crate::rpc::RpcConnection;
use crate::rpc::Status;
use crate::rpc::metadata;
use crate::rpc::metadata::MULTIPLEX_ID_KEY;
use crate::services::ReverseServices;
use crate::state::InstanceState;
use crate::state::StateTracker;
use crate::wire::Empty;
use crate::wire::HandleExistenceCheckArgs;
use crate::wire::HandleExistenceCheckReply;
use crate::wire::HandleRequestArgs;
use crate::wire::HandleRequestReply;
use crate::wire::InitializeReply;
use crate::wire::InvalidateKeyArgs;
use crate::wire::MultiplexingSupportReply;
use crate::wire::PluginVersionReply;
use crate::wire::SetupArgs;
use crate::wire::SetupReply;
use crate::wire::SpecialPathsReply;
use crate::wire::TypeReply;
use crate::wire::WireRequest;
use crate::wire::decode_err;

/// Reverse servers published by `setup` and torn down by `cleanup`.
#[derive(Debug)]
struct Installed {
    services: ReverseServices,
    broker_id: u32,
}

/// Forwards the [`Backend`] contract to one plugin instance.
pub struct BackendClient {
    name: String,
    conn: RpcConnection,
    /// Routes calls to our instance inside a multiplexed plugin.
    multiplex_id: Option<String>,
    metadata_mode: bool,
    /// Fires when the host stops using this plugin.
    done: CancellationToken,
    installed: ArcSwapOption<Installed>,
    /// The system view from setup, attached to the reverse server on initialize.
    system: Mutex<Option<Arc<dyn SystemView>>>,
    setup_finished: watch::Sender<bool>,
    state: Arc<StateTracker>,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("name", &self.name)
            .field("multiplex_id", &self.multiplex_id)
            .field("metadata_mode", &self.metadata_mode)
            .field("state", &self.state.current())
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    pub fn new(name: impl Into<String>, conn: RpcConnection, done: CancellationToken) -> Self {
        let name = name.into();
        let state = Arc::new(StateTracker::new(name.clone()));
        state.advance(InstanceState::Spawned);
        Self {
            name,
            conn,
            multiplex_id: None,
            metadata_mode: false,
            done,
            installed: ArcSwapOption::empty(),
            system: Mutex::new(None),
            setup_finished: watch::channel(false).0,
            state,
        }
    }

    pub fn with_multiplex_id(mut self, id: impl Into<String>) -> Self {
        self.multiplex_id = Some(id.into());
        self
    }

    pub fn with_metadata_mode(mut self, metadata_mode: bool) -> Self {
        self.metadata_mode = metadata_mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.conn
    }

    pub fn state(&self) -> InstanceState {
        self.state.current()
    }

    /// Broker channel of the reverse servers, once `setup` has run.
    pub fn broker_id(&self) -> Option<u32> {
        self.installed.load().as_ref().map(|i| i.broker_id)
    }

    fn metadata(&self, ctx: &Context) -> Metadata {
        let mut md = metadata::outgoing(ctx);
        if let Some(id) = &self.multiplex_id {
            md.insert(MULTIPLEX_ID_KEY.to_string(), id.clone());
        }
        md
    }

    /// Issue a call that is abandoned when `ctx` is cancelled or the host
    /// stops using the plugin.
    async fn call<Req, Resp>(&self, ctx: &Context, method: &str, req: &Req) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Status::from_logical(&LogicalError::Canceled)),
            _ = self.done.cancelled() => Err(Status::from_logical(&LogicalError::PluginShutdown)),
            reply = self.conn.invoke(MAIN_CHANNEL, method, self.metadata(ctx), req) => reply,
        }
    }

    fn refuse_in_metadata_mode(&self) -> Result<(), LogicalError> {
        if self.metadata_mode {
            Err(LogicalError::ClientInMetadataMode)
        } else {
            Ok(())
        }
    }

    /// Requests are only forwarded between `initialize` and `cleanup`.
    fn require_serving(&self) -> Result<(), LogicalError> {
        match self.state.current() {
            state if state.accepts_requests() => Ok(()),
            InstanceState::CleaningUp | InstanceState::Terminated => Err(LogicalError::NoBackendInstance),
            state => Err(LogicalError::internal(format!("plugin backend '{}' is {state}, not initialized", self.name))),
        }
    }

    async fn wait_for_setup(&self) {
        let mut rx = self.setup_finished.subscribe();
        let _ = rx.wait_for(|finished| *finished).await;
    }

    fn uninstall(&self) {
        if let Some(installed) = self.installed.swap(None) {
            self.conn.unserve(installed.broker_id);
            debug!(plugin = %self.name, broker_id = installed.broker_id, "reverse services stopped");
        }
    }
}

/// Marks setup finished when dropped, whatever the outcome.
struct SetupFinished<'a>(&'a watch::Sender<bool>);

impl Drop for SetupFinished<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn setup(&self, ctx: &Context, config: BackendConfig) -> lockbox_logical::Result<()> {
        let _finished = SetupFinished(&self.setup_finished);

        let services = ReverseServices::detached();
        let (storage, system): (Arc<dyn Storage>, Arc<dyn SystemView>) = if self.metadata_mode {
            (Arc::new(NoopStorage), Arc::new(StaticSystemView::default()))
        } else {
            (config.storage_view.clone(), config.system.clone())
        };
        if self.metadata_mode {
            // Nothing the plugin does in metadata mode may reach real storage.
            services.attach(storage, system, config.events.clone(), config.observations.clone());
        } else {
            if let Some(events) = &config.events {
                services.events.attach(Arc::clone(events));
            }
            if let Some(observations) = &config.observations {
                services.observations.attach(Arc::clone(observations));
            }
            *self.system.lock() = Some(system);
        }

        let broker_id = self.conn.allocate_channel();
        self.conn.serve(broker_id, services.router());
        self.installed.store(Some(Arc::new(Installed { services, broker_id })));

        let args = SetupArgs {
            broker_id,
            config: config.config.clone(),
            backend_uuid: config.backend_uuid.clone(),
        };
        let reply: SetupReply = self.call(ctx, "plugin.Backend/Setup", &args).await?;
        if !reply.err.is_empty() {
            warn!(plugin = %self.name, error = %reply.err, "plugin setup failed");
            return Err(LogicalError::unknown(reply.err));
        }
        self.state.advance(InstanceState::SetupComplete);
        info!(plugin = %self.name, broker_id, metadata_mode = self.metadata_mode, "plugin backend set up");
        Ok(())
    }

    async fn initialize(&self, ctx: &Context, req: InitializationRequest) -> lockbox_logical::Result<()> {
        self.refuse_in_metadata_mode()?;
        if self.state.current().accepts_requests() {
            debug!(plugin = %self.name, "backend already initialized, ignoring");
            return Ok(());
        }

        if let Some(installed) = self.installed.load_full() {
            installed.services.storage.attach(req.storage.clone());
            if let Some(system) = self.system.lock().clone() {
                installed.services.system.attach(system);
            }
        }

        match self.call::<_, InitializeReply>(ctx, "plugin.Backend/Initialize", &Empty {}).await {
            Ok(reply) => decode_err(reply.err)?,
            Err(status) if status.is_unimplemented() => {
                debug!(plugin = %self.name, "plugin does not implement initialize, continuing");
            }
            Err(status) => return Err(status.into()),
        }
        self.state.advance(InstanceState::Initialized);
        self.state.advance(InstanceState::Serving);
        Ok(())
    }

    async fn handle_request(&self, ctx: &Context, req: Request) -> lockbox_logical::Result<Option<Response>> {
        self.refuse_in_metadata_mode()?;
        self.require_serving()?;
        let args = HandleRequestArgs {
            request: WireRequest::try_from(&req)?,
        };
        let reply: HandleRequestReply = self.call(ctx, "plugin.Backend/HandleRequest", &args).await?;
        decode_err(reply.err)?;
        Ok(reply.response.map(Response::try_from).transpose()?)
    }

    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> lockbox_logical::Result<(bool, bool)> {
        self.refuse_in_metadata_mode()?;
        self.require_serving()?;
        let args = HandleExistenceCheckArgs {
            request: WireRequest::try_from(&req)?,
        };
        let reply: HandleExistenceCheckReply = self.call(ctx, "plugin.Backend/HandleExistenceCheck", &args).await?;
        decode_err(reply.err)?;
        Ok((reply.check_found, reply.exists))
    }

    async fn special_paths(&self) -> Option<Paths> {
        let ctx = Context::background();
        match self.call::<_, SpecialPathsReply>(&ctx, "plugin.Backend/SpecialPaths", &Empty {}).await {
            Ok(reply) => reply.paths.map(Paths::from),
            Err(status) => {
                warn!(plugin = %self.name, error = %status, "failed to fetch special paths");
                None
            }
        }
    }

    async fn invalidate_key(&self, ctx: &Context, key: &str) {
        if self.metadata_mode {
            debug!(plugin = %self.name, key, "not invalidating in metadata mode");
            return;
        }
        let args = InvalidateKeyArgs { key: key.to_string() };
        if let Err(status) = self.call::<_, Empty>(ctx, "plugin.Backend/InvalidateKey", &args).await {
            warn!(plugin = %self.name, key, error = %status, "failed to invalidate key");
        }
    }

    async fn cleanup(&self, ctx: &Context) {
        self.state.advance(InstanceState::CleaningUp);
        let result = self.call::<_, Empty>(ctx, "plugin.Backend/Cleanup", &Empty {}).await;
        match &result {
            // The plugin is gone; setup may never publish anything.
            Err(status) if status.is_unavailable() => {
                debug!(plugin = %self.name, "plugin already gone during cleanup");
            }
            other => {
                if let Err(status) = other {
                    warn!(plugin = %self.name, error = %status, "plugin cleanup failed");
                }
                self.wait_for_setup().await;
            }
        }
        self.uninstall();
        self.state.advance(InstanceState::Terminated);
    }

    async fn backend_type(&self) -> BackendType {
        let ctx = Context::background();
        match self.call::<_, TypeReply>(&ctx, "plugin.Backend/Type", &Empty {}).await {
            Ok(reply) => BackendType::from_u32(reply.backend_type),
            Err(status) => {
                warn!(plugin = %self.name, error = %status, "failed to fetch backend type");
                BackendType::Unknown
            }
        }
    }

    async fn plugin_version(&self) -> Option<PluginVersion> {
        let ctx = Context::background();
        match self.call::<_, PluginVersionReply>(&ctx, "plugin.PluginVersion/Version", &Empty {}).await {
            Ok(reply) if reply.plugin_version.is_empty() => None,
            Ok(reply) => Some(PluginVersion {
                version: reply.plugin_version,
            }),
            Err(status) => {
                if !status.is_unimplemented() {
                    warn!(plugin = %self.name, error = %status, "failed to fetch plugin version");
                }
                None
            }
        }
    }

    fn is_external(&self) -> bool {
        true
    }
}

/// Ask a freshly connected plugin whether it can host several instances.
pub async fn multiplexing_support(conn: &RpcConnection) -> bool {
    let reply = conn
        .invoke::<_, MultiplexingSupportReply>(
            MAIN_CHANNEL,
            "plugin.Multiplexing/MultiplexingSupport",
            Metadata::new(),
            &Empty {},
        )
        .await;
    match reply {
        Ok(reply) => reply.supported,
        Err(status) => {
            if !status.is_unimplemented() {
                debug!(error = %status, "multiplexing support query failed");
            }
            false
        }
    }
}

/// Ask the plugin process to exit.
pub async fn request_shutdown(conn: &RpcConnection) -> Result<(), Status> {
    conn.invoke::<_, Empty>(MAIN_CHANNEL, "plugin.Control/Shutdown", Metadata::new(), &Empty {}).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use lockbox_logical::InmemStorage;
    use lockbox_logical::Operation;
    use lockbox_plugin_mock::MockFactory;
    use serde_json::Map;
    use serde_json::Value;

    use super::*;
    use crate::server::BackendServer;

    fn pair(multiplexing: bool, metadata_mode: bool) -> (RpcConnection, Arc<BackendServer>) {
        let (host, plugin) = RpcConnection::in_memory_pair();
        let server = Arc::new(BackendServer::new(
            Arc::new(MockFactory::new()),
            plugin.clone(),
            multiplexing,
            metadata_mode,
        ));
        plugin.serve(MAIN_CHANNEL, server.router());
        (host, server)
    }

    fn config(storage: Arc<InmemStorage>) -> BackendConfig {
        BackendConfig {
            storage_view: storage,
            system: Arc::new(StaticSystemView::default()),
            events: None,
            observations: None,
            backend_uuid: "uuid".into(),
            config: HashMap::new(),
        }
    }

    async fn ready_client() -> (BackendClient, Arc<InmemStorage>) {
        let (host, _server) = pair(false, false);
        let client = BackendClient::new("mock", host, CancellationToken::new());
        let storage = Arc::new(InmemStorage::new());
        let ctx = Context::background();
        client.setup(&ctx, config(storage.clone())).await.unwrap();
        client
            .initialize(&ctx, InitializationRequest {
                storage: storage.clone(),
            })
            .await
            .unwrap();
        (client, storage)
    }

    fn data(value: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("value".into(), Value::from(value));
        data
    }

    #[tokio::test]
    async fn test_basic_request() {
        let (client, storage) = ready_client().await;
        assert_eq!(client.state(), InstanceState::Serving);
        let ctx = Context::background();

        let req = Request::new(Operation::Create, "kv/foo").with_data(data("bar"));
        let resp = client.handle_request(&ctx, req).await.unwrap().unwrap();
        assert_eq!(resp.data["value"], "bar");
        assert!(storage.get(&ctx, "kv/foo").await.unwrap().is_some());

        let check = client
            .handle_existence_check(&ctx, Request::new(Operation::Create, "kv/foo"))
            .await
            .unwrap();
        assert_eq!(check, (true, true));
    }

    #[tokio::test]
    async fn test_second_initialize_keeps_first_storage() {
        let (client, storage) = ready_client().await;
        let ctx = Context::background();
        let other = Arc::new(InmemStorage::new());
        client.initialize(&ctx, InitializationRequest { storage: other.clone() }).await.unwrap();
        assert_eq!(client.state(), InstanceState::Serving);

        let req = Request::new(Operation::Create, "kv/foo").with_data(data("bar"));
        client.handle_request(&ctx, req).await.unwrap();
        assert!(storage.get(&ctx, "kv/foo").await.unwrap().is_some());
        assert!(other.get(&ctx, "kv/foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requests_need_initialize() {
        let (host, server) = pair(false, false);
        let client = BackendClient::new("mock", host, CancellationToken::new());
        let ctx = Context::background();
        client.setup(&ctx, config(Arc::new(InmemStorage::new()))).await.unwrap();
        assert_eq!(server.instance_count().await, 1);

        let err = client.handle_request(&ctx, Request::new(Operation::Read, "internal")).await.unwrap_err();
        assert!(matches!(err, LogicalError::Internal { .. }), "{err:?}");
        let err = client.handle_existence_check(&ctx, Request::new(Operation::Read, "internal")).await.unwrap_err();
        assert!(matches!(err, LogicalError::Internal { .. }), "{err:?}");

        client.cleanup(&ctx).await;
        let err = client.handle_request(&ctx, Request::new(Operation::Read, "internal")).await.unwrap_err();
        assert_eq!(err, LogicalError::NoBackendInstance);
    }

    #[tokio::test]
    async fn test_error_drops_response() {
        let (client, _) = ready_client().await;
        let err = client
            .handle_request(&Context::background(), Request::new(Operation::Read, "error"))
            .await
            .unwrap_err();
        assert_eq!(err, LogicalError::user("mock failure"));
    }

    #[tokio::test]
    async fn test_invalidate_key() {
        let (client, _) = ready_client().await;
        let ctx = Context::background();
        let read = || Request::new(Operation::Read, "internal");

        let resp = client.handle_request(&ctx, read()).await.unwrap().unwrap();
        assert_ne!(resp.data["value"], "");
        client.invalidate_key(&ctx, "internal").await;
        let resp = client.handle_request(&ctx, read()).await.unwrap().unwrap();
        assert_eq!(resp.data["value"], "");
    }

    #[tokio::test]
    async fn test_declared_metadata() {
        let (client, _) = ready_client().await;
        assert_eq!(client.plugin_version().await.unwrap().version, lockbox_plugin_mock::MOCK_VERSION);
        assert!(!client.special_paths().await.unwrap().allow_snapshot_read.is_empty());
        assert_eq!(client.backend_type().await, BackendType::Logical);
        assert!(client.is_external());
    }

    #[tokio::test]
    async fn test_metadata_mode_client_refuses() {
        let (host, _server) = pair(false, true);
        let client = BackendClient::new("mock", host, CancellationToken::new()).with_metadata_mode(true);
        let ctx = Context::background();
        client.setup(&ctx, config(Arc::new(InmemStorage::new()))).await.unwrap();

        let err = client
            .initialize(&ctx, InitializationRequest {
                storage: Arc::new(InmemStorage::new()),
            })
            .await
            .unwrap_err();
        assert_eq!(err, LogicalError::ClientInMetadataMode);
        let err = client.handle_request(&ctx, Request::new(Operation::Read, "kv/foo")).await.unwrap_err();
        assert_eq!(err, LogicalError::ClientInMetadataMode);
        assert!(client.special_paths().await.is_some());
        assert_eq!(client.backend_type().await, BackendType::Logical);
    }

    #[tokio::test]
    async fn test_shutdown_after_plugin_death() {
        let (client, _) = ready_client().await;
        let ctx = Context::background();
        client.connection().close().await;

        let err = client.handle_request(&ctx, Request::new(Operation::Read, "kv/foo")).await.unwrap_err();
        assert!(err.is_plugin_shutdown());

        // Cleanup must not hang on a dead plugin.
        tokio::time::timeout(Duration::from_secs(5), client.cleanup(&ctx)).await.unwrap();
        assert_eq!(client.state(), InstanceState::Terminated);
        assert!(client.broker_id().is_none());
    }

    #[tokio::test]
    async fn test_done_token_aborts_calls() {
        let (host, _server) = pair(false, false);
        let done = CancellationToken::new();
        let client = BackendClient::new("mock", host, done.clone());
        done.cancel();
        let err = client
            .setup(&Context::background(), config(Arc::new(InmemStorage::new())))
            .await
            .unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_setup() {
        let (host, _server) = pair(false, false);
        let client = Arc::new(BackendClient::new("mock", host, CancellationToken::new()));
        let ctx = Context::background();

        let setup = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let _ = client.setup(&Context::background(), config(Arc::new(InmemStorage::new()))).await;
            })
        };
        let cleanup = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.cleanup(&ctx).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            setup.await.unwrap();
            cleanup.await.unwrap();
        })
        .await
        .unwrap();
        assert!(client.broker_id().is_none());
    }

    #[tokio::test]
    async fn test_multiplexed_clients_share_a_connection() {
        let (host, server) = pair(true, false);
        assert!(multiplexing_support(&host).await);

        let ctx = Context::background();
        let a = BackendClient::new("mock", host.clone(), CancellationToken::new()).with_multiplex_id("aaaa");
        let b = BackendClient::new("mock", host, CancellationToken::new()).with_multiplex_id("bbbb");
        let storage_a = Arc::new(InmemStorage::new());
        let storage_b = Arc::new(InmemStorage::new());
        a.setup(&ctx, config(storage_a.clone())).await.unwrap();
        b.setup(&ctx, config(storage_b.clone())).await.unwrap();
        a.initialize(&ctx, InitializationRequest { storage: storage_a.clone() }).await.unwrap();
        b.initialize(&ctx, InitializationRequest { storage: storage_b.clone() }).await.unwrap();
        assert_eq!(server.instance_count().await, 2);

        a.handle_request(&ctx, Request::new(Operation::Create, "kv/only-a").with_data(data("x")))
            .await
            .unwrap();
        assert!(storage_a.get(&ctx, "kv/only-a").await.unwrap().is_some());
        assert!(storage_b.get(&ctx, "kv/only-a").await.unwrap().is_none());

        a.cleanup(&ctx).await;
        assert_eq!(server.instance_count().await, 1);
        assert!(b.handle_request(&ctx, Request::new(Operation::Read, "kv/only-a")).await.unwrap().is_none());
    }
}
