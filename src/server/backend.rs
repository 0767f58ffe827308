//! Plugin-side dispatch of backend calls.
//!
//! The server keeps one instance per backend the host has set up. Without
//! multiplexing there is a single instance under [`SINGLE_INSTANCE_KEY`];
//! with multiplexing the host names the instance in the call metadata.
//! The instance table is locked only to insert, remove or look up an
//! instance. Each instance has its own gate: calls hold it shared while they
//! run and cleanup takes it exclusively, so cleanup waits for that
//! instance's in-flight requests without stalling any other instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::BackendFactory;
use lockbox_logical::Context;
use lockbox_logical::InitializationRequest;
use lockbox_logical::LogicalError;
use lockbox_logical::Request;
use lockbox_logical::StorageHandle;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::SINGLE_INSTANCE_KEY;
use crate::rpc::IncomingCall;
use crate::rpc::Metadata;
use crate::rpc::Router;
use crate::rpc::RpcConnection;
use crate::rpc::Service;
use crate::rpc::Status;
use crate::rpc::metadata;
use crate::rpc::metadata::MULTIPLEX_ID_KEY;
use crate::rpc::service::encode;
use crate::rpc::service::unknown_method;
use crate::services::BACKEND_SERVICE;
use crate::services::CONTROL_SERVICE;
use crate::services::MULTIPLEXING_SERVICE;
use crate::services::PLUGIN_VERSION_SERVICE;
use crate::services::ReverseClients;
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
use crate::wire::WireError;
use crate::wire::WirePaths;
use crate::wire::WireResponse;

/// One backend set up by the host.
struct Instance {
    backend: Arc<dyn Backend>,
    clients: ReverseClients,
    /// Whether cleanup has run.
    gate: RwLock<bool>,
    initialized: Mutex<bool>,
}

impl Instance {
    fn new(backend: Arc<dyn Backend>, clients: ReverseClients) -> Self {
        Self {
            backend,
            clients,
            gate: RwLock::new(false),
            initialized: Mutex::new(false),
        }
    }

    /// Waits for in-flight calls, then cleans the backend up once.
    async fn close(&self, ctx: &Context) {
        let mut closed = self.gate.write().await;
        if !*closed {
            *closed = true;
            self.backend.cleanup(ctx).await;
        }
    }
}

/// Serves the backend contract to the host over one connection.
pub struct BackendServer {
    factory: Arc<dyn BackendFactory>,
    conn: RpcConnection,
    multiplexing: bool,
    metadata_mode: bool,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServer")
            .field("multiplexing", &self.multiplexing)
            .field("metadata_mode", &self.metadata_mode)
            .finish_non_exhaustive()
    }
}

impl BackendServer {
    pub fn new(factory: Arc<dyn BackendFactory>, conn: RpcConnection, multiplexing: bool, metadata_mode: bool) -> Self {
        Self {
            factory,
            conn,
            multiplexing,
            metadata_mode,
            instances: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// All services a plugin exposes on the main channel.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .with_service(Arc::clone(self) as Arc<dyn Service>)
            .with_service(Arc::new(PluginVersionService(Arc::clone(self))))
            .with_service(Arc::new(MultiplexingService(Arc::clone(self))))
            .with_service(Arc::new(ControlService(Arc::clone(self))))
    }

    /// Fires when the host asks the plugin to exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Clean up every instance. Used when the plugin exits.
    pub async fn cleanup_all(&self) {
        let drained: Vec<(String, Arc<Instance>)> = self.instances.write().await.drain().collect();
        let ctx = Context::background();
        for (key, instance) in drained {
            debug!(instance = %key, "cleaning up backend instance on exit");
            instance.close(&ctx).await;
        }
    }

    fn instance_key(&self, md: &Metadata) -> Result<String, Status> {
        if !self.multiplexing {
            return Ok(SINGLE_INSTANCE_KEY.to_string());
        }
        md.get(MULTIPLEX_ID_KEY)
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(|| Status::invalid_argument("missing plugin multiplexing metadata"))
    }

    fn refuse_in_metadata_mode(&self) -> Result<(), LogicalError> {
        if self.metadata_mode {
            Err(LogicalError::ServerInMetadataMode)
        } else {
            Ok(())
        }
    }

    async fn instance(&self, key: &str) -> Result<Arc<Instance>, LogicalError> {
        self.instances.read().await.get(key).cloned().ok_or(LogicalError::NoBackendInstance)
    }

    async fn setup(&self, ctx: &Context, key: String, args: SetupArgs) -> SetupReply {
        let clients = ReverseClients::new(self.conn.clone(), args.broker_id);
        let config = BackendConfig {
            storage_view: clients.storage.clone(),
            system: clients.system.clone(),
            events: Some(clients.events.clone()),
            observations: Some(clients.observations.clone()),
            backend_uuid: args.backend_uuid,
            config: args.config,
        };
        match self.factory.create(ctx, config).await {
            Ok(backend) => {
                info!(instance = %key, broker_id = args.broker_id, "backend instance set up");
                let instance = Arc::new(Instance::new(backend, clients));
                let replaced = self.instances.write().await.insert(key.clone(), instance);
                if let Some(old) = replaced {
                    warn!(instance = %key, "setup for an existing instance, replaced it");
                    old.close(ctx).await;
                }
                SetupReply::default()
            }
            Err(e) => {
                warn!(instance = %key, error = %e, "backend setup failed");
                SetupReply { err: e.to_string() }
            }
        }
    }

    async fn cleanup(&self, ctx: &Context, key: &str) -> Result<(), LogicalError> {
        let instance = self.instances.write().await.remove(key).ok_or(LogicalError::NoBackendInstance)?;
        instance.close(ctx).await;
        debug!(instance = %key, "backend instance cleaned up");
        Ok(())
    }
}

#[async_trait]
impl Service for BackendServer {
    fn name(&self) -> &'static str {
        BACKEND_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        let ctx = metadata::incoming(&call.metadata, call.cancel.clone());
        let key = self.instance_key(&call.metadata)?;

        match method {
            "Setup" => {
                let args: SetupArgs = call.decode()?;
                encode(&self.setup(&ctx, key, args).await)
            }
            "Cleanup" => {
                self.cleanup(&ctx, &key).await?;
                encode(&Empty {})
            }
            _ => {
                let instance = self.instance(&key).await?;
                let closed = instance.gate.read().await;
                if *closed {
                    return Err(LogicalError::NoBackendInstance.into());
                }
                self.call_instance(method, call, &ctx, &instance).await
            }
        }
    }
}

impl BackendServer {
    async fn call_instance(
        &self,
        method: &str,
        call: IncomingCall,
        ctx: &Context,
        instance: &Instance,
    ) -> Result<Vec<u8>, Status> {
        let backend = &instance.backend;
        match method {
            "Initialize" => {
                if let Err(e) = self.refuse_in_metadata_mode() {
                    return encode(&InitializeReply {
                        err: Some(WireError::from(e)),
                    });
                }
                let mut initialized = instance.initialized.lock().await;
                if *initialized {
                    debug!("backend instance already initialized, ignoring");
                    return encode(&InitializeReply { err: None });
                }
                let req = InitializationRequest {
                    storage: instance.clients.storage.clone(),
                };
                let result = backend.initialize(ctx, req).await;
                *initialized = result.is_ok();
                encode(&InitializeReply {
                    err: result.err().map(WireError::from),
                })
            }
            "HandleRequest" => {
                if let Err(e) = self.refuse_in_metadata_mode() {
                    return encode(&HandleRequestReply {
                        response: None,
                        err: Some(WireError::from(e)),
                    });
                }
                let args: HandleRequestArgs = call.decode()?;
                let mut req = Request::try_from(args.request)?;
                req.storage = StorageHandle::new(instance.clients.storage.clone());
                match backend.handle_request(ctx, req).await {
                    Ok(resp) => {
                        let response = resp
                            .as_ref()
                            .map(WireResponse::try_from)
                            .transpose()
                            .map_err(|e| Status::internal(e.to_string()))?;
                        encode(&HandleRequestReply { response, err: None })
                    }
                    Err(e) => encode(&HandleRequestReply {
                        response: None,
                        err: Some(WireError::from(e)),
                    }),
                }
            }
            "HandleExistenceCheck" => {
                if let Err(e) = self.refuse_in_metadata_mode() {
                    return encode(&HandleExistenceCheckReply {
                        err: Some(WireError::from(e)),
                        ..HandleExistenceCheckReply::default()
                    });
                }
                let args: HandleExistenceCheckArgs = call.decode()?;
                let mut req = Request::try_from(args.request)?;
                req.storage = StorageHandle::new(instance.clients.storage.clone());
                let reply = match backend.handle_existence_check(ctx, req).await {
                    Ok((check_found, exists)) => HandleExistenceCheckReply {
                        check_found,
                        exists,
                        err: None,
                    },
                    Err(e) => HandleExistenceCheckReply {
                        err: Some(WireError::from(e)),
                        ..HandleExistenceCheckReply::default()
                    },
                };
                encode(&reply)
            }
            "SpecialPaths" => {
                let paths = backend.special_paths().await;
                encode(&SpecialPathsReply {
                    paths: paths.as_ref().map(WirePaths::from),
                })
            }
            "InvalidateKey" => {
                self.refuse_in_metadata_mode()?;
                let args: InvalidateKeyArgs = call.decode()?;
                backend.invalidate_key(ctx, &args.key).await;
                encode(&Empty {})
            }
            "Type" => encode(&TypeReply::from(backend.backend_type().await)),
            other => Err(unknown_method(BACKEND_SERVICE, other)),
        }
    }
}

/// `plugin.PluginVersion/Version`, answered per instance.
struct PluginVersionService(Arc<BackendServer>);

#[async_trait]
impl Service for PluginVersionService {
    fn name(&self) -> &'static str {
        PLUGIN_VERSION_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        if method != "Version" {
            return Err(unknown_method(PLUGIN_VERSION_SERVICE, method));
        }
        let key = self.0.instance_key(&call.metadata)?;
        let instance = self.0.instance(&key).await?;
        let closed = instance.gate.read().await;
        if *closed {
            return Err(LogicalError::NoBackendInstance.into());
        }
        let version = instance.backend.plugin_version().await.map(|v| v.version).unwrap_or_default();
        encode(&PluginVersionReply {
            plugin_version: version,
        })
    }
}

/// `plugin.Multiplexing/MultiplexingSupport`.
struct MultiplexingService(Arc<BackendServer>);

#[async_trait]
impl Service for MultiplexingService {
    fn name(&self) -> &'static str {
        MULTIPLEXING_SERVICE
    }

    async fn call(&self, method: &str, _call: IncomingCall) -> Result<Vec<u8>, Status> {
        match method {
            "MultiplexingSupport" => encode(&MultiplexingSupportReply {
                supported: self.0.multiplexing,
            }),
            other => Err(unknown_method(MULTIPLEXING_SERVICE, other)),
        }
    }
}

/// `plugin.Control/Shutdown` asks the plugin process to exit.
struct ControlService(Arc<BackendServer>);

#[async_trait]
impl Service for ControlService {
    fn name(&self) -> &'static str {
        CONTROL_SERVICE
    }

    async fn call(&self, method: &str, _call: IncomingCall) -> Result<Vec<u8>, Status> {
        match method {
            "Shutdown" => {
                info!("host requested plugin shutdown");
                self.0.shutdown.cancel();
                encode(&Empty {})
            }
            other => Err(unknown_method(CONTROL_SERVICE, other)),
        }
    }
}
