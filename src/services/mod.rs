//! Reverse services: host capabilities served to plugins.
//!
//! Each service has a server half, which runs inside the host on the
//! instance's broker channel, and a client half, which the plugin hands to
//! its backend in place of the real capability. The server's implementation
//! lives in a [`Slot`] that the host fills once the backend is initialized;
//! until then every call is refused with a `missing-*` error.

pub mod events;
pub mod observations;
pub mod storage;
pub mod system_view;

use std::fmt;
use std::sync::Arc;

use lockbox_logical::Context;
use lockbox_logical::EventSender;
use lockbox_logical::LogicalError;
use lockbox_logical::ObservationRecorder;
use lockbox_logical::Storage;
use lockbox_logical::SystemView;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use self::events::EventsClient;
pub use self::events::EventsServer;
pub use self::observations::ObservationsClient;
pub use self::observations::ObservationsServer;
pub use self::storage::StorageClient;
pub use self::storage::StorageServer;
pub use self::system_view::SystemViewClient;
pub use self::system_view::SystemViewServer;
use crate::rpc::Router;
use crate::rpc::RpcConnection;
use crate::rpc::metadata;

pub const BACKEND_SERVICE: &str = "plugin.Backend";
pub const PLUGIN_VERSION_SERVICE: &str = "plugin.PluginVersion";
pub const MULTIPLEXING_SERVICE: &str = "plugin.Multiplexing";
pub const CONTROL_SERVICE: &str = "plugin.Control";
pub const STORAGE_SERVICE: &str = "plugin.Storage";
pub const SYSTEM_VIEW_SERVICE: &str = "plugin.SystemView";
pub const EVENTS_SERVICE: &str = "plugin.Events";
pub const OBSERVATIONS_SERVICE: &str = "plugin.Observations";

/// An implementation that may be attached after serving has started.
pub struct Slot<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Slot<T> {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn with(value: Arc<T>) -> Self {
        Self {
            inner: RwLock::new(Some(value)),
        }
    }

    pub fn attach(&self, value: Arc<T>) {
        *self.inner.write() = Some(value);
    }

    pub fn detach(&self) {
        *self.inner.write() = None;
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("attached", &self.is_attached()).finish()
    }
}

/// The four reverse servers for one backend instance.
#[derive(Debug, Clone)]
pub struct ReverseServices {
    pub storage: Arc<StorageServer>,
    pub system: Arc<SystemViewServer>,
    pub events: Arc<EventsServer>,
    pub observations: Arc<ObservationsServer>,
}

impl ReverseServices {
    /// Servers with nothing attached yet.
    pub fn detached() -> Self {
        Self {
            storage: Arc::new(StorageServer::detached()),
            system: Arc::new(SystemViewServer::detached()),
            events: Arc::new(EventsServer::detached()),
            observations: Arc::new(ObservationsServer::detached()),
        }
    }

    /// Attach the capabilities the backend was initialized with.
    pub fn attach(
        &self,
        storage: Arc<dyn Storage>,
        system: Arc<dyn SystemView>,
        events: Option<Arc<dyn EventSender>>,
        observations: Option<Arc<dyn ObservationRecorder>>,
    ) {
        self.storage.attach(storage);
        self.system.attach(system);
        if let Some(events) = events {
            self.events.attach(events);
        }
        if let Some(observations) = observations {
            self.observations.attach(observations);
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .with_service(self.storage.clone())
            .with_service(self.system.clone())
            .with_service(self.events.clone())
            .with_service(self.observations.clone())
    }
}

/// Clients for the reverse services a host serves on `channel`.
#[derive(Debug, Clone)]
pub struct ReverseClients {
    pub storage: Arc<StorageClient>,
    pub system: Arc<SystemViewClient>,
    pub events: Arc<EventsClient>,
    pub observations: Arc<ObservationsClient>,
}

impl ReverseClients {
    pub fn new(conn: RpcConnection, channel: u32) -> Self {
        Self {
            storage: Arc::new(StorageClient::new(conn.clone(), channel)),
            system: Arc::new(SystemViewClient::new(conn.clone(), channel)),
            events: Arc::new(EventsClient::new(conn.clone(), channel)),
            observations: Arc::new(ObservationsClient::new(conn, channel)),
        }
    }
}

/// Issue a call on behalf of `ctx`, abandoning it when `ctx` is cancelled.
pub(crate) async fn invoke<Req, Resp>(
    conn: &RpcConnection,
    channel: u32,
    path: &str,
    ctx: &Context,
    req: &Req,
) -> Result<Resp, LogicalError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(LogicalError::Canceled),
        reply = conn.invoke(channel, path, metadata::outgoing(ctx), req) => reply.map_err(LogicalError::from),
    }
}
