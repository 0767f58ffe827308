//! Bidirectional multiplexed RPC over one byte stream.
//!
//! Both ends of a plugin connection can issue calls and serve them at the
//! same time. Calls are matched to replies by a per-sender id; services are
//! registered per channel, so the host can expose a separate set of reverse
//! services for every backend instance over the same connection.
//!
//! One reader task and one writer task own the stream. Incoming calls are
//! handled on their own tasks so a handler may call back into the peer
//! while its own call is still pending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use bytes::BytesMut;
use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::frame::Frame;
use super::frame::Metadata;
use super::frame::codec;
use super::service::IncomingCall;
use super::service::Router;
use super::service::decode;
use super::service::encode;
use super::status::Status;

/// Frames queued for the writer before senders wait.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Buffer size of [`RpcConnection::in_memory_pair`].
const IN_MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

/// How long `close` waits for the goodbye frame to reach the peer.
const GOODBYE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which end of the connection this is.
///
/// The host allocates odd channel ids and the plugin even ones, so both
/// sides can hand out channels without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Plugin,
}

type ReplySender = oneshot::Sender<Result<Vec<u8>, Status>>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, ReplySender>,
    closed: bool,
}

struct Shared {
    role: Role,
    outbound: mpsc::Sender<Frame>,
    /// Our calls awaiting a reply.
    pending: Mutex<PendingCalls>,
    /// Peer calls being handled, keyed by the peer's call id.
    inflight: Mutex<HashMap<u64, CancellationToken>>,
    channels: RwLock<HashMap<u32, Arc<Router>>>,
    next_call_id: AtomicU64,
    next_channel_id: AtomicU32,
    closed: CancellationToken,
}

impl Shared {
    /// Fail every pending call and stop serving. Idempotent.
    fn shutdown(&self, reason: &str) {
        let drained = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        if !drained.is_empty() {
            debug!(pending = drained.len(), reason, "failing pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(Status::unavailable(reason)));
        }
        // Services may hold this connection; dropping them breaks the cycle.
        self.channels.write().clear();
        self.closed.cancel();
    }

    fn dispatch(self: &Arc<Self>, id: u64, channel: u32, method: String, metadata: Metadata, body: Vec<u8>) {
        let router = self.channels.read().get(&channel).cloned();
        let token = self.closed.child_token();
        self.inflight.lock().insert(id, token.clone());

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = match router {
                None => Some(Err(Status::unimplemented(format!("no services on channel {channel}")))),
                Some(router) => {
                    let call = IncomingCall {
                        metadata,
                        body,
                        cancel: token.clone(),
                    };
                    tokio::select! {
                        result = router.dispatch(&method, call) => Some(result),
                        _ = token.cancelled() => None,
                    }
                }
            };
            shared.inflight.lock().remove(&id);
            match result {
                Some(result) => {
                    if shared.outbound.send(Frame::Reply { id, result }).await.is_err() {
                        trace!(id, method = %method, "connection closed before reply was sent");
                    }
                }
                None => trace!(id, method = %method, "call cancelled"),
            }
        });
    }
}

/// Removes a pending call and tells the peer to abort it when the caller
/// stops waiting early.
struct PendingCallGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for PendingCallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.shared.pending.lock().calls.remove(&self.id).is_some();
        if removed {
            let _ = self.shared.outbound.try_send(Frame::Cancel { id: self.id });
        }
    }
}

/// Handle to one plugin connection. Cheap to clone.
#[derive(Clone)]
pub struct RpcConnection {
    shared: Arc<Shared>,
}

impl RpcConnection {
    /// Take ownership of `io` and start the reader and writer tasks.
    pub fn new<T>(io: T, role: Role) -> Self
    where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {
        let (conn, tasks) = Self::unstarted(io, role);
        tasks.start();
        conn
    }

    /// Like [`RpcConnection::new`], but nothing is read from `io` until the
    /// returned tasks are started. Register services in between so the
    /// peer's first call cannot arrive before its channel is served.
    pub fn unstarted<T>(io: T, role: Role) -> (Self, ConnectionTasks)
    where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {
        let (sink, stream) = Framed::new(io, codec()).split();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let first_channel = match role {
            Role::Host => 1,
            Role::Plugin => 2,
        };
        let shared = Arc::new(Shared {
            role,
            outbound,
            pending: Mutex::new(PendingCalls::default()),
            inflight: Mutex::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            next_channel_id: AtomicU32::new(first_channel),
            closed: CancellationToken::new(),
        });
        let tasks = ConnectionTasks {
            write: Box::pin(write_loop(sink, rx, Arc::clone(&shared))),
            read: Box::pin(read_loop(stream, Arc::clone(&shared))),
        };
        (Self { shared }, tasks)
    }

    /// Host and plugin ends joined by an in-memory pipe.
    pub fn in_memory_pair() -> (Self, Self) {
        let (host, plugin) = tokio::io::duplex(IN_MEMORY_PIPE_CAPACITY);
        (Self::new(host, Role::Host), Self::new(plugin, Role::Plugin))
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Serve `router` on `channel`, replacing whatever was there.
    pub fn serve(&self, channel: u32, router: Router) {
        self.shared.channels.write().insert(channel, Arc::new(router));
    }

    /// Stop serving `channel`. Returns whether anything was registered.
    pub fn unserve(&self, channel: u32) -> bool {
        self.shared.channels.write().remove(&channel).is_some()
    }

    pub fn is_serving(&self, channel: u32) -> bool {
        self.shared.channels.read().contains_key(&channel)
    }

    /// A channel id no other caller on this side has been given.
    pub fn allocate_channel(&self) -> u32 {
        self.shared.next_channel_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Issue a raw call and wait for its reply.
    ///
    /// Dropping the returned future cancels the call on the peer.
    pub async fn call(&self, channel: u32, method: &str, metadata: Metadata, body: Vec<u8>) -> Result<Vec<u8>, Status> {
        let id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(Status::unavailable("connection closed"));
            }
            pending.calls.insert(id, tx);
        }
        let mut guard = PendingCallGuard {
            shared: &self.shared,
            id,
            armed: true,
        };

        let frame = Frame::Call {
            id,
            channel,
            method: method.to_string(),
            metadata,
            body,
        };
        if self.shared.outbound.send(frame).await.is_err() {
            return Err(Status::unavailable("connection closed"));
        }

        let result = rx.await.unwrap_or_else(|_| Err(Status::unavailable("connection closed")));
        guard.armed = false;
        result
    }

    /// Issue a typed call.
    pub async fn invoke<Req, Resp>(&self, channel: u32, method: &str, metadata: Metadata, req: &Req) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = encode(req)?;
        let reply = self.call(channel, method, metadata, body).await?;
        decode(&reply)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Say goodbye to the peer and shut the connection down.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if self.shared.outbound.send(Frame::Goodbye).await.is_ok() {
            let _ = tokio::time::timeout(GOODBYE_FLUSH_TIMEOUT, self.shared.closed.cancelled()).await;
        }
        self.shared.shutdown("connection closed");
    }
}

/// Reader and writer of a connection built with [`RpcConnection::unstarted`].
#[must_use = "the connection does no I/O until started"]
pub struct ConnectionTasks {
    write: BoxFuture<'static, ()>,
    read: BoxFuture<'static, ()>,
}

impl ConnectionTasks {
    pub fn start(self) {
        tokio::spawn(self.write);
        tokio::spawn(self.read);
    }
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where S: Sink<Bytes, Error = std::io::Error> + Unpin {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shared.closed.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        let goodbye = matches!(frame, Frame::Goodbye);
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Bytes::from(bytes)).await {
            debug!(error = %e, "plugin connection write failed");
            break;
        }
        if goodbye {
            break;
        }
    }
    let _ = sink.close().await;
    shared.shutdown("connection closed");
}

async fn read_loop<S>(mut stream: S, shared: Arc<Shared>)
where S: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin {
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shared.closed.cancelled() => break,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(error = %e, "plugin connection read failed");
                break;
            }
            None => break,
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame, closing connection");
                break;
            }
        };
        match frame {
            Frame::Call {
                id,
                channel,
                method,
                metadata,
                body,
            } => shared.dispatch(id, channel, method, metadata, body),
            Frame::Reply { id, result } => {
                let tx = shared.pending.lock().calls.remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => trace!(id, "reply for unknown or abandoned call"),
                }
            }
            Frame::Cancel { id } => {
                if let Some(token) = shared.inflight.lock().remove(&id) {
                    token.cancel();
                }
            }
            Frame::Goodbye => break,
        }
    }
    shared.shutdown("connection closed by peer");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::rpc::frame::MAIN_CHANNEL;
    use crate::rpc::service::Service;
    use crate::rpc::service::unknown_method;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        fn name(&self) -> &'static str {
            "test.Echo"
        }

        async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
            match method {
                "Echo" => Ok(call.body),
                "Metadata" => encode(&call.metadata.get("k").cloned()),
                other => Err(unknown_method(self.name(), other)),
            }
        }
    }

    /// Blocks until cancelled, then reports the cancellation.
    struct Hang {
        cancelled: Arc<Notify>,
    }

    #[async_trait]
    impl Service for Hang {
        fn name(&self) -> &'static str {
            "test.Hang"
        }

        async fn call(&self, _method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
            call.cancel.cancelled().await;
            self.cancelled.notify_one();
            Err(Status::cancelled("cancelled"))
        }
    }

    /// Calls back into the peer's channel while serving.
    struct Reentrant {
        conn: RpcConnection,
        channel: u32,
    }

    #[async_trait]
    impl Service for Reentrant {
        fn name(&self) -> &'static str {
            "test.Reentrant"
        }

        async fn call(&self, _method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
            let mut body = self.conn.call(self.channel, "test.Echo/Echo", Metadata::new(), call.body).await?;
            body.push(0xff);
            Ok(body)
        }
    }

    fn pair() -> (RpcConnection, RpcConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (RpcConnection::new(a, Role::Host), RpcConnection::new(b, Role::Plugin))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_buffered_before_start_is_served() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let host = RpcConnection::new(a, Role::Host);
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call(MAIN_CHANNEL, "test.Echo/Echo", Metadata::new(), vec![9]).await }
        });
        // Let the call frame reach the pipe before the plugin end exists.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (plugin, tasks) = RpcConnection::unstarted(b, Role::Plugin);
        plugin.serve(MAIN_CHANNEL, Router::new().with_service(Arc::new(Echo)));
        tasks.start();

        let reply = tokio::time::timeout(Duration::from_secs(5), call).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, vec![9]);
    }

    #[tokio::test]
    async fn test_call_roundtrip_both_directions() {
        let (host, plugin) = pair();
        plugin.serve(MAIN_CHANNEL, Router::new().with_service(Arc::new(Echo)));
        host.serve(7, Router::new().with_service(Arc::new(Echo)));

        let reply = host.call(MAIN_CHANNEL, "test.Echo/Echo", Metadata::new(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(reply, vec![1, 2, 3]);
        let reply = plugin.call(7, "test.Echo/Echo", Metadata::new(), vec![4]).await.unwrap();
        assert_eq!(reply, vec![4]);
    }

    #[tokio::test]
    async fn test_metadata_reaches_handler() {
        let (host, plugin) = pair();
        plugin.serve(MAIN_CHANNEL, Router::new().with_service(Arc::new(Echo)));
        let mut md = Metadata::new();
        md.insert("k".into(), "v".into());
        let seen: Option<String> = host.invoke(MAIN_CHANNEL, "test.Echo/Metadata", md, &()).await.unwrap();
        assert_eq!(seen.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_unimplemented() {
        let (host, _plugin) = pair();
        let err = host.call(42, "test.Echo/Echo", Metadata::new(), vec![]).await.unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[tokio::test]
    async fn test_reentrant_call_during_handling() {
        let (host, plugin) = pair();
        let channel = host.allocate_channel();
        host.serve(channel, Router::new().with_service(Arc::new(Echo)));
        plugin.serve(
            MAIN_CHANNEL,
            Router::new().with_service(Arc::new(Reentrant {
                conn: plugin.clone(),
                channel,
            })),
        );

        let reply = host.call(MAIN_CHANNEL, "test.Reentrant/Go", Metadata::new(), vec![1]).await.unwrap();
        assert_eq!(reply, vec![1, 0xff]);
    }

    #[tokio::test]
    async fn test_dropped_call_cancels_handler() {
        let (host, plugin) = pair();
        let cancelled = Arc::new(Notify::new());
        plugin.serve(
            MAIN_CHANNEL,
            Router::new().with_service(Arc::new(Hang {
                cancelled: cancelled.clone(),
            })),
        );

        let call = host.call(MAIN_CHANNEL, "test.Hang/Wait", Metadata::new(), vec![]);
        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());
        tokio::time::timeout(Duration::from_secs(5), cancelled.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let (host, plugin) = pair();
        plugin.serve(
            MAIN_CHANNEL,
            Router::new().with_service(Arc::new(Hang {
                cancelled: Arc::new(Notify::new()),
            })),
        );

        let pending = {
            let host = host.clone();
            tokio::spawn(async move { host.call(MAIN_CHANNEL, "test.Hang/Wait", Metadata::new(), vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        plugin.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_unavailable());
        tokio::time::timeout(Duration::from_secs(5), host.closed()).await.unwrap();
        let err = host.call(MAIN_CHANNEL, "test.Echo/Echo", Metadata::new(), vec![]).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_stream_drop_closes_connection() {
        let (a, b) = tokio::io::duplex(1024);
        let host = RpcConnection::new(a, Role::Host);
        drop(b);
        tokio::time::timeout(Duration::from_secs(5), host.closed()).await.unwrap();
        assert!(host.is_closed());
    }

    #[tokio::test]
    async fn test_channel_allocation_by_role() {
        let (host, plugin) = pair();
        assert_eq!(host.allocate_channel(), 1);
        assert_eq!(host.allocate_channel(), 3);
        assert_eq!(plugin.allocate_channel(), 2);
        assert_eq!(plugin.allocate_channel(), 4);
    }

    #[tokio::test]
    async fn test_unserve() {
        let (host, plugin) = pair();
        plugin.serve(5, Router::new().with_service(Arc::new(Echo)));
        assert!(plugin.is_serving(5));
        assert!(plugin.unserve(5));
        assert!(!plugin.unserve(5));
        let err = host.call(5, "test.Echo/Echo", Metadata::new(), vec![]).await.unwrap_err();
        assert!(err.is_unimplemented());
    }
}
