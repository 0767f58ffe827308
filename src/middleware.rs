//! Backend wrapper that traces every call.
//!
//! Each method emits a `started` event and a `finished` event carrying the
//! elapsed time, plus the request path, invalidated key or error where
//! there is one. Return values pass through untouched.

use std::sync::Arc;
use std::time::Instant;

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
use tracing::Level;
use tracing::trace;

const TARGET: &str = "lockbox::middleware";

/// Wrap `inner` in a [`TracingBackend`] when trace events would be recorded.
pub fn maybe_trace(name: impl Into<String>, inner: Arc<dyn Backend>) -> Arc<dyn Backend> {
    if tracing::enabled!(target: TARGET, Level::TRACE) {
        Arc::new(TracingBackend::new(name, inner))
    } else {
        inner
    }
}

pub struct TracingBackend {
    name: String,
    inner: Arc<dyn Backend>,
}

impl TracingBackend {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl Backend for TracingBackend {
    async fn setup(&self, ctx: &Context, config: BackendConfig) -> Result<()> {
        trace!(target: TARGET, plugin = %self.name, status = "started", "setup");
        let start = Instant::now();
        let result = self.inner.setup(ctx, config).await;
        let err = result.as_ref().err().map(ToString::to_string);
        trace!(target: TARGET, plugin = %self.name, status = "finished", took = ?start.elapsed(), err = ?err, "setup");
        result
    }

    async fn initialize(&self, ctx: &Context, req: InitializationRequest) -> Result<()> {
        trace!(target: TARGET, plugin = %self.name, status = "started", "initialize");
        let start = Instant::now();
        let result = self.inner.initialize(ctx, req).await;
        let err = result.as_ref().err().map(ToString::to_string);
        trace!(target: TARGET, plugin = %self.name, status = "finished", took = ?start.elapsed(), err = ?err, "initialize");
        result
    }

    async fn handle_request(&self, ctx: &Context, req: Request) -> Result<Option<Response>> {
        let path = req.path.clone();
        trace!(target: TARGET, plugin = %self.name, path = %path, status = "started", "handle request");
        let start = Instant::now();
        let result = self.inner.handle_request(ctx, req).await;
        let err = result.as_ref().err().map(ToString::to_string);
        trace!(
            target: TARGET,
            plugin = %self.name,
            path = %path,
            status = "finished",
            took = ?start.elapsed(),
            err = ?err,
            "handle request"
        );
        result
    }

    async fn handle_existence_check(&self, ctx: &Context, req: Request) -> Result<(bool, bool)> {
        let path = req.path.clone();
        trace!(target: TARGET, plugin = %self.name, path = %path, status = "started", "handle existence check");
        let start = Instant::now();
        let result = self.inner.handle_existence_check(ctx, req).await;
        let err = result.as_ref().err().map(ToString::to_string);
        trace!(
            target: TARGET,
            plugin = %self.name,
            path = %path,
            status = "finished",
            took = ?start.elapsed(),
            err = ?err,
            "handle existence check"
        );
        result
    }

    async fn special_paths(&self) -> Option<Paths> {
        trace!(target: TARGET, plugin = %self.name, status = "started", "special paths");
        let start = Instant::now();
        let paths = self.inner.special_paths().await;
        trace!(target: TARGET, plugin = %self.name, status = "finished", took = ?start.elapsed(), "special paths");
        paths
    }

    async fn invalidate_key(&self, ctx: &Context, key: &str) {
        trace!(target: TARGET, plugin = %self.name, key, status = "started", "invalidate key");
        let start = Instant::now();
        self.inner.invalidate_key(ctx, key).await;
        trace!(target: TARGET, plugin = %self.name, key, status = "finished", took = ?start.elapsed(), "invalidate key");
    }

    async fn cleanup(&self, ctx: &Context) {
        trace!(target: TARGET, plugin = %self.name, status = "started", "cleanup");
        let start = Instant::now();
        self.inner.cleanup(ctx).await;
        trace!(target: TARGET, plugin = %self.name, status = "finished", took = ?start.elapsed(), "cleanup");
    }

    async fn backend_type(&self) -> BackendType {
        trace!(target: TARGET, plugin = %self.name, status = "started", "type");
        let start = Instant::now();
        let ty = self.inner.backend_type().await;
        trace!(target: TARGET, plugin = %self.name, status = "finished", took = ?start.elapsed(), "type");
        ty
    }

    async fn plugin_version(&self) -> Option<PluginVersion> {
        self.inner.plugin_version().await
    }

    fn is_external(&self) -> bool {
        self.inner.is_external()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lockbox_logical::BackendFactory;
    use lockbox_logical::InmemStorage;
    use lockbox_logical::LogicalError;
    use lockbox_logical::Operation;
    use lockbox_logical::StaticSystemView;
    use lockbox_plugin_mock::MockFactory;

    use super::*;

    async fn mock() -> Arc<dyn Backend> {
        let config = BackendConfig {
            storage_view: Arc::new(InmemStorage::new()),
            system: Arc::new(StaticSystemView::default()),
            events: None,
            observations: None,
            backend_uuid: "uuid".into(),
            config: HashMap::new(),
        };
        MockFactory::new().create(&Context::background(), config).await.unwrap()
    }

    #[tokio::test]
    async fn test_passthrough() {
        let inner = mock().await;
        let traced = TracingBackend::new("mock", Arc::clone(&inner));
        let ctx = Context::background();

        assert_eq!(traced.special_paths().await, inner.special_paths().await);
        assert_eq!(traced.backend_type().await, inner.backend_type().await);
        assert_eq!(traced.plugin_version().await, inner.plugin_version().await);
        assert_eq!(traced.is_external(), inner.is_external());

        let err = traced.handle_request(&ctx, Request::new(Operation::Read, "error")).await.unwrap_err();
        assert_eq!(err, LogicalError::user("mock failure"));

        let resp = traced.handle_request(&ctx, Request::new(Operation::Read, "internal")).await.unwrap();
        assert!(resp.is_some());
        traced.invalidate_key(&ctx, "internal").await;
        let resp = inner.handle_request(&ctx, Request::new(Operation::Read, "internal")).await.unwrap().unwrap();
        assert_eq!(resp.data["value"], "");
    }

    #[tokio::test]
    async fn test_not_installed_without_trace_subscriber() {
        let inner = mock().await;
        let wrapped = maybe_trace("mock", Arc::clone(&inner));
        assert!(Arc::ptr_eq(&inner, &wrapped));
    }
}
