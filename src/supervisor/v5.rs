//! Host handle for a plugin spoken to over protocol version 5.
//!
//! Restarts are left to the process registry: a dead plugin surfaces as
//! `plugin-shutdown` and the next client spawns a replacement.

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
use tracing::debug;

use super::catalog::PluginClient;
use crate::client::BackendClient;

pub struct BackendPluginClientV5 {
    client: Arc<BackendClient>,
    plugin: PluginClient,
}

impl BackendPluginClientV5 {
    pub fn new(client: Arc<BackendClient>, plugin: PluginClient) -> Self {
        Self { client, plugin }
    }

    pub fn client(&self) -> &Arc<BackendClient> {
        &self.client
    }

    pub fn plugin(&self) -> &PluginClient {
        &self.plugin
    }
}

#[async_trait]
impl Backend for BackendPluginClientV5 {
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

    /// Tears the instance down, then reloads the process when `ctx` carries
    /// the reload marker and closes it otherwise.
    async fn cleanup(&self, ctx: &Context) {
        self.client.cleanup(ctx).await;
        if ctx.is_plugin_reload() {
            debug!(plugin = %self.plugin.name(), "cleanup for reload");
            self.plugin.reload().await;
        } else {
            self.plugin.close().await;
        }
    }

    async fn backend_type(&self) -> BackendType {
        self.client.backend_type().await
    }

    /// The declared version, or an empty one when the plugin has none.
    async fn plugin_version(&self) -> Option<PluginVersion> {
        Some(self.client.plugin_version().await.unwrap_or_default())
    }

    fn is_external(&self) -> bool {
        true
    }
}
