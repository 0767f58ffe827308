//! Host-side supervision of plugin processes.
//!
//! [`new_plugin_backend`] turns a catalog runner into a mounted backend:
//! it connects a [`PluginClient`] (spawning, reattaching or sharing a
//! process), runs setup, and picks the handle for the negotiated protocol.
//! Version 5 plugins get a [`BackendPluginClientV5`]; versions 3 and 4 get
//! a [`RestartingBackend`] that rebuilds the plugin after a crash.

pub mod catalog;
pub mod classic;
pub mod process;
pub mod runner;
pub mod v5;

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::Context;
use lockbox_logical::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use catalog::PluginCatalog;
pub use catalog::PluginClient;
pub use classic::BackendLoader;
pub use classic::ClassicBackend;
pub use classic::RestartingBackend;
pub use process::PluginProcess;
pub use process::SpawnSettings;
pub use runner::PluginRunner;
pub use runner::RunnerKey;
pub use v5::BackendPluginClientV5;

use crate::client::BackendClient;
use crate::middleware;

/// Connect `plugin` to a new backend client and run setup on it.
async fn connect_backend(
    ctx: &Context,
    plugin: &PluginClient,
    done: CancellationToken,
    config: BackendConfig,
) -> Result<Arc<BackendClient>> {
    let mut client =
        BackendClient::new(plugin.name(), plugin.connection().clone(), done).with_metadata_mode(plugin.metadata_mode());
    if plugin.is_multiplexed() {
        client = client.with_multiplex_id(plugin.id());
    }
    let client = Arc::new(client);
    if let Err(err) = client.setup(ctx, config).await {
        plugin.close().await;
        return Err(err);
    }
    Ok(client)
}

/// Rebuilds a classic plugin from its runner.
struct RunnerLoader {
    catalog: Arc<PluginCatalog>,
    runner: PluginRunner,
    config: BackendConfig,
    metadata_mode: bool,
    /// The already connected client used by the first load.
    first: Mutex<Option<PluginClient>>,
}

#[async_trait]
impl BackendLoader for RunnerLoader {
    async fn load(&self, ctx: &Context) -> Result<Arc<dyn Backend>> {
        let first = self.first.lock().take();
        let plugin = match first {
            Some(plugin) => plugin,
            None => self.catalog.new_plugin_client(&self.runner, self.metadata_mode).await?,
        };
        let client = connect_backend(ctx, &plugin, self.catalog.done_token(), self.config.clone()).await?;
        Ok(Arc::new(ClassicBackend::new(client, plugin)))
    }

    fn is_shut_down(&self) -> bool {
        self.catalog.done_token().is_cancelled()
    }
}

/// Start (or share) the plugin process for `runner` and return a backend
/// that has completed setup.
pub async fn new_plugin_backend(
    ctx: &Context,
    catalog: &Arc<PluginCatalog>,
    runner: &PluginRunner,
    config: BackendConfig,
    metadata_mode: bool,
) -> Result<Arc<dyn Backend>> {
    let plugin = catalog.new_plugin_client(runner, metadata_mode).await?;

    let backend: Arc<dyn Backend> = if plugin.protocol_version().auto_mtls {
        let client = connect_backend(ctx, &plugin, catalog.done_token(), config).await?;
        Arc::new(BackendPluginClientV5::new(client, plugin))
    } else {
        let loader = Arc::new(RunnerLoader {
            catalog: Arc::clone(catalog),
            runner: runner.clone(),
            config,
            metadata_mode,
            first: Mutex::new(Some(plugin)),
        });
        Arc::new(RestartingBackend::start(ctx, runner.name.clone(), loader).await?)
    };

    Ok(middleware::maybe_trace(runner.name.clone(), backend))
}
