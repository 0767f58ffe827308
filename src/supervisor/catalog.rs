//! Plugin catalog and the registry of live plugin processes.
//!
//! Each [`PluginClient`] is one logical connection to a plugin process.
//! Processes that support multiplexing are shared by every client whose
//! runner has the same [`RunnerKey`]; the client id doubles as the
//! multiplex id the host injects into each call.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lockbox_logical::PluginType;
use parking_lot::RwLock;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rustls::ClientConfig;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::process::PluginProcess;
use super::process::SpawnSettings;
use super::runner::PluginRunner;
use super::runner::RunnerKey;
use crate::client::multiplexing_support;
use crate::config::PluginSubsystemConfig;
use crate::constants::CONNECTION_ID_LENGTH;
use crate::error::PluginError;
use crate::handshake::ProtocolVersion;
use crate::handshake::ReattachConfig;
use crate::rpc::RpcConnection;

/// Runners are looked up by type, name and version.
type CatalogKey = (PluginType, String, String);

/// Live processes for one runner key.
#[derive(Debug, Default)]
struct ExternalPlugin {
    multiplexed: bool,
    /// Connection id to the process serving it. All values are the same
    /// process when multiplexed.
    connections: HashMap<String, Arc<PluginProcess>>,
}

type ProcessMap = Arc<Mutex<HashMap<RunnerKey, ExternalPlugin>>>;

pub struct PluginCatalog {
    config: PluginSubsystemConfig,
    runners: RwLock<BTreeMap<CatalogKey, PluginRunner>>,
    processes: ProcessMap,
    /// Fires when the host shuts the subsystem down.
    done: CancellationToken,
    client_tls: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("runners", &self.runners.read().len())
            .finish_non_exhaustive()
    }
}

impl PluginCatalog {
    pub fn new(config: PluginSubsystemConfig) -> Self {
        Self {
            config,
            runners: RwLock::new(BTreeMap::new()),
            processes: Arc::new(Mutex::new(HashMap::new())),
            done: CancellationToken::new(),
            client_tls: None,
        }
    }

    /// Dial v3 and v4 plugins over TLS with `config`. v5 plugins keep
    /// using automatic mTLS.
    pub fn with_client_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.client_tls = Some(config);
        self
    }

    pub fn config(&self) -> &PluginSubsystemConfig {
        &self.config
    }

    /// Token handed to every backend client; cancelled by [`Self::shutdown`].
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    // ========================================================================
    // Runner registry
    // ========================================================================

    /// Register `runner`, replacing an entry with the same name, type and version.
    pub fn set(&self, runner: PluginRunner) -> Option<PluginRunner> {
        let key = (runner.plugin_type, runner.name.clone(), runner.version.clone());
        self.runners.write().insert(key, runner)
    }

    pub fn get(&self, name: &str, plugin_type: PluginType, version: &str) -> Result<PluginRunner, PluginError> {
        self.runners
            .read()
            .get(&(plugin_type, name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| PluginError::PluginNotFound {
                name: name.to_string(),
                plugin_type,
                version: version.to_string(),
            })
    }

    pub fn delete(&self, name: &str, plugin_type: PluginType, version: &str) -> bool {
        self.runners.write().remove(&(plugin_type, name.to_string(), version.to_string())).is_some()
    }

    /// Sorted, de-duplicated names of every runner of `plugin_type`.
    pub fn list(&self, plugin_type: PluginType) -> Vec<String> {
        let mut names: Vec<String> = self
            .runners
            .read()
            .keys()
            .filter(|(t, _, _)| *t == plugin_type)
            .map(|(_, name, _)| name.clone())
            .collect();
        names.dedup();
        names
    }

    /// Every runner of `plugin_type`, ordered by name then version.
    pub fn list_versioned(&self, plugin_type: PluginType) -> Vec<PluginRunner> {
        self.runners.read().iter().filter(|((t, _, _), _)| *t == plugin_type).map(|(_, r)| r.clone()).collect()
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Connect a new client to a plugin process for `runner`, reusing a
    /// live multiplexed process when there is one.
    pub async fn new_plugin_client(&self, runner: &PluginRunner, metadata_mode: bool) -> Result<PluginClient, PluginError> {
        let key = runner.key(metadata_mode);
        let mut processes = self.processes.lock().await;
        // `shutdown` cancels before draining under this lock, so nothing
        // started past this check outlives it.
        if self.done.is_cancelled() {
            return Err(PluginError::CatalogShutdown);
        }

        let mut reusable = None;
        let mut stale = Vec::new();
        if let Some(ext) = processes.get(&key) {
            if ext.multiplexed {
                for process in ext.connections.values() {
                    if process.exited().await {
                        stale.push(Arc::clone(process));
                    } else if reusable.is_none() {
                        reusable = Some(Arc::clone(process));
                    }
                }
            }
        }
        if reusable.is_none() && !stale.is_empty() {
            debug!(plugin = %runner.name, "multiplexed plugin process exited, replacing it");
            processes.remove(&key);
        }

        let (process, multiplexed) = match reusable {
            Some(process) => (process, true),
            None => {
                let process = Arc::new(self.start(runner, metadata_mode).await?);
                let multiplexed =
                    process.protocol_version().multiplexing && multiplexing_support(process.connection()).await;
                (process, multiplexed)
            }
        };

        let id = connection_id();
        let ext = processes.entry(key.clone()).or_default();
        ext.multiplexed = multiplexed;
        ext.connections.insert(id.clone(), Arc::clone(&process));
        drop(processes);

        for process in stale {
            process.kill().await;
        }

        info!(
            plugin = %runner.name,
            id = %id,
            multiplexed,
            version = process.protocol_version().version,
            "plugin client connected"
        );
        Ok(PluginClient {
            id,
            key,
            process,
            multiplexed,
            metadata_mode,
            processes: Arc::clone(&self.processes),
        })
    }

    async fn start(&self, runner: &PluginRunner, metadata_mode: bool) -> Result<PluginProcess, PluginError> {
        let mut settings = SpawnSettings::new(&self.config, metadata_mode);
        settings.client_tls = self.client_tls.clone();
        match ReattachConfig::from_env(&runner.name)? {
            Some(reattach) => PluginProcess::attach(&runner.name, &reattach, &settings).await,
            None => PluginProcess::spawn(runner, &settings).await,
        }
    }

    /// Number of runner keys with live plugin processes.
    pub async fn processes(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// Stop every plugin process and fail outstanding calls.
    pub async fn shutdown(&self) {
        self.done.cancel();
        let drained: Vec<ExternalPlugin> = self.processes.lock().await.drain().map(|(_, ext)| ext).collect();
        let mut killed: Vec<Arc<PluginProcess>> = Vec::new();
        for process in drained.into_iter().flat_map(|ext| ext.connections.into_values()) {
            if killed.iter().any(|k| Arc::ptr_eq(k, &process)) {
                continue;
            }
            process.kill().await;
            killed.push(process);
        }
    }
}

fn connection_id() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(CONNECTION_ID_LENGTH).map(char::from).collect()
}

// ============================================================================
// Plugin client
// ============================================================================

/// One logical connection to a plugin process.
pub struct PluginClient {
    id: String,
    key: RunnerKey,
    process: Arc<PluginProcess>,
    multiplexed: bool,
    metadata_mode: bool,
    processes: ProcessMap,
}

impl fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClient")
            .field("id", &self.id)
            .field("plugin", &self.key.name)
            .field("multiplexed", &self.multiplexed)
            .finish_non_exhaustive()
    }
}

impl PluginClient {
    /// Random connection id, also used as the multiplex id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn connection(&self) -> &RpcConnection {
        self.process.connection()
    }

    pub fn protocol_version(&self) -> &'static ProtocolVersion {
        self.process.protocol_version()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    pub fn metadata_mode(&self) -> bool {
        self.metadata_mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Drop this connection. The process is killed unless other live
    /// multiplexed connections still use it.
    pub async fn close(&self) {
        let mut processes = self.processes.lock().await;
        let ours = processes.get(&self.key).is_some_and(|ext| ext.connections.contains_key(&self.id));
        let kill = match processes.get_mut(&self.key) {
            Some(ext) if ours => {
                ext.connections.remove(&self.id);
                let shared = ext.connections.values().any(|p| Arc::ptr_eq(p, &self.process));
                let kill = !shared || self.process.exited().await;
                if kill {
                    ext.connections.retain(|_, p| !Arc::ptr_eq(p, &self.process));
                }
                if ext.connections.is_empty() {
                    processes.remove(&self.key);
                }
                kill
            }
            // Already forgotten by a reload or shutdown.
            _ => true,
        };
        drop(processes);

        if kill {
            debug!(plugin = %self.key.name, id = %self.id, "stopping plugin process");
            self.process.kill().await;
        }
    }

    /// Restart the plugin on next use. A shared multiplexed process is
    /// killed and forgotten so the next client spawns a fresh one.
    pub async fn reload(&self) {
        if !self.multiplexed {
            self.close().await;
            return;
        }
        let mut processes = self.processes.lock().await;
        let ours = processes
            .get(&self.key)
            .is_some_and(|ext| ext.connections.values().any(|p| Arc::ptr_eq(p, &self.process)));
        if ours {
            processes.remove(&self.key);
        }
        drop(processes);

        info!(plugin = %self.key.name, id = %self.id, "reloading multiplexed plugin");
        self.process.kill().await;
    }
}
