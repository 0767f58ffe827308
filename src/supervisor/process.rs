//! Spawning, dialing and stopping one plugin process.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use snafu::ResultExt;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::runner::PluginRunner;
use crate::client::request_shutdown;
use crate::config::PluginSubsystemConfig;
use crate::constants::ENV_CLIENT_CERT;
use crate::constants::ENV_METADATA_MODE;
use crate::constants::ENV_MLOCK_ENABLED;
use crate::constants::ENV_PROTOCOL_VERSIONS;
use crate::constants::ENV_VAULT_VERSION;
use crate::constants::MAGIC_COOKIE_KEY;
use crate::constants::MAGIC_COOKIE_VALUE;
use crate::constants::SHUTDOWN_GRACE_PERIOD;
use crate::error::PluginError;
use crate::error::SpawnSnafu;
use crate::handshake::BoxedIo;
use crate::handshake::Endpoint;
use crate::handshake::HandshakeLine;
use crate::handshake::ProtocolVersion;
use crate::handshake::ReattachConfig;
use crate::handshake::format_version_list;
use crate::handshake::lookup_version;
use crate::logging::forward_plugin_output;
use crate::rpc::Role;
use crate::rpc::RpcConnection;
use crate::tls;
use crate::tls::CertifiedKey;

/// Everything needed to launch a plugin besides the runner itself.
#[derive(Debug, Clone)]
pub struct SpawnSettings {
    pub plugin_directory: Option<PathBuf>,
    pub start_timeout: Duration,
    pub auto_mtls: bool,
    pub mlock: bool,
    pub protocol_versions: Vec<u32>,
    pub metadata_mode: bool,
    pub host_version: String,
    /// TLS the host dials with below v5. The plugin must present a
    /// certificate valid for `localhost`.
    pub client_tls: Option<Arc<ClientConfig>>,
}

impl SpawnSettings {
    pub fn new(config: &PluginSubsystemConfig, metadata_mode: bool) -> Self {
        Self {
            plugin_directory: config.plugin_directory.clone(),
            start_timeout: config.start_timeout(),
            auto_mtls: config.auto_mtls,
            mlock: config.mlock,
            protocol_versions: config.protocol_versions.clone(),
            metadata_mode,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            client_tls: None,
        }
    }
}

/// A connected plugin process, spawned by us or attached for debugging.
pub struct PluginProcess {
    name: String,
    conn: RpcConnection,
    version: &'static ProtocolVersion,
    pid: Option<u32>,
    /// `None` for reattached processes, which we do not own.
    child: Mutex<Option<Child>>,
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("name", &self.name)
            .field("version", &self.version.version)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PluginProcess {
    /// Launch `runner`, wait for its handshake and connect.
    pub async fn spawn(runner: &PluginRunner, settings: &SpawnSettings) -> Result<Self, PluginError> {
        let path = runner.resolve_command(settings.plugin_directory.as_deref())?;
        runner.verify_checksum(&path).await?;

        let client_key = if settings.auto_mtls && settings.protocol_versions.iter().any(|v| lookup_version(*v).is_some_and(|p| p.auto_mtls)) {
            Some(CertifiedKey::generate()?)
        } else {
            None
        };

        let mut cmd = Command::new(&path);
        cmd.args(&runner.args)
            .envs(runner.env_pairs())
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(ENV_PROTOCOL_VERSIONS, format_version_list(&settings.protocol_versions))
            .env(ENV_METADATA_MODE, settings.metadata_mode.to_string())
            .env(ENV_MLOCK_ENABLED, settings.mlock.to_string())
            .env(ENV_VAULT_VERSION, &settings.host_version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &client_key {
            cmd.env(ENV_CLIENT_CERT, key.encoded_cert());
        }

        let mut child = cmd.spawn().context(SpawnSnafu {
            name: runner.name.clone(),
        })?;
        let pid = child.id();
        debug!(plugin = %runner.name, path = %path.display(), ?pid, "plugin process started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_plugin_output(runner.name.clone(), stderr));
        }
        let Some(stdout) = child.stdout.take() else {
            return Err(PluginError::ExitedBeforeHandshake {
                name: runner.name.clone(),
            });
        };

        let mut lines = BufReader::new(stdout).lines();
        let line = match tokio::time::timeout(settings.start_timeout, lines.next_line()).await {
            Err(_) => {
                let _ = child.kill().await;
                return Err(PluginError::HandshakeTimeout {
                    name: runner.name.clone(),
                    timeout: settings.start_timeout,
                });
            }
            Ok(Ok(Some(line))) => line,
            Ok(_) => {
                return Err(PluginError::ExitedBeforeHandshake {
                    name: runner.name.clone(),
                });
            }
        };
        // Anything else the plugin prints on stdout is logged, not parsed.
        let name = runner.name.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(plugin = %name, "stdout: {line}");
            }
        });

        let handshake = HandshakeLine::parse(&line)?;
        let version = accept_version(&settings.protocol_versions, handshake.app_version)?;
        let io = match handshake.server_cert.as_deref() {
            Some(server_cert) => {
                let Some(key) = &client_key else {
                    return Err(PluginError::TlsConfig {
                        reason: "plugin announced a certificate but no client certificate was offered".to_string(),
                    });
                };
                dial_tls(&handshake.endpoint, key, server_cert).await?
            }
            None => secure_dialed(handshake.endpoint.dial().await?, version, settings.client_tls.as_ref()).await?,
        };

        info!(
            plugin = %runner.name,
            version = version.version,
            endpoint = %handshake.endpoint,
            tls = handshake.server_cert.is_some() || (!version.auto_mtls && settings.client_tls.is_some()),
            "connected to plugin"
        );
        Ok(Self {
            name: runner.name.clone(),
            conn: RpcConnection::new(io, Role::Host),
            version,
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    /// Connect to a plugin that is already running under a debugger.
    pub async fn attach(name: &str, reattach: &ReattachConfig, settings: &SpawnSettings) -> Result<Self, PluginError> {
        let version = accept_version(&settings.protocol_versions, reattach.protocol_version)?;
        let endpoint = reattach.endpoint()?;
        let io = secure_dialed(endpoint.dial().await?, version, settings.client_tls.as_ref()).await?;
        info!(plugin = name, pid = reattach.pid, %endpoint, "reattached to plugin");
        Ok(Self {
            name: name.to_string(),
            conn: RpcConnection::new(io, Role::Host),
            version,
            pid: Some(reattach.pid),
            child: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.conn
    }

    pub fn protocol_version(&self) -> &'static ProtocolVersion {
        self.version
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process (or our connection to it) is gone.
    pub async fn exited(&self) -> bool {
        if self.conn.is_closed() {
            return true;
        }
        match self.child.lock().await.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the plugin to exit, then kill it if it is still running after
    /// the grace period. Reattached processes are only disconnected.
    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            self.conn.close().await;
            return;
        };

        if !self.conn.is_closed() {
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, request_shutdown(&self.conn)).await {
                Ok(Ok(())) => {}
                Ok(Err(status)) if status.is_unavailable() => {}
                Ok(Err(status)) => debug!(plugin = %self.name, error = %status, "graceful shutdown refused"),
                Err(_) => debug!(plugin = %self.name, "graceful shutdown timed out"),
            }
        }

        let waited = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, child.wait()).await;
        match waited {
            Ok(Ok(status)) => debug!(plugin = %self.name, %status, "plugin exited"),
            Ok(Err(e)) => warn!(plugin = %self.name, error = %e, "failed to wait for plugin"),
            Err(_) => {
                warn!(plugin = %self.name, pid = ?self.pid, "plugin did not exit, killing");
                if let Err(e) = child.kill().await {
                    warn!(plugin = %self.name, error = %e, "failed to kill plugin");
                }
            }
        }
        self.conn.close().await;
    }
}

fn accept_version(host_versions: &[u32], announced: u32) -> Result<&'static ProtocolVersion, PluginError> {
    match lookup_version(announced) {
        Some(version) if host_versions.contains(&announced) => Ok(version),
        _ => Err(PluginError::NoCommonVersion {
            host: host_versions.to_vec(),
            plugin: vec![announced],
        }),
    }
}

async fn dial_tls(endpoint: &Endpoint, key: &CertifiedKey, server_cert: &str) -> Result<BoxedIo, PluginError> {
    let server_der = tls::decode_cert(server_cert)?;
    let config = tls::client_config(key, server_der)?;
    let io = endpoint.dial().await?;
    let stream = tls::connect(config, io).await?;
    Ok(Box::new(stream))
}

/// Run the caller's TLS over a dialed stream. Versions with automatic
/// mTLS negotiate their own and ignore it.
pub(crate) async fn secure_dialed(
    io: BoxedIo,
    version: &ProtocolVersion,
    client_tls: Option<&Arc<ClientConfig>>,
) -> Result<BoxedIo, PluginError> {
    match client_tls {
        Some(config) if !version.auto_mtls => Ok(Box::new(tls::connect(Arc::clone(config), io).await?)),
        _ => Ok(io),
    }
}
