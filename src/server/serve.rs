//! Plugin process entry point.
//!
//! [`serve`] checks the magic cookie, negotiates a protocol version with the
//! host, starts listening, announces itself on stdout and serves the host
//! connection until the host closes it or asks the plugin to shut down.

use std::path::PathBuf;
use std::sync::Arc;

use lockbox_logical::BackendFactory;
use rustls::ServerConfig;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::BackendServer;
use crate::constants::ACCEPT_TIMEOUT;
use crate::constants::ENV_CLIENT_CERT;
use crate::constants::ENV_METADATA_MODE;
use crate::constants::ENV_MULTIPLEXING_DISABLED;
use crate::constants::ENV_PROTOCOL_VERSIONS;
use crate::constants::ENV_UNIX_SOCKET_DIR;
use crate::constants::ENV_VAULT_VERSION;
use crate::constants::MAGIC_COOKIE_KEY;
use crate::constants::MAGIC_COOKIE_VALUE;
use crate::error::IoSnafu;
use crate::error::ListenSnafu;
use crate::error::PluginError;
use crate::handshake::BoxedIo;
use crate::handshake::Endpoint;
use crate::handshake::HandshakeLine;
use crate::handshake::Network;
use crate::handshake::ProtocolVersion;
use crate::handshake::ReattachConfig;
use crate::handshake::negotiate;
use crate::handshake::parse_version_list;
use crate::handshake::supported_versions;
use crate::rpc::MAIN_CHANNEL;
use crate::rpc::Role;
use crate::rpc::RpcConnection;
use crate::tls;
use crate::tls::CertifiedKey;

/// What a plugin binary passes to [`serve`].
pub struct ServeConfig {
    /// Name used in logs and in the reattach configuration.
    pub name: String,
    pub factory: Arc<dyn BackendFactory>,
    /// Protocol versions the plugin speaks.
    pub versions: Vec<u32>,
    /// Whether the plugin can host several backend instances.
    pub multiplexing: bool,
    /// Publish a reattach configuration instead of waiting to be spawned.
    pub debug: bool,
    /// TLS served below v5, where no certificate is exchanged in the handshake.
    pub tls: Option<Arc<ServerConfig>>,
}

impl ServeConfig {
    pub fn new(name: impl Into<String>, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            versions: supported_versions(),
            multiplexing: true,
            debug: false,
            tls: None,
        }
    }
}

/// The environment a host sets on the plugin process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnv {
    pub magic_cookie: Option<String>,
    /// Versions the host accepts. Empty when the host did not say.
    pub host_versions: Vec<u32>,
    /// Base64 DER of the host's client certificate.
    pub client_cert: Option<String>,
    pub metadata_mode: bool,
    pub host_version: Option<String>,
    pub unix_socket_dir: Option<PathBuf>,
    pub multiplexing_disabled: bool,
}

impl PluginEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| non_empty(key).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        Self {
            magic_cookie: lookup(MAGIC_COOKIE_KEY),
            host_versions: non_empty(ENV_PROTOCOL_VERSIONS).map(|v| parse_version_list(&v)).unwrap_or_default(),
            client_cert: non_empty(ENV_CLIENT_CERT),
            metadata_mode: flag(ENV_METADATA_MODE),
            host_version: non_empty(ENV_VAULT_VERSION),
            unix_socket_dir: non_empty(ENV_UNIX_SOCKET_DIR).map(PathBuf::from),
            multiplexing_disabled: flag(ENV_MULTIPLEXING_DISABLED),
        }
    }
}

/// Settings for one host connection, fixed at handshake time.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub multiplexing: bool,
    pub metadata_mode: bool,
}

/// Outcome of checking the environment against what the plugin supports.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub version: &'static ProtocolVersion,
    pub settings: ConnectionSettings,
}

/// Validate the cookie and pick the protocol version.
pub fn negotiate_env(config: &ServeConfig, env: &PluginEnv) -> Result<Negotiated, PluginError> {
    if !config.debug && env.magic_cookie.as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(PluginError::MagicCookieMismatch);
    }
    let host_versions = if env.host_versions.is_empty() {
        &config.versions
    } else {
        &env.host_versions
    };
    let version = negotiate(host_versions, &config.versions)?;
    Ok(Negotiated {
        version,
        settings: ConnectionSettings {
            multiplexing: config.multiplexing && version.multiplexing && !env.multiplexing_disabled,
            metadata_mode: env.metadata_mode,
        },
    })
}

// ============================================================================
// Listening
// ============================================================================

enum Listener {
    #[cfg_attr(unix, allow(dead_code))]
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
        // Removed on drop when we created it.
        _dir: Option<tempfile::TempDir>,
    },
}

impl Listener {
    #[cfg(unix)]
    async fn bind(env: &PluginEnv) -> Result<(Self, Endpoint), PluginError> {
        let (dir, owned) = match &env.unix_socket_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let tmp = tempfile::Builder::new().prefix("lockbox-plugin").tempdir().context(IoSnafu)?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        let path = dir.join(format!("plugin-{}.sock", uuid::Uuid::new_v4().simple()));
        let addr = path.display().to_string();
        let listener = tokio::net::UnixListener::bind(&path).context(ListenSnafu { addr: addr.clone() })?;
        let endpoint = Endpoint {
            network: Network::Unix,
            addr,
        };
        Ok((
            Self::Unix {
                listener,
                path,
                _dir: owned,
            },
            endpoint,
        ))
    }

    #[cfg(not(unix))]
    async fn bind(_env: &PluginEnv) -> Result<(Self, Endpoint), PluginError> {
        Self::bind_tcp().await
    }

    #[cfg_attr(unix, allow(dead_code))]
    async fn bind_tcp() -> Result<(Self, Endpoint), PluginError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context(ListenSnafu { addr: "127.0.0.1:0" })?;
        let addr = listener.local_addr().context(IoSnafu)?.to_string();
        Ok((Self::Tcp(listener), Endpoint {
            network: Network::Tcp,
            addr,
        }))
    }

    async fn accept(&self) -> Result<BoxedIo, PluginError> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.context(IoSnafu)?;
                let _ = stream.set_nodelay(true);
                debug!(peer = %peer, "accepted host connection");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await.context(IoSnafu)?;
                debug!("accepted host connection");
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Run a plugin until the host is done with it.
pub async fn serve(config: ServeConfig) -> Result<(), PluginError> {
    serve_with_env(config, PluginEnv::from_env()).await
}

pub async fn serve_with_env(config: ServeConfig, env: PluginEnv) -> Result<(), PluginError> {
    let negotiated = negotiate_env(&config, &env)?;
    let version = negotiated.version;

    let (listener, endpoint) = Listener::bind(&env).await?;

    let (tls_config, server_cert) = connection_tls(&config, &env, version)?;

    info!(
        plugin = %config.name,
        version = version.version,
        endpoint = %endpoint,
        multiplexing = negotiated.settings.multiplexing,
        metadata_mode = negotiated.settings.metadata_mode,
        tls = tls_config.is_some(),
        host_version = env.host_version.as_deref().unwrap_or(""),
        "plugin listening"
    );

    let mut stdout = tokio::io::stdout();
    if config.debug {
        let reattach = ReattachConfig::new(version.version, &endpoint);
        let map = std::collections::HashMap::from([(config.name.clone(), reattach)]);
        let json = serde_json::to_string(&map).map_err(|e| PluginError::Io {
            source: std::io::Error::other(e),
        })?;
        stdout.write_all(format!("{json}\n").as_bytes()).await.context(IoSnafu)?;
        stdout.flush().await.context(IoSnafu)?;
        return serve_debug(&config, listener, tls_config, negotiated.settings).await;
    }

    let line = HandshakeLine::new(version.version, endpoint, server_cert);
    stdout.write_all(format!("{line}\n").as_bytes()).await.context(IoSnafu)?;
    stdout.flush().await.context(IoSnafu)?;

    let io = match tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(io) => io?,
        Err(_) => {
            warn!(timeout = ?ACCEPT_TIMEOUT, "host never connected");
            return Ok(());
        }
    };
    let io = secure(io, tls_config).await?;
    run_connection(io, Arc::clone(&config.factory), negotiated.settings, CancellationToken::new()).await;
    Ok(())
}

/// TLS for the host connection, plus the certificate to announce when it
/// was generated for automatic mTLS.
fn connection_tls(
    config: &ServeConfig,
    env: &PluginEnv,
    version: &ProtocolVersion,
) -> Result<(Option<Arc<ServerConfig>>, Option<String>), PluginError> {
    if !version.auto_mtls {
        return Ok((config.tls.clone(), None));
    }
    let Some(client_cert) = &env.client_cert else {
        return Ok((None, None));
    };
    let client_der = tls::decode_cert(client_cert)?;
    let key = CertifiedKey::generate()?;
    Ok((Some(tls::server_config(&key, client_der)?), Some(key.encoded_cert())))
}

/// Accept connections until interrupted. Used when a developer runs the
/// plugin by hand and points the host at it.
async fn serve_debug(
    config: &ServeConfig,
    listener: Listener,
    tls_config: Option<Arc<ServerConfig>>,
    settings: ConnectionSettings,
) -> Result<(), PluginError> {
    let stop = CancellationToken::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping debug plugin");
                stop.cancel();
                return Ok(());
            }
            accepted = listener.accept() => {
                let io = match accepted {
                    Ok(io) => io,
                    Err(e) => {
                        warn!(error = %e, "failed to accept host connection");
                        continue;
                    }
                };
                let tls_config = tls_config.clone();
                let factory = Arc::clone(&config.factory);
                let stop = stop.clone();
                tokio::spawn(async move {
                    match secure(io, tls_config).await {
                        Ok(io) => run_connection(io, factory, settings, stop).await,
                        Err(e) => warn!(error = %e, "host connection failed TLS handshake"),
                    }
                });
            }
        }
    }
}

async fn secure(io: BoxedIo, tls_config: Option<Arc<ServerConfig>>) -> Result<BoxedIo, PluginError> {
    match tls_config {
        Some(config) => Ok(Box::new(tls::accept(config, io).await?)),
        None => Ok(io),
    }
}

/// Serve one host connection until it closes, the host sends
/// `Control/Shutdown`, `stop` fires, or the process is interrupted.
///
/// Every remaining backend instance is cleaned up before returning.
pub async fn run_connection(
    io: BoxedIo,
    factory: Arc<dyn BackendFactory>,
    settings: ConnectionSettings,
    stop: CancellationToken,
) {
    let (conn, tasks) = RpcConnection::unstarted(io, Role::Plugin);
    let server = Arc::new(BackendServer::new(factory, conn.clone(), settings.multiplexing, settings.metadata_mode));
    conn.serve(MAIN_CHANNEL, server.router());
    tasks.start();
    let shutdown = server.shutdown_token();

    tokio::select! {
        _ = conn.closed() => debug!("host closed the connection"),
        _ = shutdown.cancelled() => info!("shutting down at host request"),
        _ = stop.cancelled() => debug!("stop requested"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    server.cleanup_all().await;
    conn.close().await;
}
