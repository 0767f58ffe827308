//! Handshake, protocol version negotiation and reattach configuration.
//!
//! A plugin announces itself by printing one line to stdout:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL|SERVER-CERT
//! ```
//!
//! The host dials the address, wrapping the stream in TLS when a server
//! certificate was announced. Debug builds of a plugin can instead publish
//! a reattach configuration that the host picks up from
//! `VAULT_REATTACH_PLUGINS`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::constants::CORE_PROTOCOL_VERSION;
use crate::constants::ENV_REATTACH_PLUGINS;
use crate::constants::WIRE_PROTOCOL;
use crate::error::ConnectSnafu;
use crate::error::PluginError;
use crate::error::ReattachConfigSnafu;

// ============================================================================
// Protocol versions
// ============================================================================

/// What a negotiated application protocol version provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub version: u32,
    /// The plugin may serve several backend instances in one process.
    pub multiplexing: bool,
    /// Host and plugin establish mutual TLS with ephemeral certificates.
    pub auto_mtls: bool,
}

/// Versions 3 and 4 are equivalent; 5 adds multiplexing and auto-mTLS.
pub const VERSION_TABLE: &[ProtocolVersion] = &[
    ProtocolVersion {
        version: 3,
        multiplexing: false,
        auto_mtls: false,
    },
    ProtocolVersion {
        version: 4,
        multiplexing: false,
        auto_mtls: false,
    },
    ProtocolVersion {
        version: 5,
        multiplexing: true,
        auto_mtls: true,
    },
];

pub fn supported_versions() -> Vec<u32> {
    VERSION_TABLE.iter().map(|v| v.version).collect()
}

pub fn lookup_version(version: u32) -> Option<&'static ProtocolVersion> {
    VERSION_TABLE.iter().find(|v| v.version == version)
}

/// Pick the highest version present in both lists.
pub fn negotiate(host: &[u32], plugin: &[u32]) -> Result<&'static ProtocolVersion, PluginError> {
    VERSION_TABLE
        .iter()
        .rev()
        .find(|v| host.contains(&v.version) && plugin.contains(&v.version))
        .ok_or_else(|| PluginError::NoCommonVersion {
            host: host.to_vec(),
            plugin: plugin.to_vec(),
        })
}

/// Parse a comma separated version list, skipping entries that are not numbers.
pub fn parse_version_list(s: &str) -> Vec<u32> {
    s.split(',').filter_map(|v| v.trim().parse().ok()).collect()
}

pub fn format_version_list(versions: &[u32]) -> String {
    versions.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

// ============================================================================
// Network endpoints
// ============================================================================

/// Transport a plugin listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(PluginError::UnsupportedNetwork {
                network: other.to_string(),
            }),
        }
    }
}

/// A byte stream the RPC layer can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Where a plugin can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub network: Network,
    pub addr: String,
}

impl Endpoint {
    pub async fn dial(&self) -> Result<BoxedIo, PluginError> {
        match self.network {
            Network::Tcp => {
                let stream = tokio::net::TcpStream::connect(&self.addr).await.context(ConnectSnafu {
                    addr: self.addr.clone(),
                })?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(&self.addr).await.context(ConnectSnafu {
                    addr: self.addr.clone(),
                })?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(PluginError::UnsupportedNetwork {
                network: "unix".to_string(),
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

// ============================================================================
// Handshake line
// ============================================================================

/// The line a plugin prints once it is ready for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub endpoint: Endpoint,
    pub protocol: String,
    /// Base64 DER of the plugin's server certificate under auto-mTLS.
    pub server_cert: Option<String>,
}

impl HandshakeLine {
    pub fn new(app_version: u32, endpoint: Endpoint, server_cert: Option<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            endpoint,
            protocol: WIRE_PROTOCOL.to_string(),
            server_cert,
        }
    }

    pub fn parse(line: &str) -> Result<Self, PluginError> {
        let line = line.trim();
        let malformed = |reason: &str| PluginError::MalformedHandshake {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            return Err(malformed("expected at least 4 fields"));
        }
        let core_version: u32 = parts[0].parse().map_err(|_| malformed("core version is not a number"))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(PluginError::IncompatibleCoreProtocol { version: core_version });
        }
        let app_version: u32 = parts[1].parse().map_err(|_| malformed("app version is not a number"))?;
        let network: Network = parts[2].parse()?;
        if parts[3].is_empty() {
            return Err(malformed("empty address"));
        }
        let protocol = parts.get(4).copied().unwrap_or(WIRE_PROTOCOL);
        if protocol != WIRE_PROTOCOL {
            return Err(malformed("unsupported protocol"));
        }
        let server_cert = parts.get(5).filter(|c| !c.is_empty()).map(|c| c.to_string());

        Ok(Self {
            core_version,
            app_version,
            endpoint: Endpoint {
                network,
                addr: parts[3].to_string(),
            },
            protocol: protocol.to_string(),
            server_cert,
        })
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}",
            self.core_version,
            self.app_version,
            self.endpoint.network,
            self.endpoint.addr,
            self.protocol,
            self.server_cert.as_deref().unwrap_or("")
        )
    }
}

// ============================================================================
// Reattach
// ============================================================================

/// Address part of a reattach configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReattachAddr {
    pub network: String,
    pub string: String,
}

/// Everything the host needs to talk to a plugin it did not spawn.
///
/// Field names are fixed; operator tooling produces and consumes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReattachConfig {
    pub protocol: String,
    pub protocol_version: u32,
    pub pid: u32,
    pub test: bool,
    pub addr: ReattachAddr,
}

impl ReattachConfig {
    pub fn new(protocol_version: u32, endpoint: &Endpoint) -> Self {
        Self {
            protocol: WIRE_PROTOCOL.to_string(),
            protocol_version,
            pid: std::process::id(),
            test: false,
            addr: ReattachAddr {
                network: endpoint.network.to_string(),
                string: endpoint.addr.clone(),
            },
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, PluginError> {
        Ok(Endpoint {
            network: self.addr.network.parse()?,
            addr: self.addr.string.clone(),
        })
    }

    /// Parse the value of `VAULT_REATTACH_PLUGINS`.
    pub fn parse_map(json: &str) -> Result<HashMap<String, ReattachConfig>, PluginError> {
        serde_json::from_str(json).context(ReattachConfigSnafu)
    }

    /// Reattach configuration for `plugin_name`, if the environment has one.
    pub fn from_env(plugin_name: &str) -> Result<Option<ReattachConfig>, PluginError> {
        match std::env::var(ENV_REATTACH_PLUGINS) {
            Ok(json) if !json.trim().is_empty() => Ok(Self::parse_map(&json)?.remove(plugin_name)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate(&[3, 4, 5], &[3, 4, 5]).unwrap().version, 5);
        assert_eq!(negotiate(&[3, 4], &[3, 4, 5]).unwrap().version, 4);
        assert_eq!(negotiate(&[5], &[4, 5]).unwrap().version, 5);
        assert!(negotiate(&[5], &[3, 4]).is_err());
        assert!(negotiate(&[6], &[6]).is_err());
    }

    #[test]
    fn test_only_v5_multiplexes() {
        assert!(!lookup_version(3).unwrap().multiplexing);
        assert!(!lookup_version(4).unwrap().auto_mtls);
        let v5 = lookup_version(5).unwrap();
        assert!(v5.multiplexing && v5.auto_mtls);
        assert!(lookup_version(2).is_none());
    }

    #[test]
    fn test_version_list() {
        assert_eq!(parse_version_list("3, 4,5,x,"), vec![3, 4, 5]);
        assert_eq!(format_version_list(&[3, 4, 5]), "3,4,5");
    }

    #[test]
    fn test_handshake_line_roundtrip() {
        let line = HandshakeLine::new(
            5,
            Endpoint {
                network: Network::Unix,
                addr: "/tmp/plugin.sock".into(),
            },
            Some("Q0VSVA".into()),
        );
        let text = line.to_string();
        assert_eq!(text, "1|5|unix|/tmp/plugin.sock|lbrpc|Q0VSVA");
        assert_eq!(HandshakeLine::parse(&format!("{text}\n")).unwrap(), line);
    }

    #[test]
    fn test_handshake_line_without_cert() {
        let line = HandshakeLine::parse("1|4|tcp|127.0.0.1:1234|lbrpc|").unwrap();
        assert_eq!(line.app_version, 4);
        assert_eq!(line.endpoint.network, Network::Tcp);
        assert!(line.server_cert.is_none());

        let short = HandshakeLine::parse("1|4|tcp|127.0.0.1:1234").unwrap();
        assert_eq!(short.protocol, WIRE_PROTOCOL);
    }

    #[test]
    fn test_handshake_line_rejects_garbage() {
        assert!(matches!(
            HandshakeLine::parse("2|5|tcp|127.0.0.1:1|lbrpc|"),
            Err(PluginError::IncompatibleCoreProtocol { version: 2 })
        ));
        assert!(HandshakeLine::parse("hello world").is_err());
        assert!(HandshakeLine::parse("1|5|udp|x|lbrpc|").is_err());
        assert!(HandshakeLine::parse("1|5|tcp|127.0.0.1:1|grpc|").is_err());
        assert!(HandshakeLine::parse("1|five|tcp|127.0.0.1:1").is_err());
    }

    #[test]
    fn test_reattach_json_field_names() {
        let cfg = ReattachConfig {
            protocol: WIRE_PROTOCOL.into(),
            protocol_version: 5,
            pid: 42,
            test: true,
            addr: ReattachAddr {
                network: "unix".into(),
                string: "/tmp/p.sock".into(),
            },
        };
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(value["Protocol"], "lbrpc");
        assert_eq!(value["ProtocolVersion"], 5);
        assert_eq!(value["Pid"], 42);
        assert_eq!(value["Test"], true);
        assert_eq!(value["Addr"]["Network"], "unix");
        assert_eq!(value["Addr"]["String"], "/tmp/p.sock");

        let map = ReattachConfig::parse_map(&format!("{{\"mock\": {value}}}")).unwrap();
        assert_eq!(map["mock"], cfg);
        assert_eq!(map["mock"].endpoint().unwrap().network, Network::Unix);
    }

    #[test]
    fn test_reattach_rejects_bad_json() {
        assert!(ReattachConfig::parse_map("{not json").is_err());
    }
}
