//! Automatic mutual TLS between host and plugin.
//!
//! Each side generates an ephemeral self-signed certificate. The host hands
//! its certificate to the plugin through the environment and the plugin
//! announces its own in the handshake line. Both sides then accept exactly
//! the peer certificate they were given and nothing else.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rustls::ClientConfig;
use rustls::DigitallySignedStruct;
use rustls::DistinguishedName;
use rustls::ServerConfig;
use rustls::SignatureScheme;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use rustls::server::danger::ClientCertVerified;
use rustls::server::danger::ClientCertVerifier;
use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::TlsConnector;

use crate::error::PluginError;
use crate::error::TlsHandshakeSnafu;

/// Name placed in generated certificates and used for SNI.
pub const PLUGIN_SERVER_NAME: &str = "localhost";

/// An ephemeral certificate and its private key, both DER encoded.
#[derive(Clone)]
pub struct CertifiedKey {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey").field("cert_len", &self.cert_der.len()).finish_non_exhaustive()
    }
}

impl CertifiedKey {
    /// Generate a fresh self-signed certificate for loopback use.
    pub fn generate() -> Result<Self, PluginError> {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![PLUGIN_SERVER_NAME.to_string()])
            .map_err(|e| PluginError::TlsConfig {
                reason: format!("failed to generate certificate: {e}"),
            })?;
        Ok(Self {
            cert_der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// Certificate in the form carried by the environment and handshake line.
    pub fn encoded_cert(&self) -> String {
        encode_cert(&self.cert_der)
    }

    fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

pub fn encode_cert(der: &[u8]) -> String {
    STANDARD_NO_PAD.encode(der)
}

/// Accepts padded and unpadded input.
pub fn decode_cert(encoded: &str) -> Result<Vec<u8>, PluginError> {
    STANDARD_NO_PAD.decode(encoded.trim().trim_end_matches('=')).map_err(|e| PluginError::TlsConfig {
        reason: format!("invalid certificate encoding: {e}"),
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: rustls::Error) -> PluginError {
    PluginError::TlsConfig { reason: e.to_string() }
}

fn check_pinned(expected: &[u8], presented: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    if presented.as_ref() == expected {
        Ok(())
    } else {
        Err(rustls::Error::General("peer presented an unexpected certificate".to_string()))
    }
}

/// Accepts only the one server certificate the plugin announced.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        check_pinned(&self.expected, end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Requires and accepts only the host's client certificate.
#[derive(Debug)]
struct PinnedClientVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_pinned(&self.expected, end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Plugin-side configuration: serve `server` and demand `client_cert_der`.
pub fn server_config(server: &CertifiedKey, client_cert_der: Vec<u8>) -> Result<Arc<ServerConfig>, PluginError> {
    let provider = provider();
    let verifier = PinnedClientVerifier {
        expected: client_cert_der,
        provider: Arc::clone(&provider),
    };
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(server.chain(), server.private_key())
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// Host-side configuration: present `client` and trust only `server_cert_der`.
pub fn client_config(client: &CertifiedKey, server_cert_der: Vec<u8>) -> Result<Arc<ClientConfig>, PluginError> {
    let provider = provider();
    let verifier = PinnedServerVerifier {
        expected: server_cert_der,
        provider: Arc::clone(&provider),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(client.chain(), client.private_key())
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// Run the server side of the handshake on an accepted stream.
pub async fn accept<IO>(config: Arc<ServerConfig>, io: IO) -> Result<tokio_rustls::server::TlsStream<IO>, PluginError>
where IO: AsyncRead + AsyncWrite + Unpin {
    TlsAcceptor::from(config).accept(io).await.context(TlsHandshakeSnafu)
}

/// Run the client side of the handshake on a dialed stream.
pub async fn connect<IO>(config: Arc<ClientConfig>, io: IO) -> Result<tokio_rustls::client::TlsStream<IO>, PluginError>
where IO: AsyncRead + AsyncWrite + Unpin {
    let name = ServerName::try_from(PLUGIN_SERVER_NAME.to_string()).map_err(|e| PluginError::TlsConfig {
        reason: e.to_string(),
    })?;
    TlsConnector::from(config).connect(name, io).await.context(TlsHandshakeSnafu)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn test_cert_encoding_roundtrip() {
        let key = CertifiedKey::generate().unwrap();
        assert_eq!(decode_cert(&key.encoded_cert()).unwrap(), key.cert_der);
    }

    #[tokio::test]
    async fn test_mutual_tls_with_pinned_certs() {
        let host = CertifiedKey::generate().unwrap();
        let plugin = CertifiedKey::generate().unwrap();
        let server = server_config(&plugin, host.cert_der.clone()).unwrap();
        let client = client_config(&host, plugin.cert_der.clone()).unwrap();

        let (a, b) = tokio::io::duplex(16 * 1024);
        let accept_task = tokio::spawn(async move {
            let mut stream = accept(server, b).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut stream = connect(client, a).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(&accept_task.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_unexpected_server_cert_is_rejected() {
        let host = CertifiedKey::generate().unwrap();
        let plugin = CertifiedKey::generate().unwrap();
        let impostor = CertifiedKey::generate().unwrap();
        let server = server_config(&impostor, host.cert_der.clone()).unwrap();
        let client = client_config(&host, plugin.cert_der.clone()).unwrap();

        let (a, b) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = accept(server, b).await;
        });
        assert!(connect(client, a).await.is_err());
    }
}
