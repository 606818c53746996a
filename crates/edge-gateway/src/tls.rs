//! mTLS termination
//!
//! The handshake requires a client certificate but does not judge it: an
//! expired bootstrap certificate must still reach the registration route.
//! The peer chain is captured per connection and attached to every request
//! as a [`ClientCertChain`] extension; the auth layer classifies it.

use std::io;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use fleet_pki::CertKeyPair;
use futures::future::BoxFuture;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tower_http::add_extension::AddExtension;

use crate::error::GatewayError;

/// DER certificates presented by the peer, leaf first
#[derive(Clone, Debug, Default)]
pub struct ClientCertChain(pub Vec<Vec<u8>>);

impl ClientCertChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn certs(&self) -> &[Vec<u8>] {
        &self.0
    }
}

/// Requires a client certificate and checks only proof of key possession
#[derive(Debug)]
pub struct RequireAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl RequireAnyClientCert {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for RequireAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// TLS 1.3-only server configuration with mandatory client certificates
pub fn server_config(server: &CertKeyPair) -> Result<ServerConfig, GatewayError> {
    let certs = pem::parse_many(server.cert_pem.as_bytes())
        .map_err(|e| GatewayError::Tls(format!("invalid server certificate: {e}")))?
        .into_iter()
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect::<Vec<_>>();
    let key = pem::parse(server.key_pem.as_bytes())
        .map_err(|e| GatewayError::Tls(format!("invalid server key: {e}")))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.into_contents()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(RequireAnyClientCert::new(&provider));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| GatewayError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Rustls acceptor that exposes the peer chain to request handlers
#[derive(Debug, Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = tokio_rustls::server::TlsStream<I>;
    type Service = AddExtension<S, ClientCertChain>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let chain = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default();
            Ok((stream, AddExtension::new(service, ClientCertChain(chain))))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_pki::CertificateAuthority;

    #[test]
    fn test_server_config_requires_client_cert() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let pair = ca.issue_server_cert(&["gateway.edgefleet.io".to_string()], true).unwrap();
        let config = server_config(&pair).unwrap();
        assert!(config.alpn_protocols.contains(&b"h2".to_vec()));

        let verifier = RequireAnyClientCert::new(&rustls::crypto::ring::default_provider());
        assert!(verifier.client_auth_mandatory());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn test_server_config_rejects_garbage() {
        let pair = CertKeyPair {
            cert_pem: "nope".into(),
            key_pem: "nope".into(),
        };
        assert!(matches!(server_config(&pair), Err(GatewayError::Tls(_))));
    }

    #[test]
    fn test_chain_accessors() {
        assert!(ClientCertChain::default().is_empty());
        assert_eq!(ClientCertChain::new(vec![vec![1]]).certs().len(), 1);
    }
}
