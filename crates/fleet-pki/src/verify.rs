//! Peer certificate verification
//!
//! Two verification modes exist and are never merged:
//! - **register**: the leaf signature must verify against a trusted root;
//!   the validity window is ignored so that devices offline for a long
//!   time can still enrol with an expired bootstrap certificate.
//! - **device**: full verification (signature, validity window, key
//!   usage), and the bootstrap identity `register` is refused.

use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

use crate::authority::{REGISTER_COMMON_NAME, parse_pem};
use crate::error::{PkiError, Result};

/// Why a peer certificate was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no client certificate presented")]
    NoCertificate,

    #[error("malformed client certificate: {0}")]
    Malformed(String),

    #[error("certificate not signed by a trusted CA")]
    UntrustedSignature,

    #[error("certificate expired")]
    Expired,

    #[error("certificate not yet valid")]
    NotYetValid,

    #[error("certificate not usable for client authentication")]
    WrongKeyUsage,

    #[error("bootstrap certificate has no device privileges")]
    BootstrapIdentity,
}

impl VerifyError {
    /// Short label used as a metric dimension
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoCertificate => "no_certificate",
            Self::Malformed(_) => "malformed",
            Self::UntrustedSignature => "untrusted",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::WrongKeyUsage => "key_usage",
            Self::BootstrapIdentity => "bootstrap_identity",
        }
    }
}

/// Identity established for a verified peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Lowercased certificate CN
    pub common_name: String,
    /// Namespace hint carried in the subject OU
    pub namespace: Option<String>,
}

impl PeerIdentity {
    /// Returns true for the shared bootstrap identity
    pub fn is_bootstrap(&self) -> bool {
        self.common_name == REGISTER_COMMON_NAME
    }
}

/// Parsed view of a peer certificate
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    der: Vec<u8>,
    common_name: String,
    organization: Option<String>,
    org_unit: Option<String>,
    not_before: i64,
    not_after: i64,
    digital_signature: bool,
    client_auth: bool,
}

fn first_str<'a>(mut it: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>) -> Option<String> {
    it.next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

impl PeerCertificate {
    /// Parse a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {e}")))?;

        let subject = cert.subject();
        let common_name = first_str(subject.iter_common_name()).unwrap_or_default();
        let organization = first_str(subject.iter_organization());
        let org_unit = first_str(subject.iter_organizational_unit());

        // Absent extensions do not restrict usage
        let digital_signature = match cert.key_usage() {
            Ok(Some(ku)) => ku.value.digital_signature(),
            Ok(None) => true,
            Err(_) => false,
        };
        let client_auth = match cert.extended_key_usage() {
            Ok(Some(eku)) => eku.value.client_auth || eku.value.any,
            Ok(None) => true,
            Err(_) => false,
        };

        Ok(Self {
            der: der.to_vec(),
            common_name,
            organization,
            org_unit,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            digital_signature,
            client_auth,
        })
    }

    /// Parse a PEM-encoded certificate
    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::from_der(&parse_pem(pem)?)
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn organization(&self) -> Option<String> {
        self.organization.clone()
    }

    pub fn org_unit(&self) -> Option<String> {
        self.org_unit.clone()
    }

    /// NotBefore as a Unix timestamp
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    /// NotAfter as a Unix timestamp
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Returns true if the signature verifies against any of the DER roots
    pub fn verify_signature(&self, roots: &[Vec<u8>]) -> bool {
        let Ok((_, cert)) = X509Certificate::from_der(&self.der) else {
            return false;
        };
        roots.iter().any(|root| {
            X509Certificate::from_der(root)
                .is_ok_and(|(_, ca)| cert.verify_signature(Some(ca.public_key())).is_ok())
        })
    }

    fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            common_name: self.common_name.to_lowercase(),
            namespace: self.org_unit.clone().filter(|ou| !ou.is_empty()),
        }
    }
}

fn leaf(chain: &[Vec<u8>]) -> std::result::Result<PeerCertificate, VerifyError> {
    let der = chain.first().ok_or(VerifyError::NoCertificate)?;
    PeerCertificate::from_der(der).map_err(|e| VerifyError::Malformed(e.to_string()))
}

/// Verify a peer for the registration routes, ignoring expiry
pub fn verify_register_peer(
    chain: &[Vec<u8>],
    roots: &[Vec<u8>],
) -> std::result::Result<PeerIdentity, VerifyError> {
    let cert = leaf(chain)?;
    if !cert.verify_signature(roots) {
        return Err(VerifyError::UntrustedSignature);
    }
    Ok(cert.identity())
}

/// Verify a peer for device routes
pub fn verify_device_peer(
    chain: &[Vec<u8>],
    roots: &[Vec<u8>],
) -> std::result::Result<PeerIdentity, VerifyError> {
    verify_device_peer_at(chain, roots, OffsetDateTime::now_utc().unix_timestamp())
}

/// [`verify_device_peer`] at an explicit Unix time
pub fn verify_device_peer_at(
    chain: &[Vec<u8>],
    roots: &[Vec<u8>],
    now: i64,
) -> std::result::Result<PeerIdentity, VerifyError> {
    let cert = leaf(chain)?;
    if !cert.verify_signature(roots) {
        return Err(VerifyError::UntrustedSignature);
    }
    if now < cert.not_before {
        return Err(VerifyError::NotYetValid);
    }
    if now > cert.not_after {
        return Err(VerifyError::Expired);
    }
    if !cert.digital_signature || !cert.client_auth {
        return Err(VerifyError::WrongKeyUsage);
    }
    let identity = cert.identity();
    if identity.is_bootstrap() {
        return Err(VerifyError::BootstrapIdentity);
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{CertificateAuthority, CertificateRequest};
    use ::time::Duration;

    fn der(pem: &str) -> Vec<u8> {
        parse_pem(pem).unwrap()
    }

    fn expired_bootstrap(ca: &CertificateAuthority) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        let pair = ca
            .issue_client_cert(
                REGISTER_COMMON_NAME,
                None,
                now - Duration::days(400),
                now - Duration::days(35),
            )
            .unwrap();
        der(&pair.cert_pem)
    }

    #[test]
    fn test_expired_bootstrap_passes_register_auth() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        let chain = vec![expired_bootstrap(&ca)];

        let identity = verify_register_peer(&chain, &roots).unwrap();
        assert!(identity.is_bootstrap());

        assert_eq!(verify_device_peer(&chain, &roots), Err(VerifyError::Expired));
    }

    #[test]
    fn test_valid_bootstrap_fails_device_auth() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        let chain = vec![der(&ca.issue_bootstrap_cert().unwrap().cert_pem)];

        assert_eq!(
            verify_device_peer(&chain, &roots),
            Err(VerifyError::BootstrapIdentity)
        );
    }

    #[test]
    fn test_device_cert_carries_namespace() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        let request = CertificateRequest::new("edge-01").unwrap();
        let chain = vec![der(&ca.sign_csr(request.csr_pem(), "edge-01", "edge", 30).unwrap())];

        let identity = verify_device_peer(&chain, &roots).unwrap();
        assert_eq!(identity.common_name, "edge-01");
        assert_eq!(identity.namespace.as_deref(), Some("edge"));
    }

    #[test]
    fn test_foreign_ca_is_untrusted() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let rogue = CertificateAuthority::new("rogue-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        let chain = vec![der(&rogue.issue_bootstrap_cert().unwrap().cert_pem)];

        assert_eq!(
            verify_register_peer(&chain, &roots),
            Err(VerifyError::UntrustedSignature)
        );
        assert_eq!(
            verify_device_peer(&chain, &roots),
            Err(VerifyError::UntrustedSignature)
        );
    }

    #[test]
    fn test_empty_chain() {
        assert_eq!(verify_register_peer(&[], &[]), Err(VerifyError::NoCertificate));
        assert_eq!(
            verify_device_peer(&[vec![1, 2, 3]], &[]).map_err(|e| e.reason()),
            Err("malformed")
        );
    }

    #[test]
    fn test_not_yet_valid() {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        let request = CertificateRequest::new("edge-01").unwrap();
        let chain = vec![der(&ca.sign_csr(request.csr_pem(), "edge-01", "edge", 30).unwrap())];

        let two_days_ago = OffsetDateTime::now_utc().unix_timestamp() - 2 * 24 * 60 * 60;
        assert_eq!(
            verify_device_peer_at(&chain, &roots, two_days_ago),
            Err(VerifyError::NotYetValid)
        );
    }
}
