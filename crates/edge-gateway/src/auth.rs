//! Request classification
//!
//! Every request is classified before any handler logic runs. Enrolment
//! and registration accept `register-auth` (signature only, expiry
//! ignored); everything else demands `device-auth`. Identity and namespace
//! come from the certificate, never from the request body.

use fleet_pki::{PeerIdentity, VerifyError, verify_device_peer, verify_register_peer};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::tls::ClientCertChain;

/// Verification mode selected by the route and directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthClass {
    /// Enrolment and registration: signature must verify, expiry ignored
    Register,
    /// Any other route: full X.509 verification, bootstrap identity refused
    Device,
}

/// Authenticated peer as seen by handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub class: AuthClass,
    /// Lowercased certificate CN
    pub common_name: String,
    /// Namespace from the certificate OU, or the initial namespace
    pub namespace: String,
}

impl AuthContext {
    /// True when the peer used the shared bootstrap certificate
    pub fn is_bootstrap(&self) -> bool {
        self.common_name == fleet_pki::REGISTER_COMMON_NAME
    }

    /// Reject requests addressing a device the certificate does not own
    pub fn ensure_owner(&self, device_id: &str, metrics: &GatewayMetrics) -> Result<()> {
        if self.common_name == device_id.to_lowercase() {
            return Ok(());
        }
        metrics.invalid_owner.inc();
        Err(GatewayError::Forbidden(format!(
            "certificate for '{}' cannot act on device '{device_id}'",
            self.common_name
        )))
    }
}

/// Classify the peer chain of one request
pub fn authenticate(
    chain: Option<&ClientCertChain>,
    class: AuthClass,
    roots: &[Vec<u8>],
    initial_namespace: &str,
    metrics: &GatewayMetrics,
) -> Result<AuthContext> {
    let certs = chain.map(ClientCertChain::certs).unwrap_or_default();
    let verified: std::result::Result<PeerIdentity, VerifyError> = match class {
        AuthClass::Register => verify_register_peer(certs, roots),
        AuthClass::Device => verify_device_peer(certs, roots),
    };

    match verified {
        Ok(identity) => {
            debug!(cn = %identity.common_name, ?class, "Authenticated peer");
            Ok(AuthContext {
                class,
                namespace: identity
                    .namespace
                    .unwrap_or_else(|| initial_namespace.to_string()),
                common_name: identity.common_name,
            })
        }
        Err(e) => {
            metrics.failed_auth.with_label_values(&[e.reason()]).inc();
            Err(GatewayError::Unauthenticated(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use fleet_pki::{CertificateAuthority, CertificateRequest, parse_pem};

    struct Fixture {
        ca: CertificateAuthority,
        roots: Vec<Vec<u8>>,
        metrics: GatewayMetrics,
    }

    fn fixture() -> Fixture {
        let ca = CertificateAuthority::new("edgefleet-ca").unwrap();
        let roots = vec![ca.ca_cert_der().unwrap()];
        Fixture { ca, roots, metrics: GatewayMetrics::new().unwrap() }
    }

    fn device_chain(ca: &CertificateAuthority, name: &str, ns: &str) -> ClientCertChain {
        let request = CertificateRequest::new(name).unwrap();
        let pem = ca.sign_csr(request.csr_pem(), name, ns, 30).unwrap();
        ClientCertChain::new(vec![parse_pem(&pem).unwrap()])
    }

    #[test]
    fn test_no_certificate_is_bad_request() {
        let f = fixture();
        let err = authenticate(None, AuthClass::Device, &f.roots, "edgefleet", &f.metrics).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_bootstrap_refused_on_device_routes() {
        let f = fixture();
        let pem = f.ca.issue_bootstrap_cert().unwrap().cert_pem;
        let chain = ClientCertChain::new(vec![parse_pem(&pem).unwrap()]);

        let ctx = authenticate(Some(&chain), AuthClass::Register, &f.roots, "edgefleet", &f.metrics).unwrap();
        assert!(ctx.is_bootstrap());
        assert_eq!(ctx.namespace, "edgefleet");

        let err = authenticate(Some(&chain), AuthClass::Device, &f.roots, "edgefleet", &f.metrics).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            f.metrics.failed_auth.with_label_values(&["bootstrap_identity"]).get(),
            1
        );
    }

    #[test]
    fn test_device_namespace_from_certificate() {
        let f = fixture();
        let chain = device_chain(&f.ca, "edge-01", "edge");
        let ctx = authenticate(Some(&chain), AuthClass::Device, &f.roots, "edgefleet", &f.metrics).unwrap();
        assert_eq!(ctx.common_name, "edge-01");
        assert_eq!(ctx.namespace, "edge");
    }

    #[test]
    fn test_ownership() {
        let f = fixture();
        let chain = device_chain(&f.ca, "edge-01", "edge");
        let ctx = authenticate(Some(&chain), AuthClass::Device, &f.roots, "edgefleet", &f.metrics).unwrap();

        assert!(ctx.ensure_owner("EDGE-01", &f.metrics).is_ok());
        let err = ctx.ensure_owner("edge-02", &f.metrics).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(f.metrics.invalid_owner.get(), 1);
    }
}
