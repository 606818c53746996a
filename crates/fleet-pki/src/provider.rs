//! CA provider
//!
//! Persists the root CA, the gateway server certificate and the bootstrap
//! certificates in Secrets in the operator namespace. The root CA is cached
//! in memory after the first fetch; the cache is write-once, so a rotated
//! root is only picked up after a restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::labels::{BOOTSTRAP_CERT_LABEL, LABEL_TRUE};
use fleet_store::{FleetStore, StoreError};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::authority::{CertKeyPair, CertificateAuthority};
use crate::error::{PkiError, Result};

/// Secret holding the root CA
pub const CA_SECRET: &str = "edgefleet-ca";
/// Secret holding the gateway server certificate
pub const SERVER_TLS_SECRET: &str = "edgefleet-server-tls";
/// Name prefix of bootstrap certificate secrets
pub const BOOTSTRAP_SECRET_PREFIX: &str = "edgefleet-bootstrap-";

pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

const CA_COMMON_NAME: &str = "edgefleet-ca";

fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| PkiError::CaNotInitialized(format!("secret {name} missing {key}")))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| PkiError::CaNotInitialized(format!("invalid {key} encoding in {name}: {e}")))
}

fn new_secret(
    namespace: &str,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
    data: &[(&str, &str)],
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels,
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Issues and persists fleet certificates
pub struct CaProvider {
    store: Arc<dyn FleetStore>,
    namespace: String,
    ca: OnceCell<CertificateAuthority>,
}

impl std::fmt::Debug for CaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaProvider")
            .field("namespace", &self.namespace)
            .field("loaded", &self.ca.initialized())
            .finish_non_exhaustive()
    }
}

impl CaProvider {
    /// Provider persisting its material in `namespace`
    pub fn new(store: Arc<dyn FleetStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ca: OnceCell::new(),
        }
    }

    /// Namespace holding the CA secrets
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Load the root CA from its Secret, creating and persisting it on first use
    pub async fn get_or_create_ca(&self) -> Result<&CertificateAuthority> {
        self.ca.get_or_try_init(|| self.load_or_create_ca()).await
    }

    async fn load_or_create_ca(&self) -> Result<CertificateAuthority> {
        if let Some(secret) = self.store.get_secret(&self.namespace, CA_SECRET).await? {
            info!("Loaded CA from Secret {}/{}", self.namespace, CA_SECRET);
            return Self::ca_from_secret(&secret);
        }

        info!("CA Secret not found, creating new CA");
        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        let secret = new_secret(
            &self.namespace,
            CA_SECRET,
            None,
            &[(CA_CERT_KEY, ca.ca_cert_pem()), (CA_KEY_KEY, ca.ca_key_pem())],
        );
        match self.store.create_secret(&secret).await {
            Ok(_) => {
                info!("Persisted CA to Secret {}/{}", self.namespace, CA_SECRET);
                Ok(ca)
            }
            // Another replica won the race; use its CA
            Err(StoreError::AlreadyExists(_)) => {
                let secret = self
                    .store
                    .get_secret(&self.namespace, CA_SECRET)
                    .await?
                    .ok_or_else(|| PkiError::CaNotInitialized(format!("{CA_SECRET} vanished after create conflict")))?;
                Self::ca_from_secret(&secret)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ca_from_secret(secret: &Secret) -> Result<CertificateAuthority> {
        let cert_pem = secret_string(secret, CA_CERT_KEY)?;
        let key_pem = secret_string(secret, CA_KEY_KEY)?;
        CertificateAuthority::from_pem(&cert_pem, &key_pem)
    }

    /// Gateway server certificate, issued on first use
    pub async fn get_or_create_server_cert(&self, dns_names: &[String], local: bool) -> Result<CertKeyPair> {
        let ca = self.get_or_create_ca().await?;
        if let Some(secret) = self.store.get_secret(&self.namespace, SERVER_TLS_SECRET).await? {
            debug!("Reusing server certificate from Secret {}/{}", self.namespace, SERVER_TLS_SECRET);
            return Ok(CertKeyPair {
                cert_pem: secret_string(&secret, TLS_CERT_KEY)?,
                key_pem: secret_string(&secret, TLS_KEY_KEY)?,
            });
        }

        let pair = ca.issue_server_cert(dns_names, local)?;
        let secret = new_secret(
            &self.namespace,
            SERVER_TLS_SECRET,
            None,
            &[(TLS_CERT_KEY, &pair.cert_pem), (TLS_KEY_KEY, &pair.key_pem), (CA_CERT_KEY, ca.ca_cert_pem())],
        );
        match self.store.create_secret(&secret).await {
            Ok(_) => {
                info!(sans = ?dns_names, local, "Issued gateway server certificate");
                Ok(pair)
            }
            Err(StoreError::AlreadyExists(_)) => {
                let secret = self
                    .store
                    .get_secret(&self.namespace, SERVER_TLS_SECRET)
                    .await?
                    .ok_or_else(|| PkiError::CaNotInitialized(format!("{SERVER_TLS_SECRET} vanished after create conflict")))?;
                Ok(CertKeyPair {
                    cert_pem: secret_string(&secret, TLS_CERT_KEY)?,
                    key_pem: secret_string(&secret, TLS_KEY_KEY)?,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Issue a new bootstrap certificate and store it in a labelled Secret
    ///
    /// Existing bootstrap secrets are left untouched; several may coexist.
    pub async fn create_bootstrap_cert(&self) -> Result<Secret> {
        let ca = self.get_or_create_ca().await?;
        let pair = ca.issue_bootstrap_cert()?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{BOOTSTRAP_SECRET_PREFIX}{}", &suffix[..8]);
        let labels = BTreeMap::from([(BOOTSTRAP_CERT_LABEL.to_string(), LABEL_TRUE.to_string())]);
        let secret = new_secret(
            &self.namespace,
            &name,
            Some(labels),
            &[(TLS_CERT_KEY, &pair.cert_pem), (TLS_KEY_KEY, &pair.key_pem), (CA_CERT_KEY, ca.ca_cert_pem())],
        );
        let created = self.store.create_secret(&secret).await?;
        info!("Created bootstrap certificate Secret {}/{}", self.namespace, name);
        Ok(created)
    }

    /// Make sure at least one bootstrap certificate exists
    pub async fn ensure_bootstrap_cert(&self) -> Result<()> {
        let query = format!("{BOOTSTRAP_CERT_LABEL}={LABEL_TRUE}");
        let existing = self.store.list_secrets(&self.namespace, &query).await?;
        if existing.is_empty() {
            self.create_bootstrap_cert().await?;
        } else {
            debug!(count = existing.len(), "Bootstrap certificate already present");
        }
        Ok(())
    }

    /// Sign a device CSR with the cached root
    pub async fn sign_csr(&self, csr_pem: &str, device: &str, namespace: &str, expiration_days: i64) -> Result<String> {
        self.get_or_create_ca()
            .await?
            .sign_csr(csr_pem, device, namespace, expiration_days)
    }

    /// DER roots used to verify peer certificates
    pub async fn trust_roots(&self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![self.get_or_create_ca().await?.ca_cert_der()?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::CertificateRequest;
    use crate::verify::{PeerCertificate, verify_register_peer};
    use fleet_store::MockFleetStore;

    fn provider(store: &MockFleetStore) -> CaProvider {
        CaProvider::new(Arc::new(store.clone()), "edgefleet")
    }

    #[tokio::test]
    async fn test_ca_is_persisted_and_reused() {
        let store = MockFleetStore::new();
        let first = provider(&store);
        let pem = first.get_or_create_ca().await.unwrap().ca_cert_pem().to_string();

        assert!(store.secrets("edgefleet").iter().any(|s| s.metadata.name.as_deref() == Some(CA_SECRET)));

        // A second process loads the same CA
        let second = provider(&store);
        assert_eq!(second.get_or_create_ca().await.unwrap().ca_cert_pem(), pem);
    }

    #[tokio::test]
    async fn test_ca_is_cached_after_first_fetch() {
        let store = MockFleetStore::new();
        let provider = provider(&store);
        provider.get_or_create_ca().await.unwrap();

        // Store outage no longer affects signing
        store.inject_failures(1);
        let request = CertificateRequest::new("edge-01").unwrap();
        provider.sign_csr(request.csr_pem(), "edge-01", "edge", 30).await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_certs_are_additive() {
        let store = MockFleetStore::new();
        let provider = provider(&store);

        provider.ensure_bootstrap_cert().await.unwrap();
        provider.ensure_bootstrap_cert().await.unwrap();
        provider.create_bootstrap_cert().await.unwrap();

        let bootstrap: Vec<_> = store
            .secrets("edgefleet")
            .into_iter()
            .filter(|s| s.metadata.labels.as_ref().is_some_and(|l| l.contains_key(BOOTSTRAP_CERT_LABEL)))
            .collect();
        assert_eq!(bootstrap.len(), 2);

        let roots = provider.trust_roots().await.unwrap();
        for secret in bootstrap {
            let cert_pem = secret_string(&secret, TLS_CERT_KEY).unwrap();
            let peer = PeerCertificate::from_pem(&cert_pem).unwrap();
            let der = crate::authority::parse_pem(&cert_pem).unwrap();
            assert_eq!(peer.common_name(), "register");
            assert!(verify_register_peer(&[der], &roots).unwrap().is_bootstrap());
        }
    }

    #[tokio::test]
    async fn test_server_cert_is_stable() {
        let store = MockFleetStore::new();
        let provider = provider(&store);
        let names = vec!["gateway.edgefleet.io".to_string()];

        let first = provider.get_or_create_server_cert(&names, false).await.unwrap();
        let second = provider.get_or_create_server_cert(&names, false).await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn test_corrupt_ca_secret_is_unrecoverable() {
        let store = MockFleetStore::new();
        store.put_secret(new_secret("edgefleet", CA_SECRET, None, &[(CA_CERT_KEY, "garbage")]));
        let err = provider(&store).get_or_create_ca().await.unwrap_err();
        assert!(matches!(err, PkiError::CaNotInitialized(_)));
    }
}
