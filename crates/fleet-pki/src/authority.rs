//! Certificate authority operations
//!
//! The operator is the fleet CA. Agents generate their key pairs locally and
//! only ever send CSRs; the CA signs them with a subject it chooses itself.
//!
//! Four kinds of certificate are issued:
//! - the self-signed root
//! - the gateway server certificate (CN `*`, configured SANs)
//! - bootstrap registration certificates (CN `register`)
//! - per-device client certificates (CN = device name, OU = namespace)

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber, string::Ia5String,
};
use time::{Duration, OffsetDateTime};

use crate::error::{PkiError, Result};

/// Common name of the shared bootstrap identity
pub const REGISTER_COMMON_NAME: &str = "register";

/// Organization written into every device certificate
pub const FLEET_ORGANIZATION: &str = "edgefleet";

/// Root CA validity
pub const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Server and bootstrap certificate validity
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Default device certificate validity
pub const DEFAULT_CLIENT_CERT_EXPIRATION_DAYS: i64 = 30;

/// Backdating applied to device certificates to absorb clock drift on devices
pub const CLOCK_DRIFT_TOLERANCE: Duration = Duration::days(1);

/// Certificate and private key, both PEM encoded
#[derive(Clone)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

fn random_serial() -> SerialNumber {
    // Positive 16-byte serial
    let mut bytes = uuid::Uuid::new_v4().into_bytes().to_vec();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn distinguished_name(common_name: &str, org_unit: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(FLEET_ORGANIZATION.to_string()),
    );
    if let Some(ou) = org_unit {
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(ou.to_string()),
        );
    }
    dn
}

fn leaf_params(
    common_name: &str,
    org_unit: Option<&str>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, org_unit);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.serial_number = Some(random_serial());
    params.not_before = not_before;
    params.not_after = not_after;
    params
}

fn generate_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate {what} key: {e}")))
}

/// Fleet certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed root
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key_pair = generate_key("CA")?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {e}"))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from persisted PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::CaNotInitialized(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem)
            .map_err(|e| PkiError::CaNotInitialized(format!("failed to parse CA cert: {e}")))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format (for persistence)
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// CA certificate in DER format
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        parse_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::CaNotInitialized(format!("failed to load CA key: {e}")))
    }

    fn sign(&self, params: &CertificateParams, key: &KeyPair) -> Result<String> {
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::CaNotInitialized(format!("failed to create issuer: {e}")))?;
        let cert = params.signed_by(key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {e}"))
        })?;
        Ok(cert.pem())
    }

    /// Issue the gateway server certificate
    ///
    /// CN is `*`; SANs are the configured DNS names, plus `127.0.0.1` and
    /// `::1` when `local` is set.
    pub fn issue_server_cert(&self, dns_names: &[String], local: bool) -> Result<CertKeyPair> {
        let now = OffsetDateTime::now_utc();
        let mut params = leaf_params("*", None, now, now + Duration::days(CERT_VALIDITY_DAYS));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let mut sans = dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{name}': {e}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if local {
            sans.push(SanType::IpAddress(std::net::Ipv4Addr::LOCALHOST.into()));
            sans.push(SanType::IpAddress(std::net::Ipv6Addr::LOCALHOST.into()));
        }
        params.subject_alt_names = sans;

        let key = generate_key("server")?;
        let cert_pem = self.sign(&params, &key)?;
        Ok(CertKeyPair {
            cert_pem,
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a fresh bootstrap registration certificate (CN `register`)
    pub fn issue_bootstrap_cert(&self) -> Result<CertKeyPair> {
        let now = OffsetDateTime::now_utc();
        self.issue_client_cert(
            REGISTER_COMMON_NAME,
            None,
            now,
            now + Duration::days(CERT_VALIDITY_DAYS),
        )
    }

    /// Issue a client certificate with a server-generated key
    pub fn issue_client_cert(
        &self,
        common_name: &str,
        org_unit: Option<&str>,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<CertKeyPair> {
        let params = leaf_params(common_name, org_unit, not_before, not_after);
        let key = generate_key("client")?;
        let cert_pem = self.sign(&params, &key)?;
        Ok(CertKeyPair {
            cert_pem,
            key_pem: key.serialize_pem(),
        })
    }

    /// Sign a device CSR
    ///
    /// Only the public key is taken from the CSR. The subject is replaced
    /// with CN = `device` (lowercased), O = the fleet organization and
    /// OU = `namespace`, so a CSR can never claim another identity.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        device: &str,
        namespace: &str,
        expiration_days: i64,
    ) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {e}")))?;

        let now = OffsetDateTime::now_utc();
        csr.params = leaf_params(
            &device.to_lowercase(),
            Some(namespace),
            now - CLOCK_DRIFT_TOLERANCE,
            now + Duration::days(expiration_days.max(1)),
        );

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::CaNotInitialized(format!("failed to create issuer: {e}")))?;
        let cert = csr.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {e}"))
        })?;
        Ok(cert.pem())
    }
}

/// Key pair and CSR generated on the agent side
///
/// The gateway never needs this; it exists for tooling and tests that play
/// the agent.
pub struct CertificateRequest {
    key_pem: String,
    csr_pem: String,
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateRequest {
    /// Generate a key pair and a CSR claiming `common_name`
    pub fn new(common_name: &str) -> Result<Self> {
        let key_pair = generate_key("agent")?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("agent-chosen-org".to_string()),
        );
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {e}"))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {e}"))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}
