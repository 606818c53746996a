//! EdgeFleet certificate authority
//!
//! - [`CertificateAuthority`]: pure X.509 operations (root creation, server
//!   and bootstrap issuance, CSR signing with a server-chosen subject)
//! - [`CaProvider`]: persistence of that material in Secrets plus a
//!   write-once in-memory cache of the root
//! - [`verify`]: classification of peer certificates into the bootstrap
//!   (`register`) and device identities

pub mod authority;
pub mod error;
pub mod provider;
pub mod verify;

pub use authority::{
    CertKeyPair, CertificateAuthority, CertificateRequest, DEFAULT_CLIENT_CERT_EXPIRATION_DAYS,
    FLEET_ORGANIZATION, REGISTER_COMMON_NAME, parse_pem,
};
pub use error::{PkiError, Result};
pub use provider::CaProvider;
pub use verify::{
    PeerCertificate, PeerIdentity, VerifyError, verify_device_peer, verify_register_peer,
};
