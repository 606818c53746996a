//! PKI errors

use fleet_store::StoreError;
use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Root CA material missing or unreadable
    #[error("CA not initialized: {0}")]
    CaNotInitialized(String),

    /// Caller-supplied CSR could not be parsed
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or PEM parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Persisting or loading CA material failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
