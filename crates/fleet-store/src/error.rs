//! Store errors

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur when talking to the object store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency check failed (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object already exists on create
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Store temporarily unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Any other Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(KubeError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g. object without name or resourceVersion)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Unavailable(_) => true,
            Self::Kube(KubeError::Api(ae)) => ae.code == 429 || ae.code >= 500,
            Self::Kube(KubeError::SerdeError(_) | KubeError::BuildRequest(_)) => false,
            Self::Kube(_) => true,
            Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Serialization(_)
            | Self::InvalidRequest(_) => false,
        }
    }

    /// Returns true for [`StoreError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for [`StoreError::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<KubeError> for StoreError {
    fn from(e: KubeError) -> Self {
        match e {
            KubeError::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            KubeError::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(ae.message.clone())
            }
            KubeError::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            other => Self::Kube(other),
        }
    }
}
