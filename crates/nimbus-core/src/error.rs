//! Control plane error types
//!
//! Every service operation returns [`CloudError`]. The variant decides how a
//! caller should react: validation problems are never retried, conflicts are
//! surfaced as-is, and backend failures arrive wrapped as `Internal` after the
//! service has cleaned up whatever it already did.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Control plane errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("instance not running: {0}")]
    InstanceNotRunning(String),

    #[error("cross-VPC reference: {0}")]
    CrossVpc(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

/// Discriminant of [`CloudError`] without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    QuotaExceeded,
    InstanceNotRunning,
    CrossVpc,
    Internal,
    Cancelled,
}

impl CloudError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CloudError::InvalidInput(message.into())
    }

    pub fn not_found(resource: &str, key: impl std::fmt::Display) -> Self {
        CloudError::NotFound(format!("{} '{}'", resource, key))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CloudError::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CloudError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a lower-level failure with a message describing the step that failed
    pub fn internal_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CloudError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::InvalidInput(_) => ErrorKind::InvalidInput,
            CloudError::NotFound(_) => ErrorKind::NotFound,
            CloudError::Unauthorized(_) => ErrorKind::Unauthorized,
            CloudError::Forbidden(_) => ErrorKind::Forbidden,
            CloudError::Conflict(_) => ErrorKind::Conflict,
            CloudError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            CloudError::InstanceNotRunning(_) => ErrorKind::InstanceNotRunning,
            CloudError::CrossVpc(_) => ErrorKind::CrossVpc,
            CloudError::Internal { .. } => ErrorKind::Internal,
            CloudError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::internal_from("JSON serialization failed", err)
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
