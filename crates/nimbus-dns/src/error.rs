//! DNS client error types

use nimbus_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS API error: {0}")]
    ApiError(String),
}

impl From<DnsError> for BackendError {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::Http(e) if e.is_timeout() => BackendError::Timeout(e.to_string()),
            DnsError::Http(e) => BackendError::Unavailable(e.to_string()),
            other => BackendError::Api(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DnsError>;
