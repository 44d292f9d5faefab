//! Backend error types

use thiserror::Error;

/// Errors reported by backend drivers
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for nimbus_core::CloudError {
    fn from(err: BackendError) -> Self {
        nimbus_core::CloudError::internal_from("backend call failed", err)
    }
}

/// Attaches the failing step to a backend error on its way into the service layer
pub trait BackendResultExt<T> {
    fn step(self, step: &str) -> nimbus_core::Result<T>;
}

impl<T> BackendResultExt<T> for Result<T> {
    fn step(self, step: &str) -> nimbus_core::Result<T> {
        self.map_err(|e| nimbus_core::CloudError::internal_from(step, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::ErrorKind;
    use std::error::Error as _;

    #[test]
    fn test_step_wraps_as_internal() {
        let r: Result<()> = Err(BackendError::CommandFailed("ovs-vsctl exited 1".into()));
        let err = r.step("create bridge").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "internal error: create bridge");
        assert!(
            err.source()
                .unwrap()
                .to_string()
                .contains("ovs-vsctl exited 1")
        );
    }
}
