//! Host driver error types

use nimbus_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Path not managed by this driver: {0}")]
    ForeignPath(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<HostError> for BackendError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::ToolNotFound(tool) => BackendError::Unavailable(format!("{} not installed", tool)),
            HostError::CommandFailed { .. } => BackendError::CommandFailed(err.to_string()),
            HostError::ForeignPath(_) => BackendError::InvalidRequest(err.to_string()),
            HostError::VolumeNotFound(_) | HostError::SnapshotNotFound(_) => {
                BackendError::NotFound(err.to_string())
            }
            HostError::JsonError(e) => BackendError::Json(e),
            HostError::IoError(e) => BackendError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
