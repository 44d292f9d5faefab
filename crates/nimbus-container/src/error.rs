use nimbus_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error(
        "Cannot connect to Docker: {0}\n\nHint:\n  • Check that the Docker daemon is running\n  • Check that DOCKER_HOST points at a reachable socket"
    )]
    DockerConnectionFailed(String),

    #[error("Container '{container}' not found")]
    ContainerNotFound { container: String },

    #[error("Network '{network}' not found")]
    NetworkNotFound { network: String },

    #[error(
        "Image '{image}' not found\n\nHint:\n  • Check the image name and tag\n  • Run docker pull {image} manually to see the registry error"
    )]
    ImageNotFound { image: String },

    #[error("Docker API error: {0}")]
    DockerApiError(String),

    #[error("Proxy configuration error: {0}")]
    ConfigError(String),

    #[error("Container '{container}' still {last_state} after {attempts} checks")]
    ContainerWaitTimeout {
        container: String,
        attempts: u32,
        last_state: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        let message = err.to_string();
        let unreachable = ["Connection refused", "No such file or directory"]
            .iter()
            .any(|needle| message.contains(needle));
        if unreachable && !is_not_found(&err) {
            ContainerError::DockerConnectionFailed(message)
        } else {
            // 404s are named by callers that know which resource was asked for
            ContainerError::DockerApiError(message)
        }
    }
}

impl From<ContainerError> for BackendError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::ContainerNotFound { .. }
            | ContainerError::NetworkNotFound { .. }
            | ContainerError::ImageNotFound { .. } => BackendError::NotFound(err.to_string()),
            ContainerError::DockerConnectionFailed(msg) => BackendError::Unavailable(msg),
            ContainerError::ContainerWaitTimeout { .. } => BackendError::Timeout(err.to_string()),
            ContainerError::ConfigError(msg) => BackendError::InvalidRequest(msg),
            ContainerError::Io(e) => BackendError::Io(e),
            ContainerError::DockerApiError(msg) => BackendError::Api(msg),
        }
    }
}

/// True for a Docker 404 response
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub type Result<T> = std::result::Result<T, ContainerError>;
