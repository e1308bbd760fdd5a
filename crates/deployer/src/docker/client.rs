//! Docker client — core struct, constructor, error classification.

use bollard::Docker;
use thiserror::Error;

/// Driver errors collapse into three classes the orchestration layer can
/// act on: `NotFound` is success on removal paths, `Conflict` is retryable
/// with backoff, `Fatal` surfaces.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("engine busy: {0}")]
    Conflict(String),
    #[error("engine failure: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

pub(super) fn classify(err: bollard::errors::Error) -> DriverError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => DriverError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => DriverError::Conflict(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => DriverError::Conflict(message),
        bollard::errors::Error::IOError { err } => DriverError::Conflict(err.to_string()),
        bollard::errors::Error::RequestTimeoutError => {
            DriverError::Conflict("engine request timed out".to_string())
        }
        other => DriverError::Fatal(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    /// The bollard Docker client. `pub(super)` so domain modules in
    /// sibling files can call bollard APIs directly.
    pub(super) client: Docker,
}

impl DockerClient {
    /// Connect to the engine. An empty socket path means bollard defaults
    /// (`DOCKER_HOST` or the platform socket).
    pub fn new(socket_path: &str) -> Result<Self, DriverError> {
        let connection = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| DriverError::Fatal(format!("docker connection failed: {}", e)))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| DriverError::Fatal(format!("docker connection failed: {}", e)))?
        };

        Ok(DockerClient { client: connection })
    }

    /// Liveness probe against the engine.
    pub async fn ping(&self) -> Result<(), DriverError> {
        self.client.ping().await.map(|_| ()).map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_404_as_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container: abc".to_string(),
        };
        let classified = classify(err);
        assert!(classified.is_not_found());
        assert!(classified.to_string().contains("abc"));
    }

    #[test]
    fn test_classify_409_as_conflict() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "removal already in progress".to_string(),
        };
        assert!(matches!(classify(err), DriverError::Conflict(_)));
    }

    #[test]
    fn test_classify_server_error_as_conflict() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon hiccup".to_string(),
        };
        assert!(matches!(classify(err), DriverError::Conflict(_)));
    }

    #[test]
    fn test_classify_client_error_as_fatal() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "invalid host config".to_string(),
        };
        assert!(matches!(classify(err), DriverError::Fatal(_)));
    }
}
