//! Error — failures at the runtime daemon boundary and their classification.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Docker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Log stream reset: {0}")]
    StreamReset(String),
    #[error("Unexpected daemon response ({status}): {message}")]
    UnexpectedStatus { status: u16, message: String },
    #[error("Bollard error: {0}")]
    Bollard(#[from] bollard::errors::Error),
}

impl SourceError {
    /// Map a non-success HTTP status from the daemon.
    pub fn from_status(status: u16, container_id: &str, message: String) -> Self {
        match status {
            404 => SourceError::ContainerNotFound(container_id.to_string()),
            401 | 403 => SourceError::PermissionDenied(message),
            _ => SourceError::UnexpectedStatus { status, message },
        }
    }

    /// The container is gone (or we may not read it): retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::ContainerNotFound(_) | SourceError::PermissionDenied(_) => true,
            SourceError::Bollard(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => matches!(status_code, 401 | 403 | 404),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_fatal() {
        let err = SourceError::from_status(404, "abc123", "no such container".to_string());
        assert!(matches!(err, SourceError::ContainerNotFound(ref id) if id == "abc123"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_forbidden_is_fatal() {
        let err = SourceError::from_status(403, "abc123", "denied".to_string());
        assert!(matches!(err, SourceError::PermissionDenied(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = SourceError::from_status(500, "abc123", "boom".to_string());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        assert!(SourceError::ConnectionFailed("refused".to_string()).is_retryable());
        assert!(SourceError::StreamReset("eof".to_string()).is_retryable());
    }

    #[test]
    fn test_bollard_404_is_fatal() {
        let err = SourceError::from(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        });
        assert!(err.is_fatal());

        let err = SourceError::from(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "internal".to_string(),
        });
        assert!(err.is_retryable());
    }
}
