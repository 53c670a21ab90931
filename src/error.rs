//! Error types for the Triton generation client.

use std::time::Duration;
use thiserror::Error;

/// A specialized Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for session and adapter operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The model did not report ready before the load timeout expired
    #[error("Failed to load {model} on Triton in {timeout:?} (waited {elapsed:?})")]
    ModelLoadTimeout {
        model: String,
        elapsed: Duration,
        timeout: Duration,
    },

    /// Streaming was requested against a model that is not loaded
    #[error("Cannot request streaming, model '{0}' is not loaded")]
    ModelNotReady(String),

    /// The session already has a stream open
    #[error("A streaming request is already active on this session")]
    StreamAlreadyOpen,

    /// An administrative call or stream setup failed on the wire
    #[error("Transport error: {0}")]
    Transport(String),

    /// A response could not be decoded into text
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error came from the server or the wire rather than from the caller
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Transport(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::ModelNotReady("ensemble".to_string());
        assert_eq!(
            err.to_string(),
            "Cannot request streaming, model 'ensemble' is not loaded"
        );

        let err = Error::MalformedResponse("rank 3".to_string());
        assert_eq!(err.to_string(), "Malformed response: rank 3");
    }

    #[test]
    fn test_status_conversion() {
        let err: Error = tonic::Status::unavailable("server down").into();
        assert!(err.is_transport());
        assert!(err.to_string().contains("server down"));
    }

    #[test]
    fn test_config_conversion() {
        let err: Error = config::ConfigError::NotFound("server.url".to_string()).into();
        assert!(matches!(err, Error::Config(_)));
    }
}
