//! Error Module
//!
//! Defines error types and result types used by configuration, logging setup,
//! the one-shot chunk helpers and the command line driver. The tunnel itself
//! reports I/O failures as events, not as errors.

use thiserror::Error;

/// Main error type for the tunnel crate
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Chunked encoding error: {0}")]
    ChunkedError(String),

    #[error("Endpoint error: {0}")]
    EndpointError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for TunnelError {
    fn from(err: serde_yaml::Error) -> Self {
        TunnelError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::SerializationError(err.to_string())
    }
}

/// Result type alias for the tunnel crate
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TunnelError = io.into();
        assert!(matches!(err, TunnelError::IoError(_)));
        assert_eq!(err.to_string(), "IO error: missing");
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<u32>("not: [a number").unwrap_err();
        let err: TunnelError = yaml_err.into();
        assert!(matches!(err, TunnelError::SerializationError(_)));
    }
}
