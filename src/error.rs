//! Error types for the Floodgate service.
//!
//! None of these are raised on the admission hot path: quota rejections are
//! decision values and store failures are absorbed by the engine.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy failed validation
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// No policy is bound to the requested operation
    #[error("No rate limit policy bound to operation '{0}'")]
    UnknownOperation(String),

    /// Quota store errors surfaced outside of admission checks (startup, health)
    #[error("Quota store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
