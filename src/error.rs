//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Tollgate operations.
///
/// Errors on the RPC path are `tonic::Status` values; this type covers
/// configuration and start-up concerns.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid rule, key specification or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Rules file parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
