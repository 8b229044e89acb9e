//! Error types for Snapdex

use thiserror::Error;

/// Result type alias for Snapdex operations
pub type Result<T> = std::result::Result<T, SnapdexError>;

/// Shared error type for Snapdex
#[derive(Error, Debug)]
pub enum SnapdexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid image identity '{value}': {reason}")]
    InvalidIdentity { value: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
