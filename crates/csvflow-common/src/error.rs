//! Error types shared across csvflow crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Unknown processing status: {0}")]
    UnknownStatus(String),
}
