//! Error types for Vigil

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Vigil
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database errors from the instance registry
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Wakeup publish errors
    #[error("Wakeup publish error: {0}")]
    Wakeup(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}
