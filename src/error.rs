//! Error types for the Tollgate library.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid policy or backend configuration, detected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The storage backend could not be initialized
    #[error("Store initialization failed: {0}")]
    StoreInit(String),

    /// A store operation failed after construction
    #[error("Store operation failed: {0}")]
    Store(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
