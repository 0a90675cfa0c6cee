//! Error types for the Quill store adapters

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur when talking to the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command or connection failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Invalid request, e.g. a malformed connection URL
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Check if this error indicates the store could not be reached
    ///
    /// Connection-level failures are worth retrying; anything else points at a
    /// misconfiguration.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            Self::Unavailable(_) => true,
            Self::InvalidRequest(_) => false,
        }
    }
}
