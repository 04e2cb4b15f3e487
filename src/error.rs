//! Error types for the index.

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage stack
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer pool has no free frame and no evictable frame
    #[error("buffer pool exhausted: every frame is pinned")]
    BufferPoolExhausted,

    /// On-disk data could not be decoded
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Rejected configuration (pool size, fan-out, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid operation for the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}
