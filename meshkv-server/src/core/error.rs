use thiserror::Error;

/// Main error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("value must not be empty")]
    EmptyValue,

    #[error("unknown engine kind: {0}")]
    UnknownEngine(String),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
