use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    /// The underlying store failed. Never interpreted as an acquired lock;
    /// callers treat this as a hard stop.
    #[error("Lock store error: {0}")]
    Store(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
