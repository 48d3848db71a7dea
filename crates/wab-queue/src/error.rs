use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Receipt handle not found: {0}")]
    NotFound(String),

    #[error("Queue is stopped")]
    Stopped,
}
