use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Job not found: {0}")]
    UnknownJob(Uuid),

    #[error("Token not found: {0}")]
    UnknownToken(Uuid),

    #[error("Unknown dependency: {0}")]
    InvalidDependency(Uuid),

    #[error("Unknown job kind: {0}")]
    UnknownKind(String),

    #[error("Dequeue timed out")]
    DequeueTimeout,

    #[error("Job is not pending: {0}")]
    NotPending(Uuid),

    #[error("Job kind {0} can only be dequeued by id")]
    TargetedKindOnly(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
