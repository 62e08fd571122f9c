// Error handling framework

use thiserror::Error;

/// Scheduler engine errors
///
/// Synchronous entry points (`add_job`, `set_in_progress`, `set_result`)
/// surface these to the caller. Background loops log and absorb them, with
/// the exception of `LoopExhausted`, which ends the engine.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    Configuration(String),

    #[error("Job type mismatch: engine schedules '{expected}' jobs, got a '{found}' job")]
    TypeMismatch { expected: String, found: String },

    #[error("Invalid job result status: {0}")]
    InvalidResult(String),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Job payload serialization failed: {0}")]
    Payload(String),

    #[error("Loop '{loop_name}' panicked {restarts} consecutive times, giving up")]
    LoopExhausted { loop_name: String, restarts: u32 },
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Database connection and migration errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::InvalidRow(format!("column {}: {}", index, source))
            }
            sqlx::Error::Database(db_err) => StoreError::Database(db_err.message().to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationFailed(err.to_string())
    }
}
