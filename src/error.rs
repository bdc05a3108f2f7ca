//! Error types for omoide-serial.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("worker {0} is not in list of registered workers")]
    UnknownWorker(String),

    #[error("there is no operation of type {0:?}")]
    UnknownOperation(String),

    #[error("operation variant {0:?} is registered twice")]
    DuplicateVariant(String),

    #[error("operation {id} has problem: {problem}")]
    BadOperation { id: i64, problem: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that must stop the worker process instead of being recorded
    /// against a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownWorker(_)
                | Error::UnknownOperation(_)
                | Error::Config(_)
                | Error::Database(_)
                | Error::Migrate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
