use thiserror::Error;

/// Outcome classes every adapter (repository, storage, lock store) reports.
/// Callers above the adapters only ever reason about these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => AdapterError::Transient(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AdapterError::Conflict(db.message().to_string())
            }
            _ => AdapterError::Permanent(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for AdapterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            AdapterError::Transient(err.to_string())
        } else {
            AdapterError::Permanent(err.to_string())
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Permanent(err.to_string())
    }
}
