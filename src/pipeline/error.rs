//! Error taxonomy for the pipeline
//!
//! Failures never escape a task boundary: the scheduler folds `TaskError`
//! into the cycle report instead of propagating it.

use super::types::ObservationKind;
use thiserror::Error;

/// Adapter fetch failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Transport, auth, rate-limit or timeout. Retryable.
    #[error("adapter unavailable: {0}")]
    Unavailable(String),

    /// Malformed or unexpected payload. Not retryable, task is skipped.
    #[error("adapter data error: {0}")]
    Data(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::Data(err.to_string())
        } else {
            AdapterError::Unavailable(err.to_string())
        }
    }
}

/// Store read/write failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store write failed after {attempts} attempts: {reason}")]
    WriteFailed { attempts: u32, reason: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("store worker failed: {0}")]
    Join(String),

    #[error("store connection poisoned")]
    Poisoned,

    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Busy/locked database or a timed-out call; worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Outbound notification failures (logged, never raised)
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// What a failed ingestion task records in the cycle report
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{kind} task panicked: {reason}")]
    Panicked { kind: ObservationKind, reason: String },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_retryability() {
        assert!(AdapterError::Unavailable("503".into()).is_retryable());
        assert!(!AdapterError::Data("bad json".into()).is_retryable());
    }

    #[test]
    fn test_store_transient_classification() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        assert!(StoreError::Timeout(100).is_transient());

        let constraint = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_transient());
        assert!(!StoreError::Poisoned.is_transient());
    }
}
