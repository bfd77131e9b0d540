//! Error types for the ingestion pipeline

use rusqlite::{ffi, ErrorCode};
use thiserror::Error;

use crate::parser::ParseError;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the ingestion pipeline.
///
/// Line-level problems (malformed lines, failed validation rules) never
/// surface here: they become error records and processing continues.
/// Everything in this enum is either retryable (lock timeouts) or fatal
/// for the submission.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Submission {submission_id} cannot move from {from} to {to}")]
    InvalidState {
        submission_id: String,
        from: String,
        to: String,
    },

    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("{rows} row(s) of {table} reference missing {parent} rows")]
    ReferentialViolation {
        table: String,
        parent: String,
        rows: usize,
    },

    #[error("Cannot determine record kind from file name: {0}")]
    UnknownFileKind(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<EtlError>,
    },
}

impl EtlError {
    /// True for SQLite busy/locked failures, the only class the retry
    /// executor is allowed to retry.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            EtlError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// True when the store rejected a write because a parent row is missing.
    pub fn is_referential_violation(&self) -> bool {
        match self {
            EtlError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
                    && err.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY
            }
            EtlError::ReferentialViolation { .. } => true,
            EtlError::RetryExhausted { source, .. } => source.is_referential_violation(),
            _ => false,
        }
    }
}
