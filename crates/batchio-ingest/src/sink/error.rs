//! Sink error types

use thiserror::Error;

use super::SqlType;

/// Everything that can fail a sink. Only a failed liveness check is
/// recovered internally (by reconnecting); every variant here is fatal for
/// the task that owns the sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Column {column} has SQL type {sql_type}, which is not yet implemented")]
    TypeNotImplemented { column: usize, sql_type: SqlType },

    #[error("Column {column}: '{value}' is not a valid {sql_type}: {reason}")]
    InvalidValue {
        column: usize,
        sql_type: SqlType,
        value: String,
        reason: String,
    },

    #[error("Record has {actual} fields, expected {expected}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Batch execution failed: {0}")]
    Batch(#[source] sqlx::Error),

    #[error("Commit failed: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("Sink is closed")]
    Closed,
}

impl SinkError {
    /// Whether the error came from the database side rather than the input
    pub fn is_database_error(&self) -> bool {
        matches!(self, SinkError::Connection(_) | SinkError::Batch(_) | SinkError::Commit(_))
    }
}
