//! Connection seam between the sink and a database driver

use async_trait::async_trait;

use super::{SinkError, SqlValue};
use crate::config::SinkConfig;

/// Largest number of rows sent in one multi-row `INSERT`
pub const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Postgres accepts at most this many bind parameters per statement
pub const MAX_BIND_PARAMETERS: usize = 65535;

/// `INSERT INTO <table> VALUES (...)` with one placeholder per column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    table: String,
    columns: usize,
}

impl InsertStatement {
    pub fn new(table: impl Into<String>, columns: usize) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Single-row form, used to validate the statement when a connection opens
    pub fn sql(&self) -> String {
        let placeholders: Vec<String> = (1..=self.columns).map(|i| format!("${}", i)).collect();
        format!("INSERT INTO {} VALUES ({})", self.table, placeholders.join(", "))
    }

    /// Rows per multi-row statement, bounded by the bind parameter limit
    pub fn rows_per_chunk(&self) -> usize {
        (MAX_BIND_PARAMETERS / self.columns.max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
    }
}

/// Opens connections for a sink
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: SinkConnection;

    /// Open a connection with autocommit off
    async fn connect(&self, config: &SinkConfig) -> Result<Self::Connection, SinkError>;
}

/// One open connection holding one uncommitted transaction
#[async_trait]
pub trait SinkConnection: Send {
    /// Liveness check; `false` means the connection must be replaced
    async fn ping(&mut self) -> bool;

    /// Prepare `statement`, failing if the table or column count is wrong
    async fn prepare(&mut self, statement: &InsertStatement) -> Result<(), SinkError>;

    /// Send all rows inside the open transaction; returns rows inserted
    async fn execute_batch(
        &mut self,
        statement: &InsertStatement,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64, SinkError>;

    async fn commit(&mut self) -> Result<(), SinkError>;

    async fn close(self) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row_sql() {
        let statement = InsertStatement::new("staging.events", 3);
        assert_eq!(statement.sql(), "INSERT INTO staging.events VALUES ($1, $2, $3)");
    }

    #[test]
    fn test_chunk_size_respects_bind_limit() {
        assert_eq!(InsertStatement::new("t", 2).rows_per_chunk(), 1000);
        assert_eq!(InsertStatement::new("t", 100).rows_per_chunk(), 655);
        assert_eq!(InsertStatement::new("t", 70000).rows_per_chunk(), 1);
    }
}
