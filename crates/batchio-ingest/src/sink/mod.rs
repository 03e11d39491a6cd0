//! Batched relational sink
//!
//! Turns delimited text records into typed rows and writes them to one table
//! in a single transaction. The connection is opened lazily on the first
//! write, checked for liveness before writes, reopened once if it has gone
//! away, and committed when the sink is closed.
//!
//! Rows are held in memory until [`BatchedRelationalSink::close`], so a
//! reconnect never loses rows that were accepted earlier and nothing becomes
//! visible in the table before the commit.

pub mod connection;
pub mod error;
pub mod postgres;
pub mod types;

use batchio_common::types::Record;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ArityPolicy, SinkConfig};

pub use connection::{Connector, InsertStatement, SinkConnection};
pub use error::SinkError;
pub use postgres::{PgConnector, PgSinkConnection};
pub use types::{SqlType, SqlValue};

/// Observable connection state of a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No write has arrived yet
    Unopened,
    Open,
    /// The connection failed a liveness check and was not yet replaced
    Closed,
    /// `close` has run; further writes fail
    Finished,
    /// `close` failed part way; nothing was committed and every further call fails
    Failed,
}

enum SinkState<C> {
    Unopened,
    Open(C),
    Closed,
    Finished,
    Failed,
}

/// Counters kept by a sink over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub rows_batched: u64,
    pub rows_skipped: u64,
    pub rows_committed: u64,
    pub reconnects: u64,
}

pub struct BatchedRelationalSink<K: Connector> {
    connector: K,
    config: SinkConfig,
    statement: InsertStatement,
    state: SinkState<K::Connection>,
    pending: Vec<Vec<SqlValue>>,
    stats: SinkStats,
    writes_since_check: u64,
}

impl<K: Connector> BatchedRelationalSink<K> {
    /// Validates `config`; no connection is made until the first write.
    pub fn new(connector: K, config: SinkConfig) -> Result<Self, SinkError> {
        config.validate()?;
        let statement = InsertStatement::new(config.table.clone(), config.column_types.len());
        Ok(Self {
            connector,
            config,
            statement,
            state: SinkState::Unopened,
            pending: Vec::new(),
            stats: SinkStats::default(),
            writes_since_check: 0,
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            SinkState::Unopened => ConnectionState::Unopened,
            SinkState::Open(_) => ConnectionState::Open,
            SinkState::Closed => ConnectionState::Closed,
            SinkState::Finished => ConnectionState::Finished,
            SinkState::Failed => ConnectionState::Failed,
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Rows accepted but not yet sent
    pub fn pending_rows(&self) -> &[Vec<SqlValue>] {
        &self.pending
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    async fn open(&mut self) -> Result<(), SinkError> {
        let mut conn = self.connector.connect(&self.config).await?;
        conn.prepare(&self.statement).await?;
        self.state = SinkState::Open(conn);
        self.writes_since_check = 0;
        Ok(())
    }

    /// Get to `Open`, reconnecting at most once
    async fn ensure_open(&mut self) -> Result<(), SinkError> {
        match self.state {
            SinkState::Finished | SinkState::Failed => return Err(SinkError::Closed),
            SinkState::Unopened => return self.open().await,
            SinkState::Closed => {
                self.stats.reconnects += 1;
                return self.open().await;
            },
            SinkState::Open(_) => {},
        }

        let interval = self.config.health_check_interval;
        if interval == 0 {
            return Ok(());
        }
        self.writes_since_check += 1;
        if self.writes_since_check < interval {
            return Ok(());
        }
        self.writes_since_check = 0;

        let alive = match &mut self.state {
            SinkState::Open(conn) => conn.ping().await,
            _ => false,
        };
        if alive {
            return Ok(());
        }

        warn!(
            table = %self.config.table,
            pending = self.pending.len(),
            "Sink connection failed liveness check, reconnecting"
        );
        self.state = SinkState::Closed;
        self.stats.reconnects += 1;
        self.open().await
    }

    fn tokenize<'a>(&self, text: &'a str) -> Vec<&'a str> {
        if self.statement.columns() == 1 {
            vec![text]
        } else {
            text.split(self.config.delimiter.as_str()).collect()
        }
    }

    /// Add one delimited row to the batch.
    ///
    /// Returns `false` when the row was skipped because its field count did
    /// not match the column count and the arity policy is `Skip`.
    pub async fn write_text(&mut self, text: &str) -> Result<bool, SinkError> {
        self.ensure_open().await?;

        let tokens = self.tokenize(text);
        let expected = self.statement.columns();
        if tokens.len() != expected {
            match self.config.on_arity_mismatch {
                ArityPolicy::Skip => {
                    self.stats.rows_skipped += 1;
                    debug!(expected, actual = tokens.len(), "Skipping row with wrong field count");
                    return Ok(false);
                },
                ArityPolicy::Fail => {
                    return Err(SinkError::ArityMismatch {
                        expected,
                        actual: tokens.len(),
                    })
                },
            }
        }

        let row = tokens
            .iter()
            .zip(&self.config.column_types)
            .enumerate()
            .map(|(column, (token, sql_type))| sql_type.parse_value(token, column))
            .collect::<Result<Vec<_>, _>>()?;

        self.pending.push(row);
        self.stats.rows_batched += 1;
        Ok(true)
    }

    /// Write the record's key as a delimited row
    pub async fn write(&mut self, record: &Record) -> Result<bool, SinkError> {
        self.write_text(&record.key_text()).await
    }

    /// Send the batch, commit and close the connection.
    ///
    /// A second call after a successful close is a no-op, as is closing a sink
    /// that never opened. If sending or committing fails the batch is lost, the sink moves
    /// to [`ConnectionState::Failed`] and every later call, `close` included,
    /// returns [`SinkError::Closed`].
    pub async fn close(&mut self) -> Result<SinkStats, SinkError> {
        // stays Failed unless the commit below goes through
        let mut conn = match std::mem::replace(&mut self.state, SinkState::Failed) {
            SinkState::Finished | SinkState::Unopened => {
                self.state = SinkState::Finished;
                return Ok(self.stats);
            },
            SinkState::Failed => return Err(SinkError::Closed),
            SinkState::Open(conn) => conn,
            SinkState::Closed => {
                self.stats.reconnects += 1;
                let mut conn = self.connector.connect(&self.config).await?;
                conn.prepare(&self.statement).await?;
                conn
            },
        };

        let rows = std::mem::take(&mut self.pending);
        let count = rows.len();
        if count > 0 {
            conn.execute_batch(&self.statement, rows).await?;
        }
        conn.commit().await?;
        self.stats.rows_committed += count as u64;
        self.state = SinkState::Finished;
        conn.close().await?;

        info!(
            table = %self.config.table,
            rows = count,
            skipped = self.stats.rows_skipped,
            reconnects = self.stats.reconnects,
            "Committed batch"
        );
        Ok(self.stats)
    }

    /// Drop the connection without committing. Pending rows are discarded.
    pub async fn abort(&mut self) {
        if let SinkState::Open(conn) = std::mem::replace(&mut self.state, SinkState::Finished) {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing aborted sink connection");
            }
        }
        let discarded = std::mem::take(&mut self.pending).len();
        if discarded > 0 {
            warn!(table = %self.config.table, rows = discarded, "Sink aborted, batch discarded");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        connects: usize,
        refuse_connects_after: Option<usize>,
        pings: VecDeque<bool>,
        prepared: Vec<String>,
        batches: Vec<Vec<Vec<SqlValue>>>,
        commits: usize,
        fail_commit: bool,
        closes: usize,
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        state: Arc<Mutex<MockState>>,
    }

    struct MockConnection {
        state: Arc<Mutex<MockState>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Connection = MockConnection;

        async fn connect(&self, _config: &SinkConfig) -> Result<MockConnection, SinkError> {
            let mut state = self.state.lock().unwrap();
            if state.refuse_connects_after.is_some_and(|n| state.connects >= n) {
                return Err(SinkError::Connection(sqlx::Error::Protocol("refused".into())));
            }
            state.connects += 1;
            Ok(MockConnection {
                state: self.state.clone(),
            })
        }
    }

    #[async_trait]
    impl SinkConnection for MockConnection {
        async fn ping(&mut self) -> bool {
            self.state.lock().unwrap().pings.pop_front().unwrap_or(true)
        }

        async fn prepare(&mut self, statement: &InsertStatement) -> Result<(), SinkError> {
            self.state.lock().unwrap().prepared.push(statement.sql());
            Ok(())
        }

        async fn execute_batch(
            &mut self,
            _statement: &InsertStatement,
            rows: Vec<Vec<SqlValue>>,
        ) -> Result<u64, SinkError> {
            let count = rows.len() as u64;
            self.state.lock().unwrap().batches.push(rows);
            Ok(count)
        }

        async fn commit(&mut self) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_commit {
                return Err(SinkError::Commit(sqlx::Error::PoolClosed));
            }
            state.commits += 1;
            Ok(())
        }

        async fn close(self) -> Result<(), SinkError> {
            self.state.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    fn config(types: Vec<SqlType>) -> SinkConfig {
        SinkConfig::new("localhost", "warehouse", "events", types).with_credentials("loader", "secret")
    }

    fn sink(types: Vec<SqlType>) -> (BatchedRelationalSink<MockConnector>, Arc<Mutex<MockState>>) {
        let connector = MockConnector::default();
        let state = connector.state.clone();
        (BatchedRelationalSink::new(connector, config(types)).unwrap(), state)
    }

    #[tokio::test]
    async fn test_matching_row_is_batched_with_types() {
        let (mut sink, _) = sink(vec![SqlType::Integer, SqlType::Varchar]);

        assert!(sink.write_text("42|hello").await.unwrap());
        assert_eq!(
            sink.pending_rows(),
            &[vec![SqlValue::Integer(42), SqlValue::Text("hello".into())]]
        );
    }

    #[tokio::test]
    async fn test_extra_field_is_skipped() {
        let (mut sink, _) = sink(vec![SqlType::Integer, SqlType::Varchar]);

        assert!(!sink.write_text("42|hello|extra").await.unwrap());
        assert!(sink.pending_rows().is_empty());
        assert_eq!(sink.stats().rows_skipped, 1);
        assert_eq!(sink.stats().rows_batched, 0);
    }

    #[tokio::test]
    async fn test_fail_policy_rejects_bad_arity() {
        let mut cfg = config(vec![SqlType::Integer, SqlType::Varchar]);
        cfg.on_arity_mismatch = ArityPolicy::Fail;
        let mut sink = BatchedRelationalSink::new(MockConnector::default(), cfg).unwrap();

        let err = sink.write_text("42").await.unwrap_err();
        assert!(matches!(err, SinkError::ArityMismatch { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn test_single_column_takes_the_whole_line() {
        let (mut sink, _) = sink(vec![SqlType::Varchar]);

        assert!(sink.write_text("a|b|c").await.unwrap());
        assert_eq!(sink.pending_rows(), &[vec![SqlValue::Text("a|b|c".into())]]);
    }

    #[tokio::test]
    async fn test_empty_tokens_are_kept() {
        let (mut sink, _) = sink(vec![SqlType::Varchar, SqlType::Varchar, SqlType::Varchar]);

        assert!(sink.write_text("a||").await.unwrap());
        assert_eq!(
            sink.pending_rows()[0],
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Text(String::new()),
                SqlValue::Text(String::new())
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_opens_on_first_write() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        assert_eq!(sink.state(), ConnectionState::Unopened);
        assert_eq!(state.lock().unwrap().connects, 0);

        sink.write_text("1").await.unwrap();
        assert_eq!(sink.state(), ConnectionState::Open);
        let state = state.lock().unwrap();
        assert_eq!(state.connects, 1);
        assert_eq!(state.prepared, vec!["INSERT INTO events VALUES ($1)"]);
    }

    #[tokio::test]
    async fn test_close_commits_everything_once() {
        let (mut sink, state) = sink(vec![SqlType::Integer, SqlType::Varchar]);
        sink.write_text("1|a").await.unwrap();
        sink.write_text("2|b").await.unwrap();
        sink.write_text("bad").await.unwrap();

        let stats = sink.close().await.unwrap();
        assert_eq!(stats.rows_committed, 2);
        assert_eq!(stats.rows_skipped, 1);
        {
            let state = state.lock().unwrap();
            assert_eq!(state.batches.len(), 1);
            assert_eq!(state.batches[0].len(), 2);
            assert_eq!(state.commits, 1);
            assert_eq!(state.closes, 1);
        }

        // second close is a no-op
        let again = sink.close().await.unwrap();
        assert_eq!(again, stats);
        let state = state.lock().unwrap();
        assert_eq!(state.commits, 1);
        assert_eq!(state.closes, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_is_not_forgotten() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        sink.write_text("1").await.unwrap();
        state.lock().unwrap().fail_commit = true;

        assert!(matches!(sink.close().await, Err(SinkError::Commit(_))));
        assert_eq!(sink.state(), ConnectionState::Failed);
        assert_eq!(sink.stats().rows_committed, 0);

        // a retry must not look like a successful commit
        state.lock().unwrap().fail_commit = false;
        assert!(matches!(sink.close().await, Err(SinkError::Closed)));
        assert!(matches!(sink.write_text("2").await, Err(SinkError::Closed)));
        let state = state.lock().unwrap();
        assert_eq!(state.commits, 0);
        assert_eq!(state.connects, 1);
    }

    #[tokio::test]
    async fn test_close_without_writes_opens_nothing() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        sink.close().await.unwrap();

        assert_eq!(state.lock().unwrap().connects, 0);
        assert_eq!(sink.state(), ConnectionState::Finished);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut sink, _) = sink(vec![SqlType::Integer]);
        sink.write_text("1").await.unwrap();
        sink.close().await.unwrap();

        assert!(matches!(sink.write_text("2").await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_ping_reconnects_and_keeps_rows() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        sink.write_text("1").await.unwrap();
        state.lock().unwrap().pings.push_back(false);

        sink.write_text("2").await.unwrap();
        assert_eq!(sink.stats().reconnects, 1);
        assert_eq!(state.lock().unwrap().connects, 2);

        sink.close().await.unwrap();
        let state = state.lock().unwrap();
        assert_eq!(state.batches[0].len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_propagates() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        sink.write_text("1").await.unwrap();
        {
            let mut state = state.lock().unwrap();
            state.pings.push_back(false);
            state.refuse_connects_after = Some(1);
        }

        let err = sink.write_text("2").await.unwrap_err();
        assert!(matches!(err, SinkError::Connection(_)));
        assert_eq!(sink.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_initial_connection_failure_propagates() {
        let connector = MockConnector::default();
        connector.state.lock().unwrap().refuse_connects_after = Some(0);
        let mut sink = BatchedRelationalSink::new(connector, config(vec![SqlType::Integer])).unwrap();

        assert!(matches!(sink.write_text("1").await, Err(SinkError::Connection(_))));
        assert_eq!(sink.state(), ConnectionState::Unopened);
    }

    #[tokio::test]
    async fn test_health_check_interval() {
        let mut cfg = config(vec![SqlType::Integer]);
        cfg.health_check_interval = 3;
        let connector = MockConnector::default();
        let state = connector.state.clone();
        let mut sink = BatchedRelationalSink::new(connector, cfg).unwrap();

        sink.write_text("1").await.unwrap();
        state.lock().unwrap().pings.extend([false, false]);
        sink.write_text("2").await.unwrap();
        sink.write_text("3").await.unwrap();
        assert_eq!(sink.stats().reconnects, 0);

        // third write after opening runs the check
        sink.write_text("4").await.unwrap();
        assert_eq!(sink.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_unsupported_type_is_fatal() {
        let (mut sink, _) = sink(vec![SqlType::Integer, SqlType::Other(2004)]);

        let err = sink.write_text("1|blob").await.unwrap_err();
        assert!(matches!(err, SinkError::TypeNotImplemented { column: 1, .. }));
    }

    #[tokio::test]
    async fn test_abort_discards_rows() {
        let (mut sink, state) = sink(vec![SqlType::Integer]);
        sink.write_text("1").await.unwrap();
        sink.abort().await;

        let state = state.lock().unwrap();
        assert_eq!(state.commits, 0);
        assert_eq!(state.closes, 1);
        assert!(state.batches.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut cfg = config(vec![SqlType::Integer]);
        cfg.host.clear();
        assert!(matches!(
            BatchedRelationalSink::new(MockConnector::default(), cfg),
            Err(SinkError::Config(_))
        ));
    }
}
