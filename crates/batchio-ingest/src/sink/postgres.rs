//! Postgres connector built on sqlx

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::query_builder::Separated;
use sqlx::{Connection, Executor, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::connection::{Connector, InsertStatement, SinkConnection};
use super::{SinkError, SqlValue};
use crate::config::SinkConfig;

/// Opens one [`PgConnection`] per sink
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgSinkConnection;

    async fn connect(&self, config: &SinkConfig) -> Result<PgSinkConnection, SinkError> {
        let mut conn = PgConnection::connect_with(&config.connect_options())
            .await
            .map_err(SinkError::Connection)?;

        // rows stay invisible until the final COMMIT
        conn.execute("BEGIN").await.map_err(SinkError::Connection)?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            table = %config.table,
            "Opened sink connection"
        );
        Ok(PgSinkConnection { conn })
    }
}

pub struct PgSinkConnection {
    conn: PgConnection,
}

fn push_value(row: &mut Separated<'_, '_, Postgres, &'static str>, value: SqlValue) {
    match value {
        SqlValue::Text(v) => row.push_bind(v),
        SqlValue::Decimal(v) => row.push_bind(v),
        SqlValue::SmallInt(v) => row.push_bind(v),
        SqlValue::Integer(v) => row.push_bind(v),
        SqlValue::BigInt(v) => row.push_bind(v),
        SqlValue::Real(v) => row.push_bind(v),
        SqlValue::Double(v) => row.push_bind(v),
        SqlValue::Date(v) => row.push_bind(v),
        SqlValue::Time(v) => row.push_bind(v),
        SqlValue::Timestamp(v) => row.push_bind(v),
    };
}

#[async_trait]
impl SinkConnection for PgSinkConnection {
    async fn ping(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    async fn prepare(&mut self, statement: &InsertStatement) -> Result<(), SinkError> {
        let sql = statement.sql();
        self.conn
            .prepare(sql.as_str())
            .await
            .map_err(SinkError::Connection)?;
        debug!(sql = %sql, "Prepared insert statement");
        Ok(())
    }

    async fn execute_batch(
        &mut self,
        statement: &InsertStatement,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64, SinkError> {
        let chunk_size = statement.rows_per_chunk();
        let mut inserted = 0u64;
        let mut rows = rows.into_iter().peekable();

        while rows.peek().is_some() {
            let chunk: Vec<Vec<SqlValue>> = rows.by_ref().take(chunk_size).collect();

            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ", statement.table()));
            query_builder.push_values(chunk, |mut b, row| {
                for value in row {
                    push_value(&mut b, value);
                }
            });

            let result = query_builder
                .build()
                .execute(&mut self.conn)
                .await
                .map_err(SinkError::Batch)?;
            inserted += result.rows_affected();
        }

        debug!(rows = inserted, table = statement.table(), "Executed batch");
        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        self.conn.execute("COMMIT").await.map_err(SinkError::Commit)?;
        Ok(())
    }

    async fn close(self) -> Result<(), SinkError> {
        self.conn.close().await.map_err(SinkError::Connection)
    }
}
