//! Column type resolution
//!
//! The sink needs the SQL type of every destination column before the first
//! row is written. Types are looked up once per job and then passed to every
//! task through the `batchio.sink.types` key.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info};

use crate::sink::{SinkError, SqlType};

#[async_trait]
pub trait ColumnTypeResolver: Send + Sync {
    /// Ordered SQL types of the columns of `table`
    async fn resolve(&self, table: &str) -> Result<Vec<SqlType>, SinkError>;
}

/// Resolver that returns a fixed list, for callers that already know the types
#[derive(Debug, Clone)]
pub struct StaticColumnTypes(pub Vec<SqlType>);

#[async_trait]
impl ColumnTypeResolver for StaticColumnTypes {
    async fn resolve(&self, _table: &str) -> Result<Vec<SqlType>, SinkError> {
        Ok(self.0.clone())
    }
}

/// Reads column types from `information_schema` over a short-lived connection
#[derive(Debug, Clone)]
pub struct PgColumnTypeResolver {
    options: PgConnectOptions,
}

impl PgColumnTypeResolver {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ColumnTypeResolver for PgColumnTypeResolver {
    async fn resolve(&self, table: &str) -> Result<Vec<SqlType>, SinkError> {
        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(SinkError::Connection)?;
        let types = resolve_column_types(&mut conn, table).await;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing resolver connection");
        }
        types
    }
}

/// Split `schema.table` into its parts. Unquoted identifiers fold to lower case.
pub fn split_table_name(table: &str) -> (Option<String>, String) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema.to_lowercase()), name.to_lowercase()),
        None => (None, table.to_lowercase()),
    }
}

/// Query the column types of `table`, in column order.
///
/// An unqualified name is looked up in the connection's current schema.
/// A table with no visible columns is reported as a configuration error.
pub async fn resolve_column_types(
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<SqlType>, SinkError> {
    let (schema, name) = split_table_name(table);

    let data_types: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT data_type::text
        FROM information_schema.columns
        WHERE table_schema = COALESCE($1, current_schema())
          AND table_name = $2
        ORDER BY ordinal_position
        "#,
    )
    .bind(schema)
    .bind(&name)
    .fetch_all(&mut *conn)
    .await
    .map_err(SinkError::Connection)?;

    if data_types.is_empty() {
        return Err(SinkError::Config(format!("Table '{}' not found or has no columns", table)));
    }

    let types: Vec<SqlType> = data_types
        .iter()
        .map(|t| SqlType::from_pg_data_type(t))
        .collect();

    info!(
        table,
        columns = types.len(),
        types = %SqlType::join_codes(&types),
        "Resolved column types"
    );
    Ok(types)
}
