//! Postgres round trips
//!
//! Each test starts a throwaway Postgres container, so they are ignored by
//! default. Run with `cargo test -- --ignored`.

use anyhow::Result;
use batchio_ingest::config::SinkConfig;
use batchio_ingest::pipeline::{self, IngestJob};
use batchio_ingest::reader::FramingMode;
use batchio_ingest::resolver::resolve_column_types;
use batchio_ingest::sink::{BatchedRelationalSink, ConnectionState, PgConnector, SqlType};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,batchio_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Container plus a sink config pointing at table `events` in it
async fn start_postgres() -> Result<(ContainerAsync<Postgres>, SinkConfig)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    let mut config =
        SinkConfig::new(host.to_string(), "postgres", "events", Vec::new()).with_credentials("postgres", "postgres");
    config.port = port;

    let mut conn = PgConnection::connect_with(&config.connect_options()).await?;
    sqlx::query(
        "CREATE TABLE events (id INTEGER, name VARCHAR(32), amount NUMERIC(10, 2), day DATE, seen_at TIMESTAMP)",
    )
    .execute(&mut conn)
    .await?;
    config.column_types = resolve_column_types(&mut conn, "events").await?;
    conn.close().await?;

    Ok((container, config))
}

async fn count_rows(config: &SinkConfig) -> Result<i64> {
    let mut conn = PgConnection::connect_with(&config.connect_options()).await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;
    Ok(count)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ingest_commits_every_unit() -> Result<()> {
    init_tracing();
    let (_container, config) = start_postgres().await?;
    assert_eq!(
        config.column_types,
        vec![
            SqlType::Integer,
            SqlType::Varchar,
            SqlType::Numeric,
            SqlType::Date,
            SqlType::Timestamp
        ]
    );

    let dir = TempDir::new()?;
    for file in 0..4 {
        let rows: String = (0..250)
            .map(|i| {
                let id = file * 250 + i;
                format!("{}|name {}|{}.25|2024-03-{:02}|2024-03-01 12:00:{:02}\n", id, id, id, i % 28 + 1, i % 60)
            })
            .collect();
        std::fs::write(dir.path().join(format!("part-{}.txt", file)), rows)?;
    }
    std::fs::write(dir.path().join("bad-arity.txt"), "1|only two\n")?;

    let job = IngestJob::new(vec![dir.path().to_path_buf()], 3, FramingMode::Lines);
    let report = pipeline::run_ingest(&job, PgConnector, config.clone()).await?;

    assert_eq!(report.records_read, 1001);
    assert_eq!(report.rows_batched, 1000);
    assert_eq!(report.rows_skipped, 1);
    assert_eq!(count_rows(&config).await?, 1000);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_nothing_is_visible_before_close() -> Result<()> {
    init_tracing();
    let (_container, config) = start_postgres().await?;

    let mut sink = BatchedRelationalSink::new(PgConnector, config.clone())?;
    sink.write_text("1|first|1.50|2024-01-01|2024-01-01 00:00:00").await?;
    sink.write_text("2|second|2.50|2024-01-02|2024-01-02 00:00:00.5").await?;
    assert_eq!(sink.state(), ConnectionState::Open);
    assert_eq!(count_rows(&config).await?, 0);

    let stats = sink.close().await?;
    assert_eq!(stats.rows_committed, 2);
    assert_eq!(count_rows(&config).await?, 2);

    // closing again does nothing
    sink.close().await?;
    assert_eq!(count_rows(&config).await?, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_aborted_sink_commits_nothing() -> Result<()> {
    init_tracing();
    let (_container, config) = start_postgres().await?;

    let mut sink = BatchedRelationalSink::new(PgConnector, config.clone())?;
    sink.write_text("1|first|1.50|2024-01-01|2024-01-01 00:00:00").await?;
    sink.abort().await;

    assert_eq!(count_rows(&config).await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unknown_table_is_a_config_error() -> Result<()> {
    let (_container, config) = start_postgres().await?;
    let mut conn = PgConnection::connect_with(&config.connect_options()).await?;

    let err = resolve_column_types(&mut conn, "missing_table").await.unwrap_err();
    assert!(err.to_string().contains("missing_table"));
    Ok(())
}
