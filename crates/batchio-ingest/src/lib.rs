//! batchio Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Reads many small files as a few logical input units and loads the records
//! into a relational table in bulk.
//!
//! # Overview
//!
//! - **Census**: byte totals over input paths and the even per-unit target size
//! - **Planning**: cutting files into fragments and packing them into units
//! - **Readers**: line, whole-file and JSON framers, chained across a unit
//! - **Sink**: typed, batched, single-transaction inserts into Postgres
//! - **Pipeline**: one task per unit with bounded concurrency
//!
//! # Example
//!
//! ```no_run
//! use batchio_ingest::pipeline::{run_scan, IngestJob};
//! use batchio_ingest::reader::FramingMode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let job = IngestJob::new(vec!["./data".into()], 8, FramingMode::Lines);
//!     let report = run_scan(&job).await?;
//!     println!("{} records in {} units", report.records_read, report.units);
//!     Ok(())
//! }
//! ```

pub mod census;
pub mod config;
pub mod pipeline;
pub mod plan;
pub mod reader;
pub mod resolver;
pub mod sink;

pub use config::{ArityPolicy, JobProperties, SinkConfig};
pub use pipeline::{IngestJob, JobReport};
pub use reader::{ChainedFragmentReader, FragmentReader, FramingMode};
pub use sink::{BatchedRelationalSink, PgConnector, SinkError, SqlType};
