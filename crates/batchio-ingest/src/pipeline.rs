//! Ingest pipeline
//!
//! census → plan → one task per logical unit. Each task runs its chained
//! reader on the blocking pool and streams records over a bounded channel to
//! a sink owned by that task. Units run concurrently with a fixed limit.

use anyhow::{Context, Result};
use batchio_common::types::{LogicalUnit, Record};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::census;
use crate::config::{
    JobProperties, SinkConfig, JSON_ONE_RECORD_PER_LINE_KEY, JSON_RECORD_IDENTIFIER_KEY, WHOLE_FILE_MAX_LEN_KEY,
};
use crate::plan::plan_units;
use crate::reader::{
    ChainedFragmentReader, FragmentReader, FramingMode, JsonOptions, JsonRecordReader, LineReader,
    WholeFileOptions, WholeFileReader,
};
use crate::sink::{BatchedRelationalSink, Connector, SinkStats};

/// Default number of units processed at once
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Records buffered between a unit's reader and its sink
pub const RECORD_CHANNEL_CAPACITY: usize = 1024;

/// What to read and how to cut it up
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub inputs: Vec<PathBuf>,
    pub unit_count: i64,
    pub mode: FramingMode,
    pub concurrency: usize,
    pub properties: JobProperties,
}

impl IngestJob {
    pub fn new(inputs: Vec<PathBuf>, unit_count: i64, mode: FramingMode) -> Self {
        Self {
            inputs,
            unit_count,
            mode,
            concurrency: DEFAULT_CONCURRENCY,
            properties: JobProperties::new(),
        }
    }

    /// Mode after applying `batchio.json.one_record_per_line`
    pub fn effective_mode(&self) -> FramingMode {
        self.mode
            .resolve(self.properties.get_bool(JSON_ONE_RECORD_PER_LINE_KEY))
    }

    /// Reader settings for the effective mode. Fails when JSON framing has no identifier.
    pub fn reader_options(&self) -> batchio_common::Result<ReaderOptions> {
        match self.effective_mode() {
            FramingMode::Lines => Ok(ReaderOptions::Lines),
            FramingMode::WholeFile => {
                let mut options = WholeFileOptions::default();
                if let Some(raw) = self.properties.get(WHOLE_FILE_MAX_LEN_KEY) {
                    options.max_len = raw.trim().parse().map_err(|_| {
                        batchio_common::BatchioError::Config(format!(
                            "Invalid {}: '{}'",
                            WHOLE_FILE_MAX_LEN_KEY, raw
                        ))
                    })?;
                }
                Ok(ReaderOptions::WholeFile(options))
            },
            FramingMode::Json => Ok(ReaderOptions::Json(JsonOptions::new(
                self.properties.get(JSON_RECORD_IDENTIFIER_KEY),
            )?)),
        }
    }
}

/// Per-mode reader settings, checked once per job
#[derive(Debug, Clone)]
pub enum ReaderOptions {
    Lines,
    WholeFile(WholeFileOptions),
    Json(JsonOptions),
}

impl ReaderOptions {
    pub fn mode(&self) -> FramingMode {
        match self {
            ReaderOptions::Lines => FramingMode::Lines,
            ReaderOptions::WholeFile(_) => FramingMode::WholeFile,
            ReaderOptions::Json(_) => FramingMode::Json,
        }
    }
}

/// Result of one logical unit
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub index: usize,
    pub fragments: usize,
    pub bytes: u64,
    pub records_read: u64,
    pub sink: Option<SinkStats>,
}

/// Totals across all units of a run
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub units: usize,
    pub records_read: u64,
    pub rows_batched: u64,
    pub rows_skipped: u64,
    pub duration_seconds: f64,
    pub unit_reports: Vec<UnitReport>,
}

impl JobReport {
    fn from_units(run_id: Uuid, mut unit_reports: Vec<UnitReport>, started: Instant) -> Self {
        unit_reports.sort_by_key(|r| r.index);
        let records_read = unit_reports.iter().map(|r| r.records_read).sum();
        let sinks: Vec<&SinkStats> = unit_reports.iter().filter_map(|r| r.sink.as_ref()).collect();
        let rows_batched = sinks.iter().map(|s| s.rows_batched).sum();
        let rows_skipped = sinks.iter().map(|s| s.rows_skipped).sum();

        Self {
            run_id,
            units: unit_reports.len(),
            records_read,
            rows_batched,
            rows_skipped,
            duration_seconds: started.elapsed().as_secs_f64(),
            unit_reports,
        }
    }
}

/// Census and split planning for `job`
pub fn plan(job: &IngestJob) -> Result<Vec<LogicalUnit>> {
    // fewer bytes than units would give a zero target, which means unbounded
    let target = census::ideal_fragment_size(&job.inputs, job.unit_count)
        .context("Failed to compute fragment size")?
        .max(1);
    let files = census::list_files(&job.inputs).context("Failed to list input files")?;
    let mode = job.effective_mode();

    let units = plan_units(&files, target, |path| mode.is_splittable(path));
    info!(
        files = files.len(),
        target_bytes = target,
        units = units.len(),
        mode = %mode,
        "Planned logical units"
    );
    Ok(units)
}

/// Run the chained reader for one unit, handing each record to `emit`.
///
/// Stops early when `emit` returns `false`. Returns the number of records read.
pub fn read_unit<R, F>(unit: LogicalUnit, options: R::Options, mut emit: F) -> batchio_common::Result<u64>
where
    R: FragmentReader,
    F: FnMut(Record) -> bool,
{
    let mut reader = ChainedFragmentReader::<R>::new(unit, options);
    let mut count = 0u64;

    while let Some(record) = reader.next_record()? {
        count += 1;
        if !emit(record) {
            debug!(records = count, "Record consumer went away, stopping reader");
            break;
        }
    }

    reader.close()?;
    Ok(count)
}

/// [`read_unit`] with the reader picked from `options`
pub fn read_unit_with<F>(unit: LogicalUnit, options: &ReaderOptions, emit: F) -> batchio_common::Result<u64>
where
    F: FnMut(Record) -> bool,
{
    match options {
        ReaderOptions::Lines => read_unit::<LineReader, _>(unit, (), emit),
        ReaderOptions::WholeFile(o) => read_unit::<WholeFileReader, _>(unit, *o, emit),
        ReaderOptions::Json(o) => read_unit::<JsonRecordReader, _>(unit, o.clone(), emit),
    }
}

/// Read every unit and count records without writing anywhere
pub async fn run_scan(job: &IngestJob) -> Result<JobReport> {
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    let options = job.reader_options()?;
    let units = plan(job)?;
    let total = units.len();

    info!(%run_id, units = total, mode = %options.mode(), "Starting scan");

    let results: Vec<Result<UnitReport>> = stream::iter(units.into_iter().enumerate())
        .map(|(index, unit)| {
            let options = options.clone();
            async move {
                let fragments = unit.len();
                let bytes = unit.total_length();
                let records_read = tokio::task::spawn_blocking(move || read_unit_with(unit, &options, |_| true))
                    .await
                    .context("Reader task panicked")?
                    .with_context(|| format!("Failed to read unit {}", index))?;

                debug!(unit = index, records = records_read, "Scanned unit");
                Ok(UnitReport {
                    index,
                    fragments,
                    bytes,
                    records_read,
                    sink: None,
                })
            }
        })
        .buffer_unordered(job.concurrency.max(1))
        .collect()
        .await;

    let reports = collect_reports(run_id, results, total)?;
    let report = JobReport::from_units(run_id, reports, started);
    info!(
        %run_id,
        units = report.units,
        records = report.records_read,
        duration_seconds = report.duration_seconds,
        "Scan complete"
    );
    Ok(report)
}

/// Read every unit and write its records through a sink of its own.
///
/// Whole-file mode is rejected: its records are keyed by path and carry the
/// file bytes as the value, so there is no delimited row to insert.
pub async fn run_ingest<K>(job: &IngestJob, connector: K, sink_config: SinkConfig) -> Result<JobReport>
where
    K: Connector + Clone + 'static,
{
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    let options = job.reader_options()?;
    if let ReaderOptions::WholeFile(_) = options {
        anyhow::bail!("Ingest does not support {} mode; use scan to read whole files", options.mode());
    }
    sink_config.validate().context("Invalid sink configuration")?;
    let units = plan(job)?;
    let total = units.len();

    info!(
        %run_id,
        units = total,
        mode = %options.mode(),
        table = %sink_config.table,
        concurrency = job.concurrency,
        "Starting ingest"
    );

    let results: Vec<Result<UnitReport>> = stream::iter(units.into_iter().enumerate())
        .map(|(index, unit)| {
            ingest_unit(index, unit, options.clone(), connector.clone(), sink_config.clone())
        })
        .buffer_unordered(job.concurrency.max(1))
        .collect()
        .await;

    let reports = collect_reports(run_id, results, total)?;
    let report = JobReport::from_units(run_id, reports, started);
    info!(
        %run_id,
        units = report.units,
        records = report.records_read,
        rows = report.rows_batched,
        skipped = report.rows_skipped,
        duration_seconds = report.duration_seconds,
        "Ingest complete"
    );
    Ok(report)
}

async fn ingest_unit<K>(
    index: usize,
    unit: LogicalUnit,
    options: ReaderOptions,
    connector: K,
    sink_config: SinkConfig,
) -> Result<UnitReport>
where
    K: Connector + 'static,
{
    let fragments = unit.len();
    let bytes = unit.total_length();
    let mut sink = BatchedRelationalSink::new(connector, sink_config)?;

    let (tx, mut rx) = mpsc::channel::<Record>(RECORD_CHANNEL_CAPACITY);
    let reader = tokio::task::spawn_blocking(move || {
        read_unit_with(unit, &options, |record| tx.blocking_send(record).is_ok())
    });

    let mut write_error = None;
    while let Some(record) = rx.recv().await {
        if let Err(e) = sink.write(&record).await {
            write_error = Some(e);
            break;
        }
    }
    // unblocks the reader if the sink stopped early
    drop(rx);

    let read = reader.await.context("Reader task panicked");

    if let Some(e) = write_error {
        sink.abort().await;
        return Err(e).with_context(|| format!("Failed to write unit {}", index));
    }

    let records_read = match read {
        Ok(Ok(count)) => count,
        Ok(Err(e)) => {
            sink.abort().await;
            return Err(e).with_context(|| format!("Failed to read unit {}", index));
        },
        Err(e) => {
            sink.abort().await;
            return Err(e);
        },
    };

    let stats = sink
        .close()
        .await
        .with_context(|| format!("Failed to commit unit {}", index))?;

    debug!(
        unit = index,
        records = records_read,
        rows = stats.rows_committed,
        skipped = stats.rows_skipped,
        "Ingested unit"
    );
    Ok(UnitReport {
        index,
        fragments,
        bytes,
        records_read,
        sink: Some(stats),
    })
}

fn collect_reports(run_id: Uuid, results: Vec<Result<UnitReport>>, total: usize) -> Result<Vec<UnitReport>> {
    let mut reports = Vec::with_capacity(results.len());
    let mut failures = 0usize;

    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                failures += 1;
                error!(%run_id, error = %format!("{:#}", e), "Unit failed");
            },
        }
    }

    if failures > 0 {
        warn!(%run_id, failed = failures, succeeded = reports.len(), "Some units failed");
        anyhow::bail!("{} of {} units failed", failures, total);
    }
    Ok(reports)
}
