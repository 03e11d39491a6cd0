//! Fragment readers
//!
//! A [`FragmentReader`] turns one [`FileFragment`] into a stream of records.
//! [`ChainedFragmentReader`] strings readers together so that every fragment
//! of a logical unit is read, in order, as one stream.
//!
//! Three framers are provided:
//!
//! - [`LineReader`]: one record per newline-delimited line
//! - [`WholeFileReader`]: one record per file, path as key and bytes as value
//! - [`JsonRecordReader`]: one record per JSON document located by a record
//!   identifier key, invalid documents dropped

pub mod boundary;
pub mod chain;
pub mod line;
pub mod structured;
pub mod whole_file;

use batchio_common::types::{FileFragment, Record};
use batchio_common::{BatchioError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use boundary::{BoundaryDetector, JsonBoundaryDetector, RawRecord};
pub use chain::{ChainPhase, ChainedFragmentReader};
pub use line::LineReader;
pub use structured::{JsonOptions, JsonRecordReader, JsonValidator, RecordValidator, StructuredRecordFramer};
pub use whole_file::{WholeFileOptions, WholeFileReader};

/// Capability shared by all per-fragment readers
pub trait FragmentReader: Sized {
    /// Per-job settings handed to every `open` call
    type Options: Clone;

    /// Open `fragment` using exactly its `(path, start, length)`.
    fn open(fragment: &FileFragment, options: &Self::Options) -> Result<Self>;

    /// Next record, or `None` once the fragment is exhausted
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Fraction of the fragment consumed, in `[0, 1]`
    fn progress(&self) -> f32;

    /// Release the underlying file. Calling it twice is harmless.
    fn close(&mut self) -> Result<()>;
}

/// How the bytes of a fragment are cut into records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    #[default]
    Lines,
    WholeFile,
    Json,
}

impl FramingMode {
    /// Whether the planner may cut `path` into several fragments
    pub fn is_splittable(self, path: &Path) -> bool {
        match self {
            FramingMode::Lines => !line::is_gzip(path),
            FramingMode::Json => true,
            FramingMode::WholeFile => false,
        }
    }

    /// One-document-per-line JSON is read with the plain line framer
    pub fn resolve(self, json_one_record_per_line: bool) -> Self {
        match self {
            FramingMode::Json if json_one_record_per_line => FramingMode::Lines,
            other => other,
        }
    }
}

impl std::str::FromStr for FramingMode {
    type Err = BatchioError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lines" | "text" => Ok(FramingMode::Lines),
            "whole-file" | "whole_file" | "file" => Ok(FramingMode::WholeFile),
            "json" => Ok(FramingMode::Json),
            other => Err(BatchioError::Config(format!("Unknown framing mode: {}", other))),
        }
    }
}

impl std::fmt::Display for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingMode::Lines => write!(f, "lines"),
            FramingMode::WholeFile => write!(f, "whole-file"),
            FramingMode::Json => write!(f, "json"),
        }
    }
}
