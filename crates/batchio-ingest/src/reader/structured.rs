//! Split-aware structured record framing

use batchio_common::types::{FileFragment, Record};
use batchio_common::{BatchioError, Result};
use serde::de::IgnoredAny;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::boundary::{BoundaryDetector, JsonBoundaryDetector};
use super::FragmentReader;
use crate::config::JSON_RECORD_IDENTIFIER_KEY;

/// Structural check applied to each raw record before it is handed out
pub trait RecordValidator {
    fn validate(&self, raw: &[u8]) -> std::result::Result<(), String>;
}

/// Accepts any well-formed JSON text
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValidator;

impl RecordValidator for JsonValidator {
    fn validate(&self, raw: &[u8]) -> std::result::Result<(), String> {
        serde_json::from_slice::<IgnoredAny>(raw)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Pulls raw records from a detector up to a fragment boundary and drops the
/// ones that fail validation.
///
/// The detector must be positioned at the fragment start. `limit` is the
/// fragment length; a record beginning before it is completed even when it
/// runs past, so [`bytes_consumed`](Self::bytes_consumed) may exceed `limit`.
pub struct StructuredRecordFramer<D, V> {
    detector: D,
    validator: V,
    limit: u64,
    skipped: u64,
    done: bool,
}

impl<D: BoundaryDetector, V: RecordValidator> StructuredRecordFramer<D, V> {
    pub fn new(detector: D, validator: V, limit: u64) -> Self {
        Self {
            detector,
            validator,
            limit,
            skipped: 0,
            done: false,
        }
    }

    /// Text of the next valid record owned by this fragment
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        while !self.done {
            let Some(raw) = self.detector.next_raw(self.limit)? else {
                self.done = true;
                break;
            };

            match self.validator.validate(&raw.text) {
                Ok(()) => return Ok(Some(raw.text)),
                Err(reason) => {
                    self.skipped += 1;
                    warn!(
                        offset = raw.start,
                        reason = %reason,
                        record = %String::from_utf8_lossy(&raw.text),
                        "Skipping record that failed to parse"
                    );
                },
            }
        }
        Ok(None)
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.detector.bytes_consumed()
    }

    /// `bytes_consumed / limit`, capped at 1
    pub fn progress(&self) -> f32 {
        if self.limit == 0 {
            return if self.done { 1.0 } else { 0.0 };
        }
        (self.bytes_consumed() as f32 / self.limit as f32).min(1.0)
    }

    /// Records dropped by the validator so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Settings for [`JsonRecordReader`]. Construction fails without an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonOptions {
    identifier: String,
}

impl JsonOptions {
    pub fn new(identifier: Option<&str>) -> Result<Self> {
        match identifier.map(str::trim) {
            Some(id) if !id.is_empty() => Ok(Self {
                identifier: id.to_string(),
            }),
            _ => Err(BatchioError::MissingRecordIdentifier {
                key: JSON_RECORD_IDENTIFIER_KEY,
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// One record per JSON object carrying the configured identifier key.
/// The key is the object's text and the value is the unit marker.
pub struct JsonRecordReader {
    path: PathBuf,
    framer: Option<StructuredRecordFramer<JsonBoundaryDetector<BufReader<File>>, JsonValidator>>,
    progress: f32,
}

impl FragmentReader for JsonRecordReader {
    type Options = JsonOptions;

    fn open(fragment: &FileFragment, options: &JsonOptions) -> Result<Self> {
        let mut file = File::open(&fragment.path)?;
        if fragment.start != 0 {
            file.seek(SeekFrom::Start(fragment.start))?;
        }

        let reader = BufReader::new(file);
        let detector = if fragment.start == 0 {
            JsonBoundaryDetector::new(reader, options.identifier())
        } else {
            JsonBoundaryDetector::resuming(reader, options.identifier())
        };
        Ok(Self {
            path: fragment.path.clone(),
            framer: Some(StructuredRecordFramer::new(detector, JsonValidator, fragment.length)),
            progress: 0.0,
        })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(framer) = self.framer.as_mut() else {
            return Ok(None);
        };
        let next = framer.next_record()?;
        self.progress = framer.progress();
        Ok(next.map(Record::key_only))
    }

    fn progress(&self) -> f32 {
        match &self.framer {
            Some(framer) => framer.progress(),
            None => self.progress,
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(framer) = self.framer.take() {
            self.progress = framer.progress();
            debug!(
                path = %self.path.display(),
                bytes = framer.bytes_consumed(),
                skipped = framer.skipped(),
                "Closed structured fragment"
            );
        }
        Ok(())
    }
}
