//! Whole-file framer

use batchio_common::types::{FileFragment, Record};
use batchio_common::{BatchioError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::debug;

use super::FragmentReader;

/// Largest fragment read into memory by default
pub const DEFAULT_MAX_LEN: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WholeFileOptions {
    pub max_len: u64,
}

impl Default for WholeFileOptions {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_LEN,
        }
    }
}

/// Emits one record per fragment: the canonical path as key and the
/// fragment's bytes as value.
pub struct WholeFileReader {
    fragment: FileFragment,
    key: Vec<u8>,
    processed: bool,
}

impl FragmentReader for WholeFileReader {
    type Options = WholeFileOptions;

    fn open(fragment: &FileFragment, options: &WholeFileOptions) -> Result<Self> {
        if fragment.length > options.max_len {
            return Err(BatchioError::FileTooLarge {
                path: fragment.path.clone(),
                length: fragment.length,
                limit: options.max_len,
            });
        }

        let qualified: PathBuf = std::fs::canonicalize(&fragment.path)?;
        Ok(Self {
            fragment: fragment.clone(),
            key: qualified.to_string_lossy().into_owned().into_bytes(),
            processed: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.processed {
            return Ok(None);
        }

        let mut file = File::open(&self.fragment.path)?;
        if self.fragment.start != 0 {
            file.seek(SeekFrom::Start(self.fragment.start))?;
        }

        let mut contents = Vec::with_capacity(self.fragment.length as usize);
        file.take(self.fragment.length).read_to_end(&mut contents)?;
        self.processed = true;

        debug!(path = %self.fragment.path.display(), bytes = contents.len(), "Read whole file");
        Ok(Some(Record::with_value(self.key.clone(), contents)))
    }

    fn progress(&self) -> f32 {
        if self.processed {
            1.0
        } else {
            0.0
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
