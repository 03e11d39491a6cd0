//! Data model shared by the planner, the readers and the sink

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// A contiguous byte range of one physical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFragment {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
}

impl FileFragment {
    pub fn new(path: impl Into<PathBuf>, start: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            start,
            length,
        }
    }

    /// Offset one past the last byte owned by this fragment
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for FileFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.path.display(), self.start, self.length)
    }
}

/// An ordered group of fragments processed by one task as a single stream.
///
/// Order is significant: readers traverse fragments exactly as listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalUnit {
    fragments: Vec<FileFragment>,
}

impl LogicalUnit {
    pub fn new(fragments: Vec<FileFragment>) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &[FileFragment] {
        &self.fragments
    }

    pub fn fragment(&self, index: usize) -> Option<&FileFragment> {
        self.fragments.get(index)
    }

    /// Number of fragments
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Sum of all fragment lengths in bytes
    pub fn total_length(&self) -> u64 {
        self.fragments.iter().map(|f| f.length).sum()
    }
}

impl FromIterator<FileFragment> for LogicalUnit {
    fn from_iter<I: IntoIterator<Item = FileFragment>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A record produced by a fragment reader.
///
/// Every call to a reader returns a freshly allocated record; callers may keep
/// it for as long as they like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw key bytes: line content, document text or a qualified file path
    pub key: Vec<u8>,
    /// `None` is the unit marker used by line and document readers
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// Record carrying only a key
    pub fn key_only(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn with_value(key: impl Into<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    /// Key as text. Invalid UTF-8 sequences are replaced.
    pub fn key_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}
