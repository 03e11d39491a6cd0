//! Byte census over input paths
//!
//! Sums file sizes under a set of paths (directories are walked recursively)
//! so the planner can derive an even per-unit target size.

use batchio_common::{BatchioError, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every regular file under `paths`, with its length, sorted by path.
///
/// A path naming a file is returned as-is; a directory contributes every file
/// found by recursive descent. Symbolic links are not followed.
pub fn list_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();

    for root in paths {
        for entry in WalkDir::new(root.as_ref()).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                BatchioError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected")),
                )
            })?;

            if entry.file_type().is_file() {
                let length = entry.metadata().map_err(|e| {
                    BatchioError::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
                    )
                })?;
                files.push((entry.into_path(), length.len()));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Total bytes under `paths`
pub fn total_bytes<P: AsRef<Path>>(paths: &[P]) -> Result<u64> {
    Ok(list_files(paths)?.iter().map(|(_, len)| len).sum())
}

/// `floor(total_bytes / target_unit_count)`.
///
/// Fails with [`BatchioError::InvalidUnitCount`] when the count is not positive.
pub fn ideal_fragment_size<P: AsRef<Path>>(paths: &[P], target_unit_count: i64) -> Result<u64> {
    if target_unit_count <= 0 {
        return Err(BatchioError::InvalidUnitCount(target_unit_count));
    }

    let total = total_bytes(paths)?;
    let size = total / target_unit_count as u64;

    tracing::debug!(total_bytes = total, target_unit_count, size, "Computed ideal fragment size");
    Ok(size)
}
