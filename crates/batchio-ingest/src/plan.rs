//! Split planning
//!
//! Packs physical files into logical units no larger than a target size,
//! cutting large files into fragments when the framing mode allows it.

use batchio_common::types::{FileFragment, LogicalUnit};
use std::path::{Path, PathBuf};

/// Partition `files` into logical units.
///
/// Files are visited in the order given. A file for which `splittable` holds
/// and that is longer than `max_unit_size` is cut into fragments of at most
/// that size; every other file is a single fragment. Fragments are packed greedily: a unit is closed
/// as soon as the next fragment would push it past the target. A fragment that
/// is larger than the target on its own gets a unit to itself.
///
/// `max_unit_size == 0` means no limit: everything lands in one unit.
pub fn plan_units<F>(files: &[(PathBuf, u64)], max_unit_size: u64, splittable: F) -> Vec<LogicalUnit>
where
    F: Fn(&Path) -> bool,
{
    let fragments = files.iter().flat_map(|(path, len)| {
        let chunk = if splittable(path) { max_unit_size } else { 0 };
        fragment_file(path, *len, chunk)
    });

    if max_unit_size == 0 {
        let unit: LogicalUnit = fragments.collect();
        return if unit.is_empty() { Vec::new() } else { vec![unit] };
    }

    let mut units = Vec::new();
    let mut current: Vec<FileFragment> = Vec::new();
    let mut current_len = 0u64;

    for fragment in fragments {
        if !current.is_empty() && current_len + fragment.length > max_unit_size {
            units.push(LogicalUnit::new(std::mem::take(&mut current)));
            current_len = 0;
        }
        current_len += fragment.length;
        current.push(fragment);
    }

    if !current.is_empty() {
        units.push(LogicalUnit::new(current));
    }

    units
}

fn fragment_file(path: &Path, len: u64, chunk: u64) -> Vec<FileFragment> {
    if chunk == 0 || len <= chunk {
        return vec![FileFragment::new(path, 0, len)];
    }

    let mut fragments = Vec::with_capacity(len.div_ceil(chunk) as usize);
    let mut start = 0;
    while start < len {
        let length = chunk.min(len - start);
        fragments.push(FileFragment::new(path, start, length));
        start += length;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(sizes: &[(&str, u64)]) -> Vec<(PathBuf, u64)> {
        sizes.iter().map(|(p, s)| (PathBuf::from(p), *s)).collect()
    }

    #[test]
    fn test_packs_small_files_together() {
        let units = plan_units(&files(&[("a", 100), ("b", 250), ("c", 400)]), 400, |_| true);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].len(), 2);
        assert_eq!(units[0].total_length(), 350);
        assert_eq!(units[1].total_length(), 400);
    }

    #[test]
    fn test_splittable_files_are_cut() {
        let units = plan_units(&files(&[("big", 1000)]), 300, |_| true);

        let fragments: Vec<_> = units.iter().flat_map(|u| u.fragments().to_vec()).collect();
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].start, 0);
        assert_eq!(fragments[3].start, 900);
        assert_eq!(fragments[3].length, 100);
        assert_eq!(units.iter().map(|u| u.total_length()).sum::<u64>(), 1000);
    }

    #[test]
    fn test_unsplittable_file_gets_its_own_unit() {
        let units = plan_units(&files(&[("a", 10), ("huge", 5000), ("b", 10)]), 100, |_| false);

        assert_eq!(units.len(), 3);
        assert_eq!(units[1].fragments()[0].length, 5000);
        assert_eq!(units[1].fragments()[0].start, 0);
    }

    #[test]
    fn test_zero_target_means_single_unit() {
        let units = plan_units(&files(&[("a", 10), ("b", 20)]), 0, |_| true);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].len(), 2);

        assert!(plan_units(&[], 0, |_| true).is_empty());
    }

    #[test]
    fn test_predicate_is_per_file() {
        let units = plan_units(
            &files(&[("plain.txt", 250), ("packed.gz", 250)]),
            100,
            |p| p.extension().is_none_or(|e| e != "gz"),
        );

        let gz: Vec<_> = units
            .iter()
            .flat_map(|u| u.fragments().iter())
            .filter(|f| f.path.ends_with("packed.gz"))
            .collect();
        assert_eq!(gz.len(), 1);
        assert_eq!(gz[0].length, 250);
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn test_order_is_preserved() {
        let units = plan_units(&files(&[("z", 1), ("a", 1), ("m", 1)]), 10, |_| true);
        let names: Vec<_> = units[0]
            .fragments()
            .iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }
}
