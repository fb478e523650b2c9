//! Incremental comparison.
//!
//! Pure function over the scan result and the prior `Snapshot`: no catalog
//! or filesystem access, so the boundary behaviors ("unchanged file is
//! dropped", "new file is kept", "size or mtime change is kept") are
//! directly unit-testable.

use std::collections::HashMap;
use std::path::Path;

use tbe_types::SnapshotFile;

use crate::checksum::relative_path;
use crate::scan::ScannedFile;

/// Keeps only the files in `scanned` that are absent from `baseline`, or
/// whose `size` differs, or whose `mtime` is strictly newer — per
/// "Checksums are not used for the diff (performance), but
/// are recomputed for included files."
pub fn filter_changed(
    source_root: &Path,
    scanned: Vec<ScannedFile>,
    baseline: &[SnapshotFile],
) -> Vec<ScannedFile> {
    let by_path: HashMap<&str, &SnapshotFile> =
        baseline.iter().map(|f| (f.path.as_str(), f)).collect();
    scanned
        .into_iter()
        .filter(|file| {
            let rel = relative_path(source_root, &file.path);
            match by_path.get(rel.as_str()) {
                None => true,
                Some(prior) => file.size != prior.size || file.mtime > prior.mtime,
            }
        })
        .collect()
}

/// Builds the next baseline snapshot from a full scan, for persisting via
/// `CatalogStore::save_snapshot` after a successful backup.
pub fn snapshot_from_scan(source_root: &Path, scanned: &[ScannedFile]) -> Vec<SnapshotFile> {
    scanned
        .iter()
        .map(|file| SnapshotFile {
            path: relative_path(source_root, &file.path),
            size: file.size,
            mtime: file.mtime,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn root() -> PathBuf {
        PathBuf::from("/src")
    }

    fn scanned(key: &str, size: u64, mtime: i64) -> ScannedFile {
        ScannedFile {
            path: format!("/src/{key}"),
            size,
            mode: 0o644,
            mtime,
        }
    }

    fn baseline(path: &str, size: u64, mtime: i64) -> SnapshotFile {
        SnapshotFile {
            path: path.to_string(),
            size,
            mtime,
        }
    }

    #[test]
    fn unchanged_file_is_dropped() {
        let scanned_files = vec![scanned("a", 10, 100)];
        let baseline = vec![baseline("a", 10, 100)];
        assert!(filter_changed(&root(), scanned_files, &baseline).is_empty());
    }

    #[test]
    fn new_file_is_kept() {
        let scanned_files = vec![scanned("c", 1, 1)];
        let result = filter_changed(&root(), scanned_files, &[]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn size_change_is_kept() {
        let scanned_files = vec![scanned("b", 20, 100)];
        let baseline = vec![baseline("b", 10, 100)];
        assert_eq!(filter_changed(&root(), scanned_files, &baseline).len(), 1);
    }

    #[test]
    fn newer_mtime_is_kept_but_older_is_not() {
        let baseline = vec![baseline("b", 10, 100)];
        assert_eq!(
            filter_changed(&root(), vec![scanned("b", 10, 101)], &baseline).len(),
            1
        );
        assert!(filter_changed(&root(), vec![scanned("b", 10, 99)], &baseline).is_empty());
    }

    #[test]
    fn snapshot_round_trips_relative_paths() {
        let scanned_files = vec![scanned("docs/a", 5, 42)];
        let snap = snapshot_from_scan(&root(), &scanned_files);
        assert_eq!(snap[0].path, "docs/a");
    }
}
