//! Capacity-fitting for a spanning batch.
//!
//! Pure function, no device or catalog I/O, so the boundary behaviors in
//! `spec.md` §8 are directly testable: "a tape with `remaining_capacity <
//! any single file's size + 1 KiB` yields an empty batch and forces
//! immediate tape change."

use tbe_scan::ScannedFile;

/// Capped per-file overhead for tar headers and alignment padding, per
/// "a capped overhead of ~1 KiB per file".
pub const PER_FILE_OVERHEAD: u64 = 1024;

/// Fraction of capacity held back for the trailing TOC and file marks, per
/// "a 1% capacity reserve for tar headers, file marks and
/// TOC".
pub const CAPACITY_RESERVE_PCT: u64 = 1;

pub struct BatchPlan {
    pub batch: Vec<ScannedFile>,
    pub tail: Vec<ScannedFile>,
}

/// Splits `files` into a prefix that fits within `remaining_capacity` and a
/// tail that doesn't.6 step 0 (implied by "partitions the
/// remaining file list into a batch that fits ... and a tail").
pub fn plan_batch(files: Vec<ScannedFile>, remaining_capacity: u64) -> BatchPlan {
    let reserve = remaining_capacity / 100 * CAPACITY_RESERVE_PCT;
    let usable = remaining_capacity.saturating_sub(reserve);

    let mut running = 0u64;
    let mut split_at = files.len();
    for (i, file) in files.iter().enumerate() {
        let cost = file.size.saturating_add(PER_FILE_OVERHEAD);
        if running.saturating_add(cost) > usable {
            split_at = i;
            break;
        }
        running = running.saturating_add(cost);
    }

    let mut files = files;
    let tail = files.split_off(split_at);
    BatchPlan { batch: files, tail }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64) -> ScannedFile {
        ScannedFile {
            path: format!("/src/f{size}"),
            size,
            mode: 0o644,
            mtime: 0,
        }
    }

    #[test]
    fn everything_fits_when_capacity_is_generous() {
        let files = vec![file(10), file(20), file(30)];
        let plan = plan_batch(files, 1_000_000);
        assert_eq!(plan.batch.len(), 3);
        assert!(plan.tail.is_empty());
    }

    #[test]
    fn splits_when_capacity_runs_out_partway() {
        // Each file costs size + 1024. Capacity of 3000 (reserve ~30) means
        // usable ~2970, fitting two ~1124-byte files but not a third.
        let files = vec![file(100), file(100), file(100)];
        let plan = plan_batch(files, 3_000);
        assert_eq!(plan.batch.len(), 2);
        assert_eq!(plan.tail.len(), 1);
    }

    #[test]
    fn remaining_capacity_below_one_file_plus_overhead_yields_empty_batch() {
        let files = vec![file(5_000)];
        let plan = plan_batch(files, 1_000);
        assert!(plan.batch.is_empty());
        assert_eq!(plan.tail.len(), 1);
    }

    #[test]
    fn zero_files_yields_empty_batch_and_empty_tail() {
        let plan = plan_batch(Vec::new(), 1_000_000);
        assert!(plan.batch.is_empty());
        assert!(plan.tail.is_empty());
    }
}
