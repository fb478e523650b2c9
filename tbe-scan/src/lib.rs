//! Source Scanner and Checksum Worker Pool.

mod checksum;
mod incremental;
mod parallel_handler;
mod patterns;
mod scan;

pub use checksum::{checksum_and_catalog, relative_path};
pub use incremental::{filter_changed, snapshot_from_scan};
pub use parallel_handler::ParallelHandler;
pub use scan::{scan_source, ScanProgress, ScannedFile, MIN_SCAN_WORKERS};
