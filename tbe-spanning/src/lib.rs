//! Spanning Coordinator and Tape Allocator.
//!
//! Grounded on the teacher's `src/tape/pool_writer/mod.rs` and
//! `src/tape/media_pool.rs`: batches a file list to fit the tape currently
//! loaded, streams it through the transform pipeline onto tape, and —
//! should the batch run out of tape before it runs out of files — ejects,
//! allocates a replacement from the same pool, waits for the operator to
//! confirm it, and continues.

mod allocator;
mod batch;
mod coordinator;
mod writer;

pub use allocator::allocate_tape;
pub use batch::{plan_batch, BatchPlan, CAPACITY_RESERVE_PCT, PER_FILE_OVERHEAD};
pub use coordinator::{
    run_spanning, LoggingTapeChangeNotifier, SpanningJob, SpanningResult, TapeChangeNotifier,
};
pub use writer::{write_batch, WriteResult, WrittenFile};
