//! Tape Controller: device positioning, block framing, label and TOC I/O.
//!
//! Grounded on the teacher's `pbs-tape` crate (`src/tape/drive/mod.rs`,
//! `linux_mtio.rs`, `blocked_reader.rs`, `blocked_writer.rs`) per
//! `spec.md` §4.1.

pub mod blocked;
pub mod device;
pub mod label;
pub mod mtio;

pub use blocked::{BlockDevice, BlockReadError, BlockedReader, BlockedWriter};
pub use device::{DriveState, LinuxTapeDevice, SimulatedTapeDevice, TapeDriver, TapePosition};
pub use label::{
    find_latest_toc, read_label, read_toc, write_label, write_toc, DATA_FILE_START, LABEL_FILE,
};
