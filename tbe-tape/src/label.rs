//! Label and table-of-contents framing.
//!
//! The label occupies tape file 0. Backup data occupies files `1..N`, each
//! terminated by a file mark (matching 's restore
//! fallback `seek_to_file_mark(1)`, which assumes file 1 holds data, not a
//! TOC). The TOC is **not** pinned to a fixed file index:
//! Open Question (b) ("the TOC on the last file is written per backup
//! rather than accumulated; multiple TOCs may live on one tape with the
//! last being authoritative"), a TOC is appended as a new file immediately
//! after each backup's data (or after the last member of a spanning batch),
//! and a later backup on the same tape overwrites starting at that TOC's
//! position — extending the tape with new data followed by a fresh TOC.
//! `find_latest_toc` resolves this by scanning forward from file 1 and
//! keeping the last document that parses as a TOC, exactly the "last is
//! authoritative" rule the spec calls out.

use anyhow::{Context, Result};

use crate::device::TapeDriver;
use tbe_types::{TapeLabel, TapeOfContents};

pub const LABEL_FILE: u64 = 0;
pub const DATA_FILE_START: u64 = 1;

pub fn write_label<D: TapeDriver>(device: &mut D, label: &TapeLabel) -> Result<()> {
    device.rewind().context("rewinding before label write")?;
    let json = serde_json::to_vec(label)?;
    let mut writer = device.write_file();
    std::io::Write::write_all(&mut writer, &json)?;
    writer.finish()?;
    Ok(())
}

/// Returns `None` on a blank tape (first block carries no valid label).
pub fn read_label<D: TapeDriver>(device: &mut D) -> Result<Option<TapeLabel>> {
    device.rewind().context("rewinding before label read")?;
    let mut reader = device.read_file();
    let buf = match reader.read_to_end() {
        Ok(buf) => buf,
        Err(_) => return Ok(None),
    };
    if buf.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice(&buf) {
        Ok(label) => Ok(Some(label)),
        Err(_) => Ok(None),
    }
}

/// Writes a TOC as the file at the device's *current* position — the
/// caller has already positioned the drive just past the last data file of
/// the backup (or spanning batch) this TOC describes.
pub fn write_toc<D: TapeDriver>(device: &mut D, toc: &TapeOfContents) -> Result<()> {
    let json = serde_json::to_vec(toc)?;
    let mut writer = device.write_file();
    std::io::Write::write_all(&mut writer, &json)?;
    writer.finish()?;
    Ok(())
}

/// Reads the TOC at the file index the caller has already positioned to.
/// Used when the exact TOC position is already known (recorded at write
/// time), the fast path for a normal restore.
pub fn read_toc<D: TapeDriver>(device: &mut D) -> Result<Option<TapeOfContents>> {
    let mut reader = device.read_file();
    let buf = match reader.read_to_end() {
        Ok(buf) => buf,
        Err(_) => return Ok(None),
    };
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(serde_json::from_slice(&buf).ok())
}

/// Scans every file from `DATA_FILE_START` to end-of-medium, keeping the
/// last document that parses as a `TapeOfContents`. This is the disaster-
/// recovery path when the exact TOC file index wasn't recorded anywhere
/// else (catalog lost) —'s explicit call to make the
/// "last TOC wins" rule concrete rather than leave it implicit.
pub fn find_latest_toc<D: TapeDriver>(device: &mut D) -> Result<Option<TapeOfContents>> {
    device
        .seek_to_file_mark(DATA_FILE_START)
        .context("seeking to first data file")?;
    let mut latest = None;
    loop {
        let buf = {
            let mut reader = device.read_file();
            match reader.read_to_end() {
                Ok(buf) => buf,
                Err(_) => break,
            }
        };
        if buf.is_empty() {
            break;
        }
        if let Ok(toc) = serde_json::from_slice::<TapeOfContents>(&buf) {
            latest = Some(toc);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedTapeDevice, TapeDriver};
    use tbe_types::{BackupType, Compression, TocBackupSet, TocFileEntry};
    use uuid::Uuid;

    fn sample_label() -> TapeLabel {
        TapeLabel {
            label: "T1".to_string(),
            uuid: Uuid::new_v4(),
            pool: "daily".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    fn sample_toc(label: &TapeLabel, file_number: u64) -> TapeOfContents {
        TapeOfContents {
            tape: label.clone(),
            spanning_set_id: None,
            sequence_number: None,
            total_tapes: None,
            backup_sets: vec![TocBackupSet {
                file_number,
                job_name: "nightly".to_string(),
                backup_type: BackupType::Full,
                start_time: 1_700_000_000,
                end_time: Some(1_700_000_100),
                file_count: 1,
                total_bytes: 1024,
                encrypted: false,
                compressed: false,
                compression_type: Compression::None,
                files: vec![TocFileEntry {
                    path: "etc/passwd".to_string(),
                    size: 1024,
                    mode: 0o644,
                    mod_time: 1_700_000_000,
                    checksum: "abc".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn label_round_trips_on_simulated_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = SimulatedTapeDevice::open(dir.path(), 256).unwrap();
        let label = sample_label();
        write_label(&mut dev, &label).unwrap();
        let read_back = read_label(&mut dev).unwrap().expect("label present");
        assert_eq!(read_back.uuid, label.uuid);
        assert_eq!(read_back.pool, "daily");
    }

    #[test]
    fn blank_tape_has_no_label() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = SimulatedTapeDevice::open(dir.path(), 256).unwrap();
        assert!(read_label(&mut dev).unwrap().is_none());
    }

    #[test]
    fn toc_follows_data_as_the_trailing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = SimulatedTapeDevice::open(dir.path(), 256).unwrap();
        let label = sample_label();
        write_label(&mut dev, &label).unwrap();

        dev.seek_to_file_mark(DATA_FILE_START).unwrap();
        {
            let mut writer = dev.write_file();
            std::io::Write::write_all(&mut writer, b"fake tar payload bytes").unwrap();
            writer.finish().unwrap();
        }
        let toc = sample_toc(&label, DATA_FILE_START);
        write_toc(&mut dev, &toc).unwrap();

        dev.seek_to_file_mark(DATA_FILE_START + 1).unwrap();
        let read_back = read_toc(&mut dev).unwrap().expect("toc present");
        assert_eq!(read_back.tape.uuid, label.uuid);
        assert_eq!(read_back.backup_sets[0].files.len(), 1);
    }

    #[test]
    fn find_latest_toc_prefers_the_last_one_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = SimulatedTapeDevice::open(dir.path(), 256).unwrap();
        let label = sample_label();
        write_label(&mut dev, &label).unwrap();

        // First backup: data at file 1, TOC at file 2.
        dev.seek_to_file_mark(DATA_FILE_START).unwrap();
        {
            let mut writer = dev.write_file();
            std::io::Write::write_all(&mut writer, b"first backup payload").unwrap();
            writer.finish().unwrap();
        }
        write_toc(&mut dev, &sample_toc(&label, DATA_FILE_START)).unwrap();

        // Second backup overwrites starting at the old TOC's position:
        // new data at file 2, new TOC at file 3.
        dev.seek_to_file_mark(DATA_FILE_START + 1).unwrap();
        {
            let mut writer = dev.write_file();
            std::io::Write::write_all(&mut writer, b"second backup payload").unwrap();
            writer.finish().unwrap();
        }
        let mut second_toc = sample_toc(&label, DATA_FILE_START + 1);
        second_toc.backup_sets[0].job_name = "second".to_string();
        write_toc(&mut dev, &second_toc).unwrap();

        let latest = find_latest_toc(&mut dev).unwrap().expect("a toc exists");
        assert_eq!(latest.backup_sets[0].job_name, "second");
    }
}
