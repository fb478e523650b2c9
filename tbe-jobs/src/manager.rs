//! Job Lifecycle Manager.
//!
//! Owns a tree of running jobs with cancellation context and progress
//! snapshotting, handing the streaming phase off to
//! [`tbe_spanning::run_spanning`]. Owns exactly one [`JobHandle`] per job id
//! at a time — a second `start` for an already-running job is rejected
//! rather than queued.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use tbe_catalog::CatalogStore;
use tbe_tape::TapeDriver;
use tbe_types::{BackupSetStatus, BackupType, Id, JobPhase, PipelineKind, ResumeState, TapeLabel};

use crate::events::EventBus;
use crate::notification::NotificationSender;
use crate::progress::JobProgress;

/// Ambient engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub block_size: usize,
    pub buffer_size_mb: usize,
    pub checksum_workers: usize,
    pub tape_ready_timeout: Duration,
    pub tape_change_poll_interval: Duration,
    /// `job.encryption_key_id` → passphrase. Resolved at backup/restore
    /// time; never logged.
    pub encryption_keys: HashMap<String, Vec<u8>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 512 * 1024,
            buffer_size_mb: 32,
            checksum_workers: num_cpus(),
            tape_ready_timeout: Duration::from_secs(30),
            tape_change_poll_interval: Duration::from_secs(5),
            encryption_keys: HashMap::new(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Adapts the manager's own [`NotificationSender`] to the independent
/// notifier trait `tbe-spanning` defines, so `tbe-spanning` never has to
/// depend back on this crate.
struct NotifierAdapter<'a>(&'a dyn NotificationSender);

impl tbe_spanning::TapeChangeNotifier for NotifierAdapter<'_> {
    fn send_tape_change_required(
        &self,
        job_name: &str,
        current_label: &str,
        reason: &str,
        expected_next_label: Option<&str>,
    ) {
        self.0
            .send_tape_change_required(job_name, current_label, reason, expected_next_label);
    }

    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str) {
        self.0.send_wrong_tape(expected_label, actual_label);
    }
}

/// Handle to one in-flight job execution: the cancel/pause flags a
/// `JobManager` method call flips, and the progress snapshot reads return.
pub struct JobHandle {
    pub execution_id: Id,
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    progress: Arc<Mutex<JobProgress>>,
}

/// Coordinates one backup job's lifecycle: scan, checksum, stream to tape
/// (delegating multi-tape handling to the Spanning Coordinator), catalog,
/// and finalize — while tracking cancellation, pause and live progress.
pub struct JobManager {
    store: Arc<CatalogStore>,
    events: Arc<EventBus>,
    notifier: Arc<dyn NotificationSender>,
    config: EngineConfig,
    active: Mutex<HashMap<Id, Arc<JobHandle>>>,
}

impl JobManager {
    pub fn new(
        store: Arc<CatalogStore>,
        events: Arc<EventBus>,
        notifier: Arc<dyn NotificationSender>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self, job_id: Id) -> Option<JobProgress> {
        let active = self.active.lock().unwrap();
        active.get(&job_id).map(|h| h.progress.lock().unwrap().clone())
    }

    /// Reports whether `job_id` is currently running. A scheduler consults
    /// this before each dispatch so a job already in flight is not
    /// re-dispatched.
    pub fn is_active(&self, job_id: Id) -> bool {
        self.active.lock().unwrap().contains_key(&job_id)
    }

    /// Requests cancellation of a running job. A no-op (returns `false`) if
    /// the job isn't currently active.
    pub fn cancel(&self, job_id: Id) -> bool {
        let active = self.active.lock().unwrap();
        match active.get(&job_id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, job_id: Id) -> bool {
        let active = self.active.lock().unwrap();
        match active.get(&job_id) {
            Some(handle) => {
                handle.pause.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn resume(&self, job_id: Id) -> bool {
        let active = self.active.lock().unwrap();
        match active.get(&job_id) {
            Some(handle) => {
                handle.pause.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Runs one execution of `job_id` to completion on the calling thread.
    /// Rejects a second concurrent start for the same job.
    pub fn run_job<D: TapeDriver>(&self, job_id: Id, device: &mut D) -> Result<()> {
        {
            let active = self.active.lock().unwrap();
            if active.contains_key(&job_id) {
                bail!("job {job_id} is already running");
            }
        }

        let job = self.store.get_job(job_id)?;
        let source = self.store.get_source(job.source_id)?;
        let execution_id = self.store.create_job_execution(job_id)?;

        let started_at = now_unix();
        let handle = Arc::new(JobHandle {
            execution_id,
            cancel: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(JobProgress::new(job_id, execution_id, started_at))),
        });
        self.active.lock().unwrap().insert(job_id, Arc::clone(&handle));

        let result = self.run_job_inner(&job, &source, execution_id, &handle, device);

        self.active.lock().unwrap().remove(&job_id);

        match &result {
            Ok(()) => {
                self.store
                    .update_job_execution_status(execution_id, JobPhase::Completed, None)?;
                self.events.emit(
                    tbe_types::EventKind::Success,
                    "job",
                    &job.name,
                    "backup completed",
                    now_unix(),
                );
            }
            Err(err) if err.to_string().contains("cancelled") => {
                self.store.update_job_execution_status(
                    execution_id,
                    JobPhase::Cancelled,
                    Some(&err.to_string()),
                )?;
                self.events.emit(
                    tbe_types::EventKind::Info,
                    "job",
                    &job.name,
                    "backup cancelled",
                    now_unix(),
                );
            }
            Err(err) => {
                self.store.update_job_execution_status(
                    execution_id,
                    JobPhase::Failed,
                    Some(&err.to_string()),
                )?;
                self.events.emit(
                    tbe_types::EventKind::Error,
                    "job",
                    &job.name,
                    &err.to_string(),
                    now_unix(),
                );
            }
        }

        result
    }

    fn set_phase(&self, handle: &JobHandle, phase: JobPhase) {
        let mut progress = handle.progress.lock().unwrap();
        progress.phase = phase;
        progress.updated_at = now_unix();
        progress.push_log(progress.updated_at, format!("{phase:?}"));
    }

    fn run_job_inner<D: TapeDriver>(
        &self,
        job: &tbe_types::Job,
        source: &tbe_types::Source,
        execution_id: Id,
        handle: &JobHandle,
        device: &mut D,
    ) -> Result<()> {
        // Resolve the encryption key before streaming starts: an encrypted
        // job with no resolvable key must fail here, not mid-stream after
        // tape has already been claimed.
        let passphrase = if job.encryption_enabled {
            let key_id = job.encryption_key_id.as_deref().ok_or_else(|| {
                anyhow::anyhow!("job {} has encryption enabled but no encryption_key_id", job.name)
            })?;
            Some(
                self.config
                    .encryption_keys
                    .get(key_id)
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "job {} references unknown encryption key {key_id:?}",
                            job.name
                        )
                    })?
                    .clone(),
            )
        } else {
            None
        };

        self.set_phase(handle, JobPhase::Scanning);
        let cancel = Arc::clone(&handle.cancel);
        let progress_for_scan = Arc::clone(&handle.progress);
        let files = tbe_scan::scan_source(
            Path::new(&source.path),
            &source.include_patterns,
            &source.exclude_patterns,
            tbe_scan::MIN_SCAN_WORKERS,
            cancel,
            move |scan_progress| {
                let mut progress = progress_for_scan.lock().unwrap();
                progress.total_files = scan_progress.files_found;
                progress.total_bytes = scan_progress.bytes_found;
                progress.updated_at = now_unix();
            },
        )?;
        if handle.cancel.load(Ordering::Relaxed) {
            bail!("job cancelled during scan");
        }

        // Incremental comparison: diff against the source's latest
        // snapshot, keeping only files that are new, resized, or newer.
        // The full scan result (before filtering) becomes the next
        // snapshot once this run completes.
        let full_scan = files;
        let (mut files, parent_set_id) = if job.backup_type == BackupType::Incremental {
            let snapshot = self
                .store
                .latest_snapshot(job.source_id)?
                .ok_or_else(|| {
                    anyhow::anyhow!("no baseline snapshot for incremental job {}", job.name)
                })?;
            let changed = tbe_scan::filter_changed(
                Path::new(&source.path),
                full_scan.clone(),
                &snapshot.snapshot_data,
            );
            (changed, Some(snapshot.backup_set_id))
        } else {
            (full_scan.clone(), None)
        };

        // Resume: a prior execution of this job may have crashed mid-pause,
        // leaving a `JobExecution` with `status=paused` and a resume
        // checkpoint behind. Subtract the paths it already streamed to
        // tape via an exact-match set — `spec.md` §4.5 "Resume replays
        // ScanSource... and continues".
        let resumed_from = self.store.find_resumable_execution(job.id)?;
        if let Some(prev) = &resumed_from {
            if let Some(resume_state) = &prev.resume_state {
                let processed: std::collections::HashSet<&str> = resume_state
                    .files_processed
                    .iter()
                    .map(|s| s.as_str())
                    .collect();
                files.retain(|f| {
                    let rel = tbe_scan::relative_path(Path::new(&source.path), &f.path);
                    !processed.contains(rel.as_str())
                });
            }
        }
        {
            let mut progress = handle.progress.lock().unwrap();
            progress.total_files = files.len() as u64;
            progress.total_bytes = files.iter().map(|f| f.size).sum();
        }

        self.set_phase(handle, JobPhase::Positioning);
        let tape = tbe_spanning::allocate_tape(&self.store, job.pool_id, &[])
            .context("allocating initial tape")?;

        position_tape(device, &self.store, &tape, &self.config.tape_ready_timeout)?;

        self.set_phase(handle, JobPhase::Streaming);
        let spanning_set_id = self.store.create_spanning_set(execution_id)?;
        let kind = PipelineKind::from_flags(job.compression, job.encryption_enabled);
        let spanning_job = tbe_spanning::SpanningJob {
            job_name: &job.name,
            job_id: job.id,
            pool_id: job.pool_id,
            backup_type: job.backup_type,
            kind,
            passphrase: passphrase.as_deref(),
            compression: job.compression,
            encrypted: job.encryption_enabled,
            checksum_workers: self.config.checksum_workers,
            parent_set_id,
        };
        let notifier = NotifierAdapter(self.notifier.as_ref());

        let spanning_result = tbe_spanning::run_spanning(
            device,
            &self.store,
            &notifier,
            &spanning_job,
            spanning_set_id,
            tape,
            Path::new(&source.path),
            files,
            self.config.tape_change_poll_interval,
            self.config.tape_ready_timeout,
            &handle.cancel,
            &handle.pause,
            execution_id,
        );

        let spanning_result = match spanning_result {
            Ok(result) => result,
            Err(err) => {
                self.store
                    .finish_spanning_set(spanning_set_id, BackupSetStatus::Failed)?;
                return Err(err);
            }
        };

        self.store
            .finish_spanning_set(spanning_set_id, BackupSetStatus::Completed)?;
        if let Some(&last_backup_set_id) = spanning_result.backup_set_ids.last() {
            self.store
                .set_job_execution_backup_set(execution_id, last_backup_set_id)?;
            // The next incremental diffs against everything seen in this
            // run, not just the files this run actually wrote.
            self.store.save_snapshot(&tbe_types::Snapshot {
                source_id: job.source_id,
                backup_set_id: last_backup_set_id,
                file_count: full_scan.len() as u64,
                total_bytes: full_scan.iter().map(|f| f.size).sum(),
                snapshot_data: tbe_scan::snapshot_from_scan(Path::new(&source.path), &full_scan),
            })?;
        }
        self.store.update_job_execution_progress(
            execution_id,
            spanning_result.total_files,
            spanning_result.total_bytes,
        )?;
        self.store.clear_resume_state(execution_id)?;
        if let Some(prev) = resumed_from {
            // The checkpoint this run resumed from is now fully subsumed.
            self.store.clear_resume_state(prev.id)?;
            self.store
                .update_job_execution_status(prev.id, JobPhase::Completed, None)?;
        }

        self.set_phase(handle, JobPhase::Completed);
        Ok(())
    }
}

/// Verifies (or, for a blank tape, writes) the label and seeks past it to
/// position for streaming data.
fn position_tape<D: TapeDriver>(
    device: &mut D,
    store: &CatalogStore,
    tape: &tbe_types::Tape,
    tape_ready_timeout: &Duration,
) -> Result<()> {
    device
        .wait_ready(*tape_ready_timeout)
        .context("waiting for initial tape to load")?;
    match tbe_tape::read_label(device)? {
        Some(label) if label.uuid == tape.uuid => {}
        Some(label) => {
            bail!(
                "wrong tape loaded: expected {} but found {}",
                tape.label,
                label.label
            );
        }
        None => {
            let pool = store.get_pool(tape.pool_id)?;
            tbe_tape::write_label(
                device,
                &TapeLabel {
                    label: tape.label.clone(),
                    uuid: tape.uuid,
                    pool: pool.name,
                    timestamp: now_unix(),
                },
            )?;
        }
    }
    device.seek_to_file_mark(tbe_tape::DATA_FILE_START)?;
    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
