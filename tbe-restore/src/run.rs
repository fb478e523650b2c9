//! Execute + verify .9 steps 3-4.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use openssl::sha::Sha256;

use tbe_catalog::CatalogStore;
use tbe_tape::{TapeDriver, DATA_FILE_START};
use tbe_types::{BackupSet, Compression, Id, PipelineKind, Tape};

use crate::plan::{build_plan, PlanStep};
use crate::RestoreNotifier;

pub struct RestoreRequest {
    pub job_id: Id,
    /// `None` restores the most recent completed backup set (and its full
    /// chain, if it's an incremental).
    pub target_backup_set_id: Option<Id>,
    /// Empty means every cataloged file.
    pub paths: Vec<String>,
    pub dest: PathBuf,
    pub passphrase: Option<Vec<u8>>,
    pub verify: bool,
}

#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub files_restored: u64,
    pub bytes_restored: u64,
    /// Per-file `"path: expected X, found Y"` messages. Non-empty does not
    /// mean the restore failed — a checksum mismatch is
    /// recorded but not terminal.
    pub checksum_errors: Vec<String>,
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finish();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    Ok(out)
}

fn verify_restored(dest: &Path, step: &PlanStep) -> Vec<String> {
    let mut errors = Vec::new();
    for entry in &step.entries {
        if entry.checksum.is_empty() {
            continue;
        }
        match hash_file(&dest.join(&entry.file_path)) {
            Ok(actual) if actual == entry.checksum => {}
            Ok(actual) => errors.push(format!(
                "{}: expected {}, found {actual}",
                entry.file_path, entry.checksum
            )),
            Err(err) => errors.push(format!("{}: {err}", entry.file_path)),
        }
    }
    errors
}

/// Blocks until the tape loaded in `device` carries `expected`'s label,
/// notifying once per wrong tape seen.9/§8 scenario 6.
fn wait_for_correct_tape<D: TapeDriver>(
    device: &mut D,
    expected: &Tape,
    notifier: &dyn RestoreNotifier,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut notified = false;
    loop {
        if cancel.load(Ordering::Relaxed) {
            anyhow::bail!("restore cancelled while waiting for tape {}", expected.label);
        }
        if device.is_loaded().unwrap_or(false) {
            if let Some(label) = tbe_tape::read_label(device)? {
                if label.uuid == expected.uuid {
                    return Ok(());
                }
                if !notified {
                    notifier.send_wrong_tape(&expected.label, &label.label);
                    notified = true;
                }
            }
        }
        thread::sleep(poll_interval);
    }
}

/// Executes one tape visit: waits for the right tape, positions the drive,
/// decodes the full pipeline into memory (so a decryption failure never
/// leaves a partially-extracted file on disk), then extracts only the
/// requested paths and optionally verifies them.
#[allow(clippy::too_many_arguments)]
fn execute_step<D: TapeDriver>(
    device: &mut D,
    tape: &Tape,
    backup_set: &BackupSet,
    step: &PlanStep,
    dest: &Path,
    passphrase: Option<&[u8]>,
    verify: bool,
    notifier: &dyn RestoreNotifier,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<RestoreOutcome> {
    wait_for_correct_tape(device, tape, notifier, poll_interval, cancel)?;

    match step.start_block {
        Some(block) if device.seek_to_block(block).is_ok() => {}
        _ => device
            .seek_to_file_mark(DATA_FILE_START)
            .context("positioning at the backup's data file")?,
    }

    let kind = PipelineKind::from_flags(
        if backup_set.compressed {
            backup_set.compression_type
        } else {
            Compression::None
        },
        backup_set.encrypted,
    );
    let raw = device.read_file();
    let mut pipeline =
        tbe_pipeline::build_reader(raw, kind, passphrase).context("building restore pipeline")?;
    let mut plaintext = Vec::new();
    pipeline
        .read_to_end(&mut plaintext)
        .context("decoding tape stream")?;
    drop(pipeline);

    let wanted: HashSet<&str> = step.entries.iter().map(|e| e.file_path.as_str()).collect();
    let mut archive = tar::Archive::new(&plaintext[..]);
    let mut files_restored = 0u64;
    let mut bytes_restored = 0u64;
    for entry in archive.entries().context("reading tar stream")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry
            .path()
            .context("reading tar entry path")?
            .to_string_lossy()
            .into_owned();
        if !wanted.contains(path.as_str()) {
            continue;
        }
        bytes_restored += entry.size();
        entry
            .unpack_in(dest)
            .with_context(|| format!("extracting {path}"))?;
        files_restored += 1;
    }

    let checksum_errors = if verify {
        verify_restored(dest, step)
    } else {
        Vec::new()
    };

    Ok(RestoreOutcome {
        files_restored,
        bytes_restored,
        checksum_errors,
    })
}

/// Resolves, plans and executes a full restore request over one drive
/// handle. The caller is responsible for loading each tape the plan needs
/// in sequence; `wait_for_correct_tape` polls until the right one appears.
pub fn run_restore<D: TapeDriver>(
    device: &mut D,
    store: &CatalogStore,
    notifier: &dyn RestoreNotifier,
    request: &RestoreRequest,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<RestoreOutcome> {
    std::fs::create_dir_all(&request.dest).context("creating restore destination")?;
    let plan = build_plan(
        store,
        request.job_id,
        request.target_backup_set_id,
        &request.paths,
    )?;

    let mut total = RestoreOutcome::default();
    for step in &plan.steps {
        let tape = store.get_tape(step.tape_id)?;
        let backup_set = store.get_backup_set(step.backup_set_id)?;
        let outcome = execute_step(
            device,
            &tape,
            &backup_set,
            step,
            &request.dest,
            request.passphrase.as_deref(),
            request.verify,
            notifier,
            poll_interval,
            cancel,
        )?;
        total.files_restored += outcome.files_restored;
        total.bytes_restored += outcome.bytes_restored;
        total.checksum_errors.extend(outcome.checksum_errors);
    }
    Ok(total)
}
