//! Source Scanner.
//!
//! Walks a source tree with a pool of at least 16 worker threads sharing a
//! work-stealing directory queue (a `crossbeam_channel` plus an
//! outstanding-work counter, rather than a single-threaded `walkdir` pass,
//! since a tape engine's sources are expected to be much larger trees than
//! a single-datastore chunk scan). Progress callbacks are throttled to at
//! most once per second; comparison against the previous `Snapshot` is
//! layered on top by the caller using `file_path`/`size`/`mtime` to decide
//! whether a file changed since last backup.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use crossbeam_channel::{unbounded, RecvTimeoutError};

use crate::patterns::{self, Pattern};

pub const MIN_SCAN_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanProgress {
    pub files_found: u64,
    pub dirs_scanned: u64,
    pub bytes_found: u64,
}

struct Throttle {
    last_fired: AtomicI64,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_fired: AtomicI64::new(0),
        }
    }

    fn should_fire(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let last = self.last_fired.load(Ordering::Relaxed);
        if now - last < 1_000_000_000 {
            return false;
        }
        self.last_fired
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

struct SharedState {
    files_found: AtomicU64,
    dirs_scanned: AtomicU64,
    bytes_found: AtomicU64,
    pending: AtomicU64,
    throttle: Throttle,
}

impl SharedState {
    fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            files_found: self.files_found.load(Ordering::Relaxed),
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            bytes_found: self.bytes_found.load(Ordering::Relaxed),
        }
    }
}

/// Walks `root`, returning every regular file not excluded and (if any
/// include pattern is set) matched by at least one include pattern.
///
/// `on_progress` is called from whichever worker thread happens to win the
/// throttle race; it must be `Send + Sync`-safe to invoke concurrently, so
/// callers typically wrap their real sink in a mutex or channel themselves.
pub fn scan_source(
    root: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
    workers: usize,
    cancel: Arc<AtomicBool>,
    on_progress: impl Fn(ScanProgress) + Send + Sync + 'static,
) -> Result<Vec<ScannedFile>> {
    let workers = workers.max(MIN_SCAN_WORKERS);
    let include = patterns::compile(include_patterns);
    let exclude = patterns::compile(exclude_patterns);

    let (dir_tx, dir_rx) = unbounded::<PathBuf>();
    let files: Arc<Mutex<Vec<ScannedFile>>> = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(SharedState {
        files_found: AtomicU64::new(0),
        dirs_scanned: AtomicU64::new(0),
        bytes_found: AtomicU64::new(0),
        pending: AtomicU64::new(1),
        throttle: Throttle::new(),
    });
    let on_progress = Arc::new(on_progress);

    dir_tx.send(root.to_path_buf())?;

    let mut handles = Vec::new();
    for _ in 0..workers {
        let dir_rx = dir_rx.clone();
        let dir_tx = dir_tx.clone();
        let files = Arc::clone(&files);
        let state = Arc::clone(&state);
        let cancel = Arc::clone(&cancel);
        let on_progress = Arc::clone(&on_progress);
        let include = include_patterns_clone(&include);
        let exclude = include_patterns_clone(&exclude);

        handles.push(std::thread::spawn(move || {
            worker_loop(dir_rx, dir_tx, files, state, cancel, on_progress, &include, &exclude);
        }));
    }
    drop(dir_tx);

    for handle in handles {
        let _ = handle.join();
    }

    let files = Arc::try_unwrap(files)
        .map_err(|_| anyhow::anyhow!("scan worker still holds a reference"))?
        .into_inner()
        .unwrap();
    Ok(files)
}

/// `Pattern` holds a compiled `Regex`, which isn't `Clone`-cheap to share
/// across worker closures via plain cloning of the enum; re-derive it once
/// per worker from the source strings instead.
fn include_patterns_clone(patterns: &[Pattern]) -> Vec<Pattern> {
    patterns
        .iter()
        .map(|p| match p {
            Pattern::Exact(s) => Pattern::Exact(s.clone()),
            Pattern::Glob(re) => Pattern::Glob(re.clone()),
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    dir_rx: crossbeam_channel::Receiver<PathBuf>,
    dir_tx: crossbeam_channel::Sender<PathBuf>,
    files: Arc<Mutex<Vec<ScannedFile>>>,
    state: Arc<SharedState>,
    cancel: Arc<AtomicBool>,
    on_progress: Arc<impl Fn(ScanProgress) + Send + Sync + 'static>,
    include: &[Pattern],
    exclude: &[Pattern],
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let dir = match dir_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(dir) => dir,
            Err(RecvTimeoutError::Timeout) => {
                if state.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        process_dir(&dir, &dir_tx, &files, &state, include, exclude);
        state.pending.fetch_sub(1, Ordering::SeqCst);

        if state.throttle.should_fire() {
            on_progress(state.snapshot());
        }
    }
}

fn process_dir(
    dir: &Path,
    dir_tx: &crossbeam_channel::Sender<PathBuf>,
    files: &Arc<Mutex<Vec<ScannedFile>>>,
    state: &Arc<SharedState>,
    include: &[Pattern],
    exclude: &[Pattern],
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("skipping unreadable directory {}: {err}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if patterns::any_matches(exclude, &name) {
            continue;
        }
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };

        if meta.is_dir() {
            state.pending.fetch_add(1, Ordering::SeqCst);
            if dir_tx.send(path).is_err() {
                state.pending.fetch_sub(1, Ordering::SeqCst);
            }
            continue;
        }

        if !meta.is_file() {
            continue;
        }
        if !include.is_empty() && !patterns::any_matches(include, &name) {
            continue;
        }

        let size = meta.size();
        let mtime = meta.mtime();
        let mode = meta.mode();
        state.files_found.fetch_add(1, Ordering::Relaxed);
        state.bytes_found.fetch_add(size, Ordering::Relaxed);
        files.lock().unwrap().push(ScannedFile {
            path: path.to_string_lossy().to_string(),
            size,
            mode,
            mtime,
        });
    }

    state.dirs_scanned.fetch_add(1, Ordering::Relaxed);
}
