//! Checksum Worker Pool.
//!
//! One `ParallelHandler` worker per CPU hashes scanned files with
//! `openssl::sha::Sha256`, batching `NewCatalogEntry` rows into the catalog
//! every ~500 files so a single slow tape write doesn't leave thousands of
//! rows unflushed in memory.

use std::fs::File;
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use openssl::sha::Sha256;

use tbe_catalog::{CatalogStore, NewCatalogEntry};
use tbe_types::Id;

use crate::parallel_handler::ParallelHandler;
use crate::scan::ScannedFile;

const BATCH_SIZE: usize = 500;
const READ_CHUNK: usize = 256 * 1024;

fn hash_file(path: &str) -> Option<String> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            log::warn!("checksum worker could not open {path}: {err}");
            return None;
        }
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(err) => {
                log::warn!("checksum worker failed reading {path}: {err}");
                return None;
            }
        }
    }
    Some(hex_encode(hasher.finish()))
}

/// Strips `root` from an absolute scanned path, falling back to the
/// original string if it somehow isn't a descendant (e.g. a symlink the
/// scanner followed outside the source tree).
pub fn relative_path(root: &std::path::Path, absolute: &str) -> String {
    match std::path::Path::new(absolute).strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => absolute.to_string(),
    }
}

fn hex_encode(bytes: [u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

struct Batcher {
    store: Arc<CatalogStore>,
    backup_set_id: Id,
    pending: Mutex<Vec<NewCatalogEntry>>,
}

impl Batcher {
    fn push(&self, entry: NewCatalogEntry) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        pending.push(entry);
        if pending.len() >= BATCH_SIZE {
            let batch = std::mem::take(&mut *pending);
            drop(pending);
            self.store.insert_entries_batch(self.backup_set_id, &batch)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut *pending);
        drop(pending);
        self.store.insert_entries_batch(self.backup_set_id, &batch)
    }
}

/// Hashes every scanned file and writes catalog entries for `backup_set_id`.
/// Files that vanished or failed to read are still cataloged, with an empty
/// checksum — a missing file must not silently drop out of the catalog.
///
/// `source_root` is stripped from each `ScannedFile.path` before it is
/// stored: `CatalogEntry.file_path` must be relative (it is also the name
/// written into tar entries, so restore can replay it under any
/// destination directory). Hashing still opens the original absolute path
/// on disk.
pub fn checksum_and_catalog(
    store: Arc<CatalogStore>,
    backup_set_id: Id,
    source_root: &std::path::Path,
    files: Vec<ScannedFile>,
    workers: usize,
) -> Result<u64> {
    let workers = workers.max(1);
    let batcher = Arc::new(Batcher {
        store,
        backup_set_id,
        pending: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
    });
    let processed = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let source_root = source_root.to_owned();

    let batcher_for_handler = Arc::clone(&batcher);
    let processed_for_handler = Arc::clone(&processed);
    let handler = ParallelHandler::new("checksum-worker", workers, move |file: ScannedFile| {
        let checksum = hash_file(&file.path).unwrap_or_default();
        let relative = relative_path(&source_root, &file.path);
        batcher_for_handler.push(NewCatalogEntry {
            file_path: relative,
            file_size: file.size,
            file_mode: file.mode,
            mod_time: file.mtime,
            checksum,
        })?;
        processed_for_handler.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    });

    for file in files {
        handler.send(file)?;
    }
    handler.complete()?;
    batcher.flush()?;

    Ok(processed.load(std::sync::atomic::Ordering::Relaxed))
}
