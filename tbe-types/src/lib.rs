//! Shared data model for the tape backup engine.
//!
//! These are plain serde structs mirroring the catalog schema (see
//! `tbe-catalog`) — no API schema macros, since the HTTP surface is out of
//! scope for this engine.

use serde::{Deserialize, Serialize};

pub type Id = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeStatus {
    Blank,
    Active,
    Full,
    Retired,
    Exported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    Continue,
    FillFirst,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    Ready,
    Busy,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Lto,
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupSetStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeChangeStatus {
    Pending,
    Completed,
    Cancelled,
}

/// Job lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Initializing,
    Scanning,
    Positioning,
    Streaming,
    Waiting,
    Paused,
    Cataloging,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tape {
    pub id: Id,
    pub uuid: uuid::Uuid,
    pub label: String,
    pub barcode: Option<String>,
    pub pool_id: Id,
    pub status: TapeStatus,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub write_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub offsite_location: Option<String>,
    pub encryption_key_fingerprint: Option<String>,
}

impl Tape {
    /// `used_bytes <= capacity_bytes`.
    pub fn remaining_capacity(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: Id,
    pub name: String,
    pub retention_days: u32,
    pub allow_reuse: bool,
    pub allocation_policy: AllocationPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub id: Id,
    pub device_path: String,
    pub display_name: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub status: DriveStatus,
    pub enabled: bool,
    pub current_tape_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Id,
    pub name: String,
    pub source_type: String,
    pub path: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub name: String,
    pub source_id: Id,
    pub pool_id: Id,
    pub backup_type: BackupType,
    pub schedule_cron: String,
    pub retention_days: u32,
    pub compression: Compression,
    pub encryption_enabled: bool,
    pub encryption_key_id: Option<String>,
    pub enabled: bool,
    pub last_run_at: Option<i64>,
    pub next_run_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: Id,
    pub job_id: Id,
    pub tape_id: Id,
    pub backup_type: BackupType,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: BackupSetStatus,
    pub file_count: u64,
    pub total_bytes: u64,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub checksum: Option<String>,
    pub encrypted: bool,
    pub encryption_key_id: Option<String>,
    pub compressed: bool,
    pub compression_type: Compression,
    pub parent_set_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Id,
    pub backup_set_id: Id,
    pub file_path: String,
    pub file_size: u64,
    pub file_mode: u32,
    pub mod_time: i64,
    pub checksum: String,
    /// Byte offset of this file's tar header within the (post-transform)
    /// tape-file stream, `Some` only for `PipelineKind::Plain` — not a tape
    /// block index; restore seeks by `BackupSet.start_block` instead, never
    /// by this field.
    pub block_offset: Option<u64>,
}

/// One row of `Snapshot.snapshot_data` — the incremental baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub source_id: Id,
    pub backup_set_id: Id,
    pub file_count: u64,
    pub total_bytes: u64,
    pub snapshot_data: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub files_processed: Vec<String>,
    pub bytes_written: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub tape_id: Id,
    pub backup_set_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Id,
    pub job_id: Id,
    pub backup_set_id: Option<Id>,
    pub status: JobPhase,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub resume_state: Option<ResumeState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanningSet {
    pub id: Id,
    pub job_execution_id: Id,
    pub status: BackupSetStatus,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanningMember {
    pub id: Id,
    pub spanning_set_id: Id,
    pub sequence_number: u32,
    pub tape_id: Id,
    pub backup_set_id: Id,
    pub files_start_index: u64,
    pub files_end_index: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeChangeRequest {
    pub id: Id,
    pub spanning_set_id: Id,
    pub current_tape_id: Id,
    pub new_tape_id: Option<Id>,
    pub reason: String,
    pub status: TapeChangeStatus,
    pub requested_at: i64,
    pub completed_at: Option<i64>,
}

/// Tagged variant for the Pipeline Builder, per Design Note §9 — data, not
/// four near-identical execution paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineKind {
    Plain,
    Compress(Compression),
    Encrypt,
    CompressEncrypt(Compression),
}

impl PipelineKind {
    pub fn from_flags(compression: Compression, encrypt: bool) -> Self {
        match (compression, encrypt) {
            (Compression::None, false) => PipelineKind::Plain,
            (Compression::None, true) => PipelineKind::Encrypt,
            (c, false) => PipelineKind::Compress(c),
            (c, true) => PipelineKind::CompressEncrypt(c),
        }
    }

    pub fn compresses(self) -> bool {
        matches!(
            self,
            PipelineKind::Compress(_) | PipelineKind::CompressEncrypt(_)
        )
    }

    pub fn encrypts(self) -> bool {
        matches!(self, PipelineKind::Encrypt | PipelineKind::CompressEncrypt(_))
    }
}

/// File 0 label record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeLabel {
    pub label: String,
    pub uuid: uuid::Uuid,
    pub pool: String,
    pub timestamp: i64,
}

/// One file entry inside a TOC backup-set record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocFileEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: i64,
    pub checksum: String,
}

/// One backup-set entry inside a tape's TOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocBackupSet {
    pub file_number: u64,
    pub job_name: String,
    pub backup_type: BackupType,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub file_count: u64,
    pub total_bytes: u64,
    pub encrypted: bool,
    pub compressed: bool,
    pub compression_type: Compression,
    pub files: Vec<TocFileEntry>,
}

/// TOC record written as the last file on a tape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeOfContents {
    pub tape: TapeLabel,
    pub spanning_set_id: Option<Id>,
    pub sequence_number: Option<u32>,
    pub total_tapes: Option<u32>,
    pub backup_sets: Vec<TocBackupSet>,
}

/// `(type, category, title, message, timestamp)` EventSubscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Warning,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub category: String,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_kind_from_flags() {
        assert_eq!(
            PipelineKind::from_flags(Compression::None, false),
            PipelineKind::Plain
        );
        assert_eq!(
            PipelineKind::from_flags(Compression::Zstd, false),
            PipelineKind::Compress(Compression::Zstd)
        );
        assert_eq!(
            PipelineKind::from_flags(Compression::None, true),
            PipelineKind::Encrypt
        );
        assert_eq!(
            PipelineKind::from_flags(Compression::Gzip, true),
            PipelineKind::CompressEncrypt(Compression::Gzip)
        );
    }

    #[test]
    fn tape_remaining_capacity_saturates() {
        let tape = Tape {
            id: 1,
            uuid: uuid::Uuid::nil(),
            label: "T1".into(),
            barcode: None,
            pool_id: 1,
            status: TapeStatus::Active,
            capacity_bytes: 100,
            used_bytes: 150,
            write_count: 1,
            created_at: 0,
            updated_at: 0,
            offsite_location: None,
            encryption_key_fingerprint: None,
        };
        assert_eq!(tape.remaining_capacity(), 0);
    }
}
