//! In-memory `JobProgress` — `spec.md` §3 "Ownership" and §4.5.
//!
//! Owned exclusively by the Job Lifecycle Manager; the API/CLI layer only
//! ever sees a deep-copied snapshot, never a reference into live state.

use std::collections::VecDeque;

use tbe_types::{Id, JobPhase};

const LOG_RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct JobProgress {
    pub job_id: Id,
    pub execution_id: Id,
    pub backup_set_id: Option<Id>,
    pub phase: JobPhase,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
    pub log: VecDeque<String>,
}

impl JobProgress {
    pub fn new(job_id: Id, execution_id: Id, started_at: i64) -> Self {
        Self {
            job_id,
            execution_id,
            backup_set_id: None,
            phase: JobPhase::Idle,
            files_processed: 0,
            bytes_processed: 0,
            total_files: 0,
            total_bytes: 0,
            error_message: None,
            started_at,
            updated_at: started_at,
            log: VecDeque::with_capacity(LOG_RING_CAPACITY),
        }
    }

    /// Appends a timestamped log line, evicting the oldest entry once the
    /// ring of 100 is full.
    pub fn push_log(&mut self, at: i64, line: impl Into<String>) {
        if self.log.len() >= LOG_RING_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(format!("[{at}] {}", line.into()));
    }
}
