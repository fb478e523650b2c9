//! Backup sets and job executions — the per-run state of the catalog.

use rusqlite::{params, OptionalExtension, Row};

use crate::{enum_to_text, now, text_to_enum, CatalogError, CatalogStore, Result};
use tbe_types::*;

fn row_to_backup_set(row: &Row) -> rusqlite::Result<BackupSet> {
    Ok(BackupSet {
        id: row.get(0)?,
        job_id: row.get(1)?,
        tape_id: row.get(2)?,
        backup_type: text_to_enum("backup_type", &row.get::<_, String>(3)?)
            .unwrap_or(BackupType::Full),
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        status: text_to_enum("status", &row.get::<_, String>(6)?)
            .unwrap_or(BackupSetStatus::Running),
        file_count: row.get::<_, i64>(7)? as u64,
        total_bytes: row.get::<_, i64>(8)? as u64,
        start_block: row.get(9)?,
        end_block: row.get(10)?,
        checksum: row.get(11)?,
        encrypted: row.get::<_, i64>(12)? != 0,
        encryption_key_id: row.get(13)?,
        compressed: row.get::<_, i64>(14)? != 0,
        compression_type: text_to_enum("compression_type", &row.get::<_, String>(15)?)
            .unwrap_or(Compression::None),
        parent_set_id: row.get(16)?,
    })
}

fn row_to_job_execution(row: &Row) -> rusqlite::Result<JobExecution> {
    let resume_state: Option<String> = row.get(7)?;
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        backup_set_id: row.get(2)?,
        status: text_to_enum("status", &row.get::<_, String>(3)?).unwrap_or(JobPhase::Idle),
        files_processed: row.get::<_, i64>(4)? as u64,
        bytes_processed: row.get::<_, i64>(5)? as u64,
        error_message: row.get(6)?,
        can_resume: row.get::<_, i64>(8)? != 0,
        resume_state: resume_state.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl CatalogStore {
    #[allow(clippy::too_many_arguments)]
    pub fn create_backup_set(
        &self,
        job_id: Id,
        tape_id: Id,
        backup_type: BackupType,
        encrypted: bool,
        encryption_key_id: Option<&str>,
        compressed: bool,
        compression_type: Compression,
        parent_set_id: Option<Id>,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO backup_sets (job_id, tape_id, backup_type, start_time, end_time,
                                       status, file_count, total_bytes, start_block, end_block,
                                       checksum, encrypted, encryption_key_id, compressed,
                                       compression_type, parent_set_id)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, 0, 0, NULL, NULL, NULL, ?6, ?7, ?8, ?9, ?10)",
            params![
                job_id,
                tape_id,
                enum_to_text(&backup_type),
                now(),
                enum_to_text(&BackupSetStatus::Running),
                encrypted as i64,
                encryption_key_id,
                compressed as i64,
                enum_to_text(&compression_type),
                parent_set_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_backup_set(&self, id: Id) -> Result<BackupSet> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, job_id, tape_id, backup_type, start_time, end_time, status, file_count,
                    total_bytes, start_block, end_block, checksum, encrypted, encryption_key_id,
                    compressed, compression_type, parent_set_id
             FROM backup_sets WHERE id = ?1",
            params![id],
            row_to_backup_set,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("backup_set {id}")))
    }

    /// Every completed BackupSet for `job_id`, oldest first — the raw
    /// material the Restore Engine's chain resolution 
    /// walks to find the latest full plus any incrementals after it.
    pub fn list_backup_sets_for_job(&self, job_id: Id) -> Result<Vec<BackupSet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, tape_id, backup_type, start_time, end_time, status, file_count,
                    total_bytes, start_block, end_block, checksum, encrypted, encryption_key_id,
                    compressed, compression_type, parent_set_id
             FROM backup_sets WHERE job_id = ?1 ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(params![job_id], row_to_backup_set)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_backup_set_start_block(&self, id: Id, start_block: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backup_sets SET start_block = ?2 WHERE id = ?1",
            params![id, start_block as i64],
        )?;
        Ok(())
    }

    /// Finalizes a backup set: sets `end_time`, final counts, `end_block`
    /// and status's `status=completed` invariant.
    pub fn finalize_backup_set(
        &self,
        id: Id,
        status: BackupSetStatus,
        file_count: u64,
        total_bytes: u64,
        end_block: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backup_sets
             SET status = ?2, end_time = ?3, file_count = ?4, total_bytes = ?5, end_block = ?6,
                 checksum = ?7
             WHERE id = ?1",
            params![
                id,
                enum_to_text(&status),
                now(),
                file_count as i64,
                total_bytes as i64,
                end_block,
                checksum,
            ],
        )?;
        Ok(())
    }

    pub fn create_job_execution(&self, job_id: Id) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO job_executions (job_id, backup_set_id, status, files_processed,
                                          bytes_processed, error_message, can_resume,
                                          resume_state, created_at, updated_at)
             VALUES (?1, NULL, ?2, 0, 0, NULL, 0, NULL, ?3, ?3)",
            params![job_id, enum_to_text(&JobPhase::Idle), ts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job_execution(&self, id: Id) -> Result<JobExecution> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, job_id, backup_set_id, status, files_processed, bytes_processed,
                    error_message, resume_state, can_resume
             FROM job_executions WHERE id = ?1",
            params![id],
            row_to_job_execution,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("job_execution {id}")))
    }

    pub fn set_job_execution_backup_set(&self, id: Id, backup_set_id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET backup_set_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, backup_set_id, now()],
        )?;
        Ok(())
    }

    pub fn update_job_execution_status(
        &self,
        id: Id,
        status: JobPhase,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET status = ?2, error_message = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, enum_to_text(&status), error_message, now()],
        )?;
        Ok(())
    }

    pub fn update_job_execution_progress(
        &self,
        id: Id,
        files_processed: u64,
        bytes_processed: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET files_processed = ?2, bytes_processed = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, files_processed as i64, bytes_processed as i64, now()],
        )?;
        Ok(())
    }

    /// Persists a resumable checkpoint.5 pause semantics.
    pub fn checkpoint_job_execution(&self, id: Id, resume_state: &ResumeState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET can_resume = 1, resume_state = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, serde_json::to_string(resume_state)?, now()],
        )?;
        Ok(())
    }

    /// The most recent paused, resumable execution for `job_id`, if any —
    /// the checkpoint a resumed run's scan subtracts already-processed
    /// paths from (`spec.md` §4.5).
    pub fn find_resumable_execution(&self, job_id: Id) -> Result<Option<JobExecution>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, job_id, backup_set_id, status, files_processed, bytes_processed,
                        error_message, resume_state, can_resume
                 FROM job_executions
                 WHERE job_id = ?1 AND can_resume = 1 AND status = ?2
                 ORDER BY id DESC LIMIT 1",
                params![job_id, enum_to_text(&JobPhase::Paused)],
                row_to_job_execution,
            )
            .optional()?)
    }

    pub fn clear_resume_state(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET can_resume = 0, resume_state = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_store;
    use uuid::Uuid;

    fn setup(store: &CatalogStore) -> (Id, Id, Id) {
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
        let tape_id = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000_000_000)
            .unwrap();
        (pool_id, job_id, tape_id)
    }

    #[test]
    fn finalize_sets_end_time_and_status() {
        let store = test_store();
        let (_pool, job_id, tape_id) = setup(&store);
        let set_id = store
            .create_backup_set(
                job_id,
                tape_id,
                BackupType::Full,
                false,
                None,
                false,
                Compression::None,
                None,
            )
            .unwrap();
        store
            .finalize_backup_set(set_id, BackupSetStatus::Completed, 2, 10, Some(128), None)
            .unwrap();
        let set = store.get_backup_set(set_id).unwrap();
        assert_eq!(set.status, BackupSetStatus::Completed);
        assert!(set.end_time.is_some());
        assert_eq!(set.file_count, 2);
        assert_eq!(set.total_bytes, 10);
    }

    #[test]
    fn list_backup_sets_for_job_orders_oldest_first() {
        let store = test_store();
        let (_pool, job_id, tape_id) = setup(&store);
        let first = store
            .create_backup_set(
                job_id,
                tape_id,
                BackupType::Full,
                false,
                None,
                false,
                Compression::None,
                None,
            )
            .unwrap();
        let second = store
            .create_backup_set(
                job_id,
                tape_id,
                BackupType::Incremental,
                false,
                None,
                false,
                Compression::None,
                Some(first),
            )
            .unwrap();
        let sets = store.list_backup_sets_for_job(job_id).unwrap();
        assert_eq!(sets.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(sets[1].parent_set_id, Some(first));
    }

    #[test]
    fn checkpoint_round_trips_resume_state() {
        let store = test_store();
        let (_pool, job_id, _tape) = setup(&store);
        let exec_id = store.create_job_execution(job_id).unwrap();
        let resume = ResumeState {
            files_processed: vec!["a".into(), "b".into()],
            bytes_written: 1024,
            total_files: 5,
            total_bytes: 4096,
            tape_id: 1,
            backup_set_id: 1,
        };
        store.checkpoint_job_execution(exec_id, &resume).unwrap();
        let exec = store.get_job_execution(exec_id).unwrap();
        assert!(exec.can_resume);
        assert_eq!(
            exec.resume_state.unwrap().files_processed,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn find_resumable_execution_only_matches_paused_checkpointed_runs() {
        let store = test_store();
        let (_pool, job_id, _tape) = setup(&store);

        assert!(store.find_resumable_execution(job_id).unwrap().is_none());

        let exec_id = store.create_job_execution(job_id).unwrap();
        let resume = ResumeState {
            files_processed: vec!["a".into()],
            bytes_written: 5,
            total_files: 2,
            total_bytes: 10,
            tape_id: 1,
            backup_set_id: 1,
        };
        store.checkpoint_job_execution(exec_id, &resume).unwrap();
        // Checkpointed but still `idle`/whatever status create_job_execution
        // left it at — not yet `paused`, so not resumable.
        assert!(store.find_resumable_execution(job_id).unwrap().is_none());

        store
            .update_job_execution_status(exec_id, JobPhase::Paused, None)
            .unwrap();
        let found = store.find_resumable_execution(job_id).unwrap().unwrap();
        assert_eq!(found.id, exec_id);

        store.clear_resume_state(exec_id).unwrap();
        assert!(store.find_resumable_execution(job_id).unwrap().is_none());
    }
}
