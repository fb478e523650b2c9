//! Spanning sets, members and tape-change requests.

use rusqlite::{params, OptionalExtension, Row};

use crate::{enum_to_text, now, text_to_enum, CatalogError, CatalogStore, Result};
use tbe_types::*;

fn row_to_spanning_set(row: &Row) -> rusqlite::Result<SpanningSet> {
    Ok(SpanningSet {
        id: row.get(0)?,
        job_execution_id: row.get(1)?,
        status: text_to_enum("status", &row.get::<_, String>(2)?)
            .unwrap_or(BackupSetStatus::Running),
        total_bytes: row.get::<_, i64>(3)? as u64,
    })
}

fn row_to_member(row: &Row) -> rusqlite::Result<SpanningMember> {
    Ok(SpanningMember {
        id: row.get(0)?,
        spanning_set_id: row.get(1)?,
        sequence_number: row.get::<_, i64>(2)? as u32,
        tape_id: row.get(3)?,
        backup_set_id: row.get(4)?,
        files_start_index: row.get::<_, i64>(5)? as u64,
        files_end_index: row.get::<_, i64>(6)? as u64,
        bytes_written: row.get::<_, i64>(7)? as u64,
    })
}

fn row_to_change_request(row: &Row) -> rusqlite::Result<TapeChangeRequest> {
    Ok(TapeChangeRequest {
        id: row.get(0)?,
        spanning_set_id: row.get(1)?,
        current_tape_id: row.get(2)?,
        new_tape_id: row.get(3)?,
        reason: row.get(4)?,
        status: text_to_enum("status", &row.get::<_, String>(5)?)
            .unwrap_or(TapeChangeStatus::Pending),
        requested_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

impl CatalogStore {
    pub fn create_spanning_set(&self, job_execution_id: Id) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO spanning_sets (job_execution_id, status, total_bytes)
             VALUES (?1, ?2, 0)",
            params![job_execution_id, enum_to_text(&BackupSetStatus::Running)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_spanning_set(&self, id: Id) -> Result<SpanningSet> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, job_execution_id, status, total_bytes FROM spanning_sets WHERE id = ?1",
            params![id],
            row_to_spanning_set,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("spanning_set {id}")))
    }

    pub fn finish_spanning_set(&self, id: Id, status: BackupSetStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(bytes_written), 0) FROM spanning_members WHERE spanning_set_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        conn.execute(
            "UPDATE spanning_sets SET status = ?2, total_bytes = ?3 WHERE id = ?1",
            params![id, enum_to_text(&status), total],
        )?;
        Ok(())
    }

    /// Appends the next member. for any
    /// spanning set, `sequence_number` is strictly increasing.
    pub fn append_spanning_member(
        &self,
        spanning_set_id: Id,
        tape_id: Id,
        backup_set_id: Id,
        files_start_index: u64,
        files_end_index: u64,
        bytes_written: u64,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM spanning_members
             WHERE spanning_set_id = ?1",
            params![spanning_set_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO spanning_members
                (spanning_set_id, sequence_number, tape_id, backup_set_id, files_start_index,
                 files_end_index, bytes_written)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                spanning_set_id,
                next_seq,
                tape_id,
                backup_set_id,
                files_start_index as i64,
                files_end_index as i64,
                bytes_written as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Ordered by `sequence_number`, matching physical tape-insertion order
    /// .
    pub fn list_spanning_members(&self, spanning_set_id: Id) -> Result<Vec<SpanningMember>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, spanning_set_id, sequence_number, tape_id, backup_set_id,
                    files_start_index, files_end_index, bytes_written
             FROM spanning_members WHERE spanning_set_id = ?1 ORDER BY sequence_number",
        )?;
        let rows = stmt.query_map(params![spanning_set_id], row_to_member)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The spanning member recording `backup_set_id`, if that BackupSet was
    /// produced as part of a spanning run — used by the Restore Engine to
    /// discover whether a BackupSet's data lives on more than one tape.
    pub fn find_spanning_member_by_backup_set(
        &self,
        backup_set_id: Id,
    ) -> Result<Option<SpanningMember>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, spanning_set_id, sequence_number, tape_id, backup_set_id,
                    files_start_index, files_end_index, bytes_written
             FROM spanning_members WHERE backup_set_id = ?1",
            params![backup_set_id],
            row_to_member,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn create_tape_change_request(
        &self,
        spanning_set_id: Id,
        current_tape_id: Id,
        reason: &str,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tape_change_requests
                (spanning_set_id, current_tape_id, new_tape_id, reason, status, requested_at,
                 completed_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, NULL)",
            params![
                spanning_set_id,
                current_tape_id,
                reason,
                enum_to_text(&TapeChangeStatus::Pending),
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_tape_change_request(&self, id: Id) -> Result<TapeChangeRequest> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, spanning_set_id, current_tape_id, new_tape_id, reason, status,
                    requested_at, completed_at
             FROM tape_change_requests WHERE id = ?1",
            params![id],
            row_to_change_request,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("tape_change_request {id}")))
    }

    /// Operator confirms the new tape is loaded .
    pub fn complete_tape_change_request(&self, id: Id, new_tape_id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tape_change_requests
             SET status = ?2, new_tape_id = ?3, completed_at = ?4
             WHERE id = ?1",
            params![
                id,
                enum_to_text(&TapeChangeStatus::Completed),
                new_tape_id,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn cancel_tape_change_request(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tape_change_requests SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![id, enum_to_text(&TapeChangeStatus::Cancelled), now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_store;
    use uuid::Uuid;

    fn setup(store: &CatalogStore) -> (Id, Id, Id, Id) {
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
        let tape_id = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000_000_000)
            .unwrap();
        (pool_id, job_id, exec_id, tape_id)
    }

    #[test]
    fn sequence_numbers_increase_with_no_gaps() {
        let store = test_store();
        let (_pool, job_id, exec_id, tape_id) = setup(&store);
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
        let span_id = store.create_spanning_set(exec_id).unwrap();
        store
            .append_spanning_member(span_id, tape_id, set_id, 0, 99, 1_000)
            .unwrap();
        store
            .append_spanning_member(span_id, tape_id, set_id, 100, 199, 2_000)
            .unwrap();
        let members = store.list_spanning_members(span_id).unwrap();
        assert_eq!(members[0].sequence_number, 1);
        assert_eq!(members[1].sequence_number, 2);
        store.finish_spanning_set(span_id, BackupSetStatus::Completed).unwrap();
        let span = store.get_spanning_set(span_id).unwrap();
        assert_eq!(span.total_bytes, 3_000);
    }

    #[test]
    fn finds_the_spanning_member_owning_a_backup_set() {
        let store = test_store();
        let (_pool, job_id, exec_id, tape_id) = setup(&store);
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
        assert!(store
            .find_spanning_member_by_backup_set(set_id)
            .unwrap()
            .is_none());

        let span_id = store.create_spanning_set(exec_id).unwrap();
        store
            .append_spanning_member(span_id, tape_id, set_id, 0, 9, 512)
            .unwrap();
        let member = store
            .find_spanning_member_by_backup_set(set_id)
            .unwrap()
            .expect("member present");
        assert_eq!(member.spanning_set_id, span_id);
    }

    #[test]
    fn tape_change_request_lifecycle() {
        let store = test_store();
        let (_pool, job_id, exec_id, tape_id) = setup(&store);
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
        let _ = set_id;
        let span_id = store.create_spanning_set(exec_id).unwrap();
        let req_id = store
            .create_tape_change_request(span_id, tape_id, "capacity exhausted")
            .unwrap();
        let req = store.get_tape_change_request(req_id).unwrap();
        assert_eq!(req.status, TapeChangeStatus::Pending);
        store.complete_tape_change_request(req_id, tape_id).unwrap();
        let req = store.get_tape_change_request(req_id).unwrap();
        assert_eq!(req.status, TapeChangeStatus::Completed);
        assert_eq!(req.new_tape_id, Some(tape_id));
    }
}
