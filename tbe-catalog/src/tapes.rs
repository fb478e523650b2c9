//! Pools, tapes, drives, sources and jobs — the configuration-ish entities
//! of the catalog.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::{enum_to_text, now, text_to_enum, CatalogError, CatalogStore, Result};
use tbe_types::*;

fn row_to_pool(row: &Row) -> rusqlite::Result<Pool> {
    Ok(Pool {
        id: row.get(0)?,
        name: row.get(1)?,
        retention_days: row.get(2)?,
        allow_reuse: row.get::<_, i64>(3)? != 0,
        allocation_policy: text_to_enum("allocation_policy", &row.get::<_, String>(4)?)
            .unwrap_or(AllocationPolicy::Continue),
    })
}

fn row_to_tape(row: &Row) -> rusqlite::Result<Tape> {
    Ok(Tape {
        id: row.get(0)?,
        uuid: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_else(|_| Uuid::nil()),
        label: row.get(2)?,
        barcode: row.get(3)?,
        pool_id: row.get(4)?,
        status: text_to_enum("status", &row.get::<_, String>(5)?).unwrap_or(TapeStatus::Blank),
        capacity_bytes: row.get::<_, i64>(6)? as u64,
        used_bytes: row.get::<_, i64>(7)? as u64,
        write_count: row.get::<_, i64>(8)? as u64,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        offsite_location: row.get(11)?,
        encryption_key_fingerprint: row.get(12)?,
    })
}

fn row_to_drive(row: &Row) -> rusqlite::Result<Drive> {
    Ok(Drive {
        id: row.get(0)?,
        device_path: row.get(1)?,
        display_name: row.get(2)?,
        model: row.get(3)?,
        serial: row.get(4)?,
        status: text_to_enum("status", &row.get::<_, String>(5)?).unwrap_or(DriveStatus::Offline),
        enabled: row.get::<_, i64>(6)? != 0,
        current_tape_id: row.get(7)?,
    })
}

fn row_to_source(row: &Row) -> rusqlite::Result<Source> {
    let include: String = row.get(4)?;
    let exclude: String = row.get(5)?;
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        source_type: row.get(2)?,
        path: row.get(3)?,
        include_patterns: serde_json::from_str(&include).unwrap_or_default(),
        exclude_patterns: serde_json::from_str(&exclude).unwrap_or_default(),
        enabled: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        source_id: row.get(2)?,
        pool_id: row.get(3)?,
        backup_type: text_to_enum("backup_type", &row.get::<_, String>(4)?)
            .unwrap_or(BackupType::Full),
        schedule_cron: row.get(5)?,
        retention_days: row.get(6)?,
        compression: text_to_enum("compression", &row.get::<_, String>(7)?)
            .unwrap_or(Compression::None),
        encryption_enabled: row.get::<_, i64>(8)? != 0,
        encryption_key_id: row.get(9)?,
        enabled: row.get::<_, i64>(10)? != 0,
        last_run_at: row.get(11)?,
        next_run_at: row.get(12)?,
    })
}

impl CatalogStore {
    pub fn create_pool(
        &self,
        name: &str,
        retention_days: u32,
        allow_reuse: bool,
        allocation_policy: AllocationPolicy,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pools (name, retention_days, allow_reuse, allocation_policy)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                retention_days,
                allow_reuse as i64,
                enum_to_text(&allocation_policy)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_pool(&self, id: Id) -> Result<Pool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, retention_days, allow_reuse, allocation_policy
             FROM pools WHERE id = ?1",
            params![id],
            row_to_pool,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("pool {id}")))
    }

    pub fn create_tape(
        &self,
        uuid: Uuid,
        label: &str,
        barcode: Option<&str>,
        pool_id: Id,
        capacity_bytes: u64,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO tapes (uuid, label, barcode, pool_id, status, capacity_bytes,
                                 used_bytes, write_count, created_at, updated_at,
                                 offsite_location, encryption_key_fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?7, NULL, NULL)",
            params![
                uuid.to_string(),
                label,
                barcode,
                pool_id,
                enum_to_text(&TapeStatus::Blank),
                capacity_bytes as i64,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_tape(&self, id: Id) -> Result<Tape> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, uuid, label, barcode, pool_id, status, capacity_bytes, used_bytes,
                    write_count, created_at, updated_at, offsite_location,
                    encryption_key_fingerprint
             FROM tapes WHERE id = ?1",
            params![id],
            row_to_tape,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("tape {id}")))
    }

    pub fn list_tapes_in_pool(&self, pool_id: Id) -> Result<Vec<Tape>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, uuid, label, barcode, pool_id, status, capacity_bytes, used_bytes,
                    write_count, created_at, updated_at, offsite_location,
                    encryption_key_fingerprint
             FROM tapes WHERE pool_id = ?1 ORDER BY used_bytes ASC",
        )?;
        let rows = stmt.query_map(params![pool_id], row_to_tape)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Marks a tape active and records the post-write byte delta, per
    ///  and the `Tape.used_bytes` invariant.
    pub fn add_tape_usage(&self, id: Id, bytes: u64, write_count_delta: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tapes SET used_bytes = used_bytes + ?2,
                              write_count = write_count + ?3,
                              status = CASE WHEN status = 'blank' THEN 'active' ELSE status END,
                              updated_at = ?4
             WHERE id = ?1",
            params![id, bytes as i64, write_count_delta as i64, now()],
        )?;
        Ok(())
    }

    pub fn set_tape_status(&self, id: Id, status: TapeStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tapes SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enum_to_text(&status), now()],
        )?;
        Ok(())
    }

    pub fn create_drive(
        &self,
        device_path: &str,
        display_name: &str,
        model: Option<&str>,
        serial: Option<&str>,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO drives (device_path, display_name, model, serial, status, enabled,
                                  current_tape_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL)",
            params![
                device_path,
                display_name,
                model,
                serial,
                enum_to_text(&DriveStatus::Ready)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_drive(&self, id: Id) -> Result<Drive> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, device_path, display_name, model, serial, status, enabled,
                    current_tape_id
             FROM drives WHERE id = ?1",
            params![id],
            row_to_drive,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("drive {id}")))
    }

    /// Claims a drive for a job (`status='busy'`)'s
    /// single-writer resource policy. Returns an error if already busy.
    pub fn claim_drive(&self, id: Id, tape_id: Option<Id>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn.query_row(
            "SELECT status FROM drives WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        if current == enum_to_text(&DriveStatus::Busy) {
            return Err(CatalogError::NotFound(format!("drive {id} already busy")));
        }
        conn.execute(
            "UPDATE drives SET status = ?2, current_tape_id = ?3 WHERE id = ?1",
            params![id, enum_to_text(&DriveStatus::Busy), tape_id],
        )?;
        Ok(())
    }

    pub fn release_drive(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE drives SET status = ?2, current_tape_id = NULL WHERE id = ?1",
            params![id, enum_to_text(&DriveStatus::Ready)],
        )?;
        Ok(())
    }

    pub fn create_source(
        &self,
        name: &str,
        source_type: &str,
        path: &str,
        include_patterns: &[String],
        exclude_patterns: &[String],
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sources (name, source_type, path, include_patterns, exclude_patterns,
                                   enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                name,
                source_type,
                path,
                serde_json::to_string(include_patterns)?,
                serde_json::to_string(exclude_patterns)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_source(&self, id: Id) -> Result<Source> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, source_type, path, include_patterns, exclude_patterns, enabled
             FROM sources WHERE id = ?1",
            params![id],
            row_to_source,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("source {id}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_job(
        &self,
        name: &str,
        source_id: Id,
        pool_id: Id,
        backup_type: BackupType,
        schedule_cron: &str,
        retention_days: u32,
        compression: Compression,
        encryption_enabled: bool,
        encryption_key_id: Option<&str>,
    ) -> Result<Id> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (name, source_id, pool_id, backup_type, schedule_cron,
                                retention_days, compression, encryption_enabled,
                                encryption_key_id, enabled, last_run_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, NULL, NULL)",
            params![
                name,
                source_id,
                pool_id,
                enum_to_text(&backup_type),
                schedule_cron,
                retention_days,
                enum_to_text(&compression),
                encryption_enabled as i64,
                encryption_key_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: Id) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, source_id, pool_id, backup_type, schedule_cron, retention_days,
                    compression, encryption_enabled, encryption_key_id, enabled, last_run_at,
                    next_run_at
             FROM jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| CatalogError::NotFound(format!("job {id}")))
    }

    pub fn list_enabled_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, source_id, pool_id, backup_type, schedule_cron, retention_days,
                    compression, encryption_enabled, encryption_key_id, enabled, last_run_at,
                    next_run_at
             FROM jobs WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_job_schedule_state(
        &self,
        id: Id,
        last_run_at: Option<i64>,
        next_run_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
            params![id, last_run_at, next_run_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_store;

    fn setup_pool_and_tape(store: &CatalogStore) -> (Id, Id) {
        let pool_id = store
            .create_pool("daily", 30, true, AllocationPolicy::Continue)
            .unwrap();
        let tape_id = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000_000_000)
            .unwrap();
        (pool_id, tape_id)
    }

    #[test]
    fn tape_starts_blank_with_zero_usage() {
        let store = test_store();
        let (_pool, tape_id) = setup_pool_and_tape(&store);
        let tape = store.get_tape(tape_id).unwrap();
        assert_eq!(tape.status, TapeStatus::Blank);
        assert_eq!(tape.used_bytes, 0);
        assert_eq!(tape.write_count, 0);
    }

    #[test]
    fn adding_usage_transitions_blank_to_active() {
        let store = test_store();
        let (_pool, tape_id) = setup_pool_and_tape(&store);
        store.add_tape_usage(tape_id, 2048, 1).unwrap();
        let tape = store.get_tape(tape_id).unwrap();
        assert_eq!(tape.status, TapeStatus::Active);
        assert_eq!(tape.used_bytes, 2048);
        assert_eq!(tape.write_count, 1);
    }

    #[test]
    fn claim_drive_rejects_double_claim() {
        let store = test_store();
        let drive_id = store.create_drive("/dev/nst0", "Drive 1", None, None).unwrap();
        store.claim_drive(drive_id, None).unwrap();
        assert!(store.claim_drive(drive_id, None).is_err());
        store.release_drive(drive_id).unwrap();
        assert!(store.claim_drive(drive_id, None).is_ok());
    }

    #[test]
    fn list_tapes_in_pool_orders_by_least_used() {
        let store = test_store();
        let (pool_id, t1) = setup_pool_and_tape(&store);
        let t2 = store
            .create_tape(Uuid::new_v4(), "T2", None, pool_id, 1_000_000_000)
            .unwrap();
        store.add_tape_usage(t1, 500, 1).unwrap();
        let tapes = store.list_tapes_in_pool(pool_id).unwrap();
        assert_eq!(tapes[0].id, t2);
        assert_eq!(tapes[1].id, t1);
    }
}
