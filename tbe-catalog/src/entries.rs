//! Per-file catalog entries and per-source snapshots.
//!
//! `insert_entries_batch` is the batched transaction writer described in
//! the Checksum Worker Pool flushes every ~500 rows inside
//! one transaction rather than one `INSERT` per file.

use rusqlite::{params, OptionalExtension, Row};

use crate::{CatalogStore, Result};
use tbe_types::*;

fn row_to_entry(row: &Row) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        id: row.get(0)?,
        backup_set_id: row.get(1)?,
        file_path: row.get(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        file_mode: row.get::<_, i64>(4)? as u32,
        mod_time: row.get(5)?,
        checksum: row.get(6)?,
        block_offset: row.get(7)?,
    })
}

/// One unit of work produced by the Checksum Worker Pool for a single file.
#[derive(Debug, Clone)]
pub struct NewCatalogEntry {
    pub file_path: String,
    pub file_size: u64,
    pub file_mode: u32,
    pub mod_time: i64,
    pub checksum: String,
}

impl CatalogStore {
    /// Inserts a batch of catalog rows for one backup set inside a single
    /// transaction. "flushes every N (~500) rows inside one
    /// transaction". A row whose file vanished or errored during checksum
    /// still gets cataloged with an empty checksum, per §4.4.
    pub fn insert_entries_batch(
        &self,
        backup_set_id: Id,
        entries: &[NewCatalogEntry],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO catalog_entries
                    (backup_set_id, file_path, file_size, file_mode, mod_time, checksum,
                     block_offset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    backup_set_id,
                    entry.file_path,
                    entry.file_size as i64,
                    entry.file_mode as i64,
                    entry.mod_time,
                    entry.checksum,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Assigns `block_offset` to every row of a backup set in streaming
    /// order: "`block_offset` values are assigned in that
    /// same order (batched updates at finalization)".
    pub fn assign_block_offsets(
        &self,
        backup_set_id: Id,
        ordered_paths: &[(String, u64)],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE catalog_entries SET block_offset = ?3
                 WHERE backup_set_id = ?1 AND file_path = ?2",
            )?;
            for (path, offset) in ordered_paths {
                stmt.execute(params![backup_set_id, path, *offset as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_entries(&self, backup_set_id: Id) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, backup_set_id, file_path, file_size, file_mode, mod_time, checksum,
                    block_offset
             FROM catalog_entries WHERE backup_set_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![backup_set_id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Entries whose `file_path` starts with `prefix`, for folder-prefix
    /// restore expansion .
    pub fn list_entries_with_prefix(
        &self,
        backup_set_id: Id,
        prefix: &str,
    ) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("{prefix}%");
        let mut stmt = conn.prepare(
            "SELECT id, backup_set_id, file_path, file_size, file_mode, mod_time, checksum,
                    block_offset
             FROM catalog_entries WHERE backup_set_id = ?1 AND file_path LIKE ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![backup_set_id, pattern], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// `sum(file_size) == BackupSet.total_bytes`.
    pub fn sum_entry_bytes(&self, backup_set_id: Id) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM catalog_entries WHERE backup_set_id = ?1",
            params![backup_set_id],
            |r| r.get(0),
        )?;
        Ok(total as u64)
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO snapshots
                (source_id, backup_set_id, file_count, total_bytes, snapshot_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.source_id,
                snapshot.backup_set_id,
                snapshot.file_count as i64,
                snapshot.total_bytes as i64,
                serde_json::to_string(&snapshot.snapshot_data)?,
                crate::now(),
            ],
        )?;
        Ok(())
    }

    /// The baseline for the next incremental/§4.3.
    pub fn latest_snapshot(&self, source_id: Id) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Id, u64, u64, String)> = conn
            .query_row(
                "SELECT backup_set_id, file_count, total_bytes, snapshot_data
                 FROM snapshots WHERE source_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![source_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get::<_, i64>(1)? as u64,
                        r.get::<_, i64>(2)? as u64,
                        r.get(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((backup_set_id, file_count, total_bytes, data)) => Ok(Some(Snapshot {
                source_id,
                backup_set_id,
                file_count,
                total_bytes,
                snapshot_data: serde_json::from_str(&data)?,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_store;
    use uuid::Uuid;

    fn setup_set(store: &CatalogStore) -> Id {
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
        store
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
            .unwrap()
    }

    #[test]
    fn batch_insert_then_sum_matches_total_bytes() {
        let store = test_store();
        let set_id = setup_set(&store);
        let entries = vec![
            NewCatalogEntry {
                file_path: "a".into(),
                file_size: 5,
                file_mode: 0o644,
                mod_time: 0,
                checksum: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                    .into(),
            },
            NewCatalogEntry {
                file_path: "b/c".into(),
                file_size: 5,
                file_mode: 0o644,
                mod_time: 0,
                checksum: "7509e5bda0c762d2bac7f90d758b5b2263fa01ccbc542ab5e3df163be08e6ca9"
                    .into(),
            },
        ];
        store.insert_entries_batch(set_id, &entries).unwrap();
        assert_eq!(store.sum_entry_bytes(set_id).unwrap(), 10);
        assert_eq!(store.list_entries(set_id).unwrap().len(), 2);
    }

    #[test]
    fn prefix_query_matches_folder() {
        let store = test_store();
        let set_id = setup_set(&store);
        let entries = vec![
            NewCatalogEntry {
                file_path: "photos/a.jpg".into(),
                file_size: 1,
                file_mode: 0o644,
                mod_time: 0,
                checksum: "x".into(),
            },
            NewCatalogEntry {
                file_path: "docs/b.txt".into(),
                file_size: 1,
                file_mode: 0o644,
                mod_time: 0,
                checksum: "y".into(),
            },
        ];
        store.insert_entries_batch(set_id, &entries).unwrap();
        let matched = store.list_entries_with_prefix(set_id, "photos/").unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].file_path, "photos/a.jpg");
    }

    #[test]
    fn snapshot_round_trips() {
        let store = test_store();
        let set_id = setup_set(&store);
        let snapshot = Snapshot {
            source_id: 1,
            backup_set_id: set_id,
            file_count: 1,
            total_bytes: 5,
            snapshot_data: vec![SnapshotFile {
                path: "a".into(),
                size: 5,
                mtime: 42,
            }],
        };
        store.save_snapshot(&snapshot).unwrap();
        let loaded = store.latest_snapshot(1).unwrap().unwrap();
        assert_eq!(loaded.snapshot_data[0].path, "a");
    }
}
