//! Resolve + plan .9 steps 1-2.
//!
//! Turns a (job, optional target backup set, path filter) request into an
//! ordered list of tape visits. Two kinds of grouping matter here and are
//! easy to conflate: the *incremental chain* (walk `parent_set_id` back to
//! the full backup this restore needs) and the *spanning run* (sibling
//! BackupSets that together make up one logical backup that crossed tape
//! boundaries). Neither subsumes the other — an incremental run can itself
//! span tapes — so resolution expands both.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};

use tbe_catalog::CatalogStore;
use tbe_types::{BackupSet, BackupSetStatus, CatalogEntry, Id};

/// One tape this restore must visit, carrying only the catalog entries this
/// request actually wants from that tape's BackupSet.
pub struct PlanStep {
    pub tape_id: Id,
    pub backup_set_id: Id,
    pub start_block: Option<u64>,
    pub entries: Vec<CatalogEntry>,
}

pub struct RestorePlan {
    pub steps: Vec<PlanStep>,
}

/// Oldest-first list of BackupSet ids forming the chain from the full backup
/// up to and including `target` (or the latest completed set if `target` is
/// `None`).
fn resolve_chain(store: &CatalogStore, job_id: Id, target: Option<Id>) -> Result<Vec<BackupSet>> {
    let completed: Vec<BackupSet> = store
        .list_backup_sets_for_job(job_id)?
        .into_iter()
        .filter(|b| b.status == BackupSetStatus::Completed)
        .collect();
    if completed.is_empty() {
        bail!("job {job_id} has no completed backup sets to restore from");
    }
    let target_set = match target {
        Some(id) => completed
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .with_context(|| format!("backup set {id} is not a completed set of job {job_id}"))?,
        None => completed.last().cloned().expect("checked non-empty above"),
    };

    let by_id: HashMap<Id, BackupSet> = completed.into_iter().map(|b| (b.id, b)).collect();
    let mut chain = vec![target_set.clone()];
    let mut current = target_set;
    while let Some(parent_id) = current.parent_set_id {
        let parent = by_id
            .get(&parent_id)
            .cloned()
            .with_context(|| format!("parent backup set {parent_id} missing from catalog"))?;
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    Ok(chain)
}

/// Expands one chain anchor into every BackupSet its spanning run touched,
/// in tape-insertion order. A run that never spanned tapes has no spanning
/// member at all and expands to just itself.
fn expand_spanning_run(store: &CatalogStore, anchor: &BackupSet) -> Result<Vec<BackupSet>> {
    match store.find_spanning_member_by_backup_set(anchor.id)? {
        Some(member) => {
            let members = store.list_spanning_members(member.spanning_set_id)?;
            members
                .into_iter()
                .map(|m| store.get_backup_set(m.backup_set_id).map_err(Into::into))
                .collect()
        }
        None => Ok(vec![anchor.clone()]),
    }
}

/// Entries in `backup_set_id` matching `paths`.9 step 1:
/// a requested file matches itself exactly, a requested folder matches every
/// entry under it via a catalog prefix query. An empty `paths` means every
/// entry in the set.
fn select_entries(
    store: &CatalogStore,
    backup_set_id: Id,
    paths: &[String],
) -> Result<Vec<CatalogEntry>> {
    if paths.is_empty() {
        return Ok(store.list_entries(backup_set_id)?);
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for path in paths {
        let folder_prefix = if path.ends_with('/') {
            path.clone()
        } else {
            format!("{path}/")
        };
        for entry in store.list_entries_with_prefix(backup_set_id, &folder_prefix)? {
            if seen.insert(entry.id) {
                out.push(entry);
            }
        }
        for entry in store.list_entries_with_prefix(backup_set_id, path)? {
            if entry.file_path == *path && seen.insert(entry.id) {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

/// Builds the full restore plan: resolves the incremental chain, expands
/// each link's spanning run, and filters each resulting BackupSet's catalog
/// entries down to `paths`. Tapes that end up with nothing to restore are
/// dropped from the plan entirely.
pub fn build_plan(
    store: &CatalogStore,
    job_id: Id,
    target_backup_set_id: Option<Id>,
    paths: &[String],
) -> Result<RestorePlan> {
    let chain = resolve_chain(store, job_id, target_backup_set_id)?;
    let mut steps = Vec::new();
    for anchor in &chain {
        for backup_set in expand_spanning_run(store, anchor)? {
            let entries = select_entries(store, backup_set.id, paths)?;
            if entries.is_empty() {
                continue;
            }
            steps.push(PlanStep {
                tape_id: backup_set.tape_id,
                backup_set_id: backup_set.id,
                start_block: backup_set.start_block,
                entries,
            });
        }
    }
    if steps.is_empty() {
        bail!("no catalog entries in job {job_id}'s backup chain match the requested paths");
    }
    Ok(RestorePlan { steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbe_types::{AllocationPolicy, BackupType, Compression};
    use uuid::Uuid;

    fn setup_job(store: &CatalogStore) -> (Id, Id) {
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
        (job_id, pool_id)
    }

    fn new_tape(store: &CatalogStore, pool_id: Id, label: &str) -> Id {
        store
            .create_tape(Uuid::new_v4(), label, None, pool_id, 1_000_000_000)
            .unwrap()
    }

    fn complete_set(
        store: &CatalogStore,
        job_id: Id,
        tape_id: Id,
        backup_type: BackupType,
        parent: Option<Id>,
        files: &[(&str, u64)],
    ) -> Id {
        let set_id = store
            .create_backup_set(
                job_id,
                tape_id,
                backup_type,
                false,
                None,
                false,
                Compression::None,
                parent,
            )
            .unwrap();
        store.set_backup_set_start_block(set_id, 0).unwrap();
        let entries: Vec<_> = files
            .iter()
            .map(|(path, size)| tbe_catalog::NewCatalogEntry {
                file_path: path.to_string(),
                file_size: *size,
                file_mode: 0o644,
                mod_time: 0,
                checksum: "deadbeef".to_string(),
            })
            .collect();
        store.insert_entries_batch(set_id, &entries).unwrap();
        store
            .finalize_backup_set(set_id, BackupSetStatus::Completed, files.len() as u64, 0, None, None)
            .unwrap();
        set_id
    }

    #[test]
    fn restoring_the_latest_set_with_no_parent_is_just_itself() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (job_id, pool_id) = setup_job(&store);
        let tape_id = new_tape(&store, pool_id, "T1");
        complete_set(&store, job_id, tape_id, BackupType::Full, None, &[("a.txt", 5)]);

        let plan = build_plan(&store, job_id, None, &[]).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].entries.len(), 1);
    }

    #[test]
    fn incremental_restore_expands_to_full_plus_incremental() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (job_id, pool_id) = setup_job(&store);
        let tape_id = new_tape(&store, pool_id, "T1");
        let full_id = complete_set(
            &store,
            job_id,
            tape_id,
            BackupType::Full,
            None,
            &[("a.txt", 5), ("b.txt", 5)],
        );
        complete_set(
            &store,
            job_id,
            tape_id,
            BackupType::Incremental,
            Some(full_id),
            &[("b.txt", 6), ("c.txt", 1)],
        );

        let plan = build_plan(&store, job_id, None, &[]).unwrap();
        assert_eq!(plan.steps.len(), 2);
        let all_paths: Vec<_> = plan
            .steps
            .iter()
            .flat_map(|s| s.entries.iter().map(|e| e.file_path.clone()))
            .collect();
        assert_eq!(all_paths, vec!["a.txt", "b.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn folder_prefix_filters_entries_across_the_chain() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (job_id, pool_id) = setup_job(&store);
        let tape_id = new_tape(&store, pool_id, "T1");
        complete_set(
            &store,
            job_id,
            tape_id,
            BackupType::Full,
            None,
            &[("photos/a.jpg", 5), ("docs/b.txt", 5)],
        );

        let plan = build_plan(&store, job_id, None, &["photos".to_string()]).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].entries.len(), 1);
        assert_eq!(plan.steps[0].entries[0].file_path, "photos/a.jpg");
    }

    #[test]
    fn unmatched_paths_produce_an_error_not_an_empty_plan() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (job_id, pool_id) = setup_job(&store);
        let tape_id = new_tape(&store, pool_id, "T1");
        complete_set(&store, job_id, tape_id, BackupType::Full, None, &[("a.txt", 5)]);

        assert!(build_plan(&store, job_id, None, &["nothere".to_string()]).is_err());
    }
}
