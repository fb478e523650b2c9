//! Tape Allocator.
//!
//! Grounded on the teacher's `src/tape/media_pool.rs::alloc_writable_media`:
//! picks the least-used non-full tape in the pool, falling back to a blank
//! one, and never hands back a tape the caller has already tried and
//! rejected (e.g. because the operator loaded the wrong one).

use anyhow::{anyhow, Result};

use tbe_catalog::CatalogStore;
use tbe_types::{Id, Tape, TapeStatus};

/// Picks the next tape to write to within `pool_id`, excluding anything in
/// `exclude`. `list_tapes_in_pool` already orders least-used-first, so the
/// first eligible candidate is the allocation.
pub fn allocate_tape(store: &CatalogStore, pool_id: Id, exclude: &[Id]) -> Result<Tape> {
    let candidates = store.list_tapes_in_pool(pool_id)?;
    candidates
        .into_iter()
        .filter(|t| matches!(t.status, TapeStatus::Active | TapeStatus::Blank))
        .filter(|t| t.remaining_capacity() > 0)
        .find(|t| !exclude.contains(&t.id))
        .ok_or_else(|| anyhow!("no available tape in pool {pool_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbe_types::AllocationPolicy;
    use uuid::Uuid;

    fn setup(store: &CatalogStore) -> Id {
        store
            .create_pool("daily", 30, true, AllocationPolicy::Continue)
            .unwrap()
    }

    #[test]
    fn picks_least_used_tape() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = setup(&store);
        let t1 = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000)
            .unwrap();
        let t2 = store
            .create_tape(Uuid::new_v4(), "T2", None, pool_id, 1_000)
            .unwrap();
        store.add_tape_usage(t1, 500, 1).unwrap();

        let picked = allocate_tape(&store, pool_id, &[]).unwrap();
        assert_eq!(picked.id, t2);
    }

    #[test]
    fn excludes_rejected_tapes() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = setup(&store);
        let t1 = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000)
            .unwrap();

        let err = allocate_tape(&store, pool_id, &[t1]).unwrap_err();
        assert!(err.to_string().contains("no available tape"));
    }

    #[test]
    fn full_tapes_are_not_allocated() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = setup(&store);
        let t1 = store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000)
            .unwrap();
        store.add_tape_usage(t1, 1_000, 1).unwrap();
        store.set_tape_status(t1, TapeStatus::Full).unwrap();

        assert!(allocate_tape(&store, pool_id, &[]).is_err());
    }
}
