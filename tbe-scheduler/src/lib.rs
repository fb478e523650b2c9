//! Cron-driven dispatch loop: polls the job table, skips anything already
//! running, and persists `last_run_at`/`next_run_at` alongside each job.
//! Schedules are conventional five/six-field cron expressions, parsed with
//! the `cron` crate.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

use tbe_catalog::CatalogStore;
use tbe_jobs::JobManager;
use tbe_tape::TapeDriver;
use tbe_types::{Id, Job};

/// Computes the next fire time strictly after `after`, in Unix seconds.
pub fn next_run_after(schedule_cron: &str, after: i64) -> Result<i64> {
    let schedule = Schedule::from_str(schedule_cron)
        .with_context(|| format!("invalid cron expression {schedule_cron:?}"))?;
    let after_dt: DateTime<Utc> = DateTime::from_timestamp(after, 0)
        .ok_or_else(|| anyhow::anyhow!("timestamp {after} out of range"))?;
    schedule
        .after(&after_dt)
        .next()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| anyhow::anyhow!("cron expression {schedule_cron:?} has no future occurrence"))
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Parses every enabled job's `schedule_cron` and stores `next_run_at` for
/// any job missing one. Run at startup and again whenever a job's schedule
/// is mutated.
pub fn refresh_schedules(store: &CatalogStore) -> Result<()> {
    let now = now_unix();
    for job in store.list_enabled_jobs()? {
        if job.next_run_at.is_some() {
            continue;
        }
        match next_run_after(&job.schedule_cron, now) {
            Ok(next) => store.set_job_schedule_state(job.id, job.last_run_at, Some(next))?,
            Err(err) => {
                log::warn!("job {} ({}) has an unschedulable cron expression: {err:#}", job.id, job.name);
            }
        }
    }
    Ok(())
}

/// Collects jobs whose `next_run_at` has arrived.
fn due_jobs(store: &CatalogStore, now: i64) -> Result<Vec<Job>> {
    Ok(store
        .list_enabled_jobs()?
        .into_iter()
        .filter(|job| job.next_run_at.map(|t| t <= now).unwrap_or(false))
        .collect())
}

/// Produces a fresh drive handle for a dispatched job. The scheduler does
/// not own drive handles itself; the claiming job is the sole owner of a
/// drive for the duration of its run, so each tick asks the caller to hand
/// over a device bound to whichever drive the job should use.
pub trait DriveProvider: Send + Sync {
    type Device: TapeDriver;

    fn acquire(&self, job: &Job) -> Result<Self::Device>;
}

/// Drives the cron loop: one call to [`Scheduler::tick`] per wake-up. A job
/// already running is not re-dispatched — at most one execution per job is
/// active at a time, checked against `JobManager`'s active-job map before
/// each dispatch.
pub struct Scheduler {
    store: Arc<CatalogStore>,
    manager: Arc<JobManager>,
}

impl Scheduler {
    pub fn new(store: Arc<CatalogStore>, manager: Arc<JobManager>) -> Self {
        Self { store, manager }
    }

    /// One scheduler tick: refresh any job missing a `next_run_at`, find
    /// jobs due now, and run each to completion (sequentially — the
    /// caller is expected to invoke `tick` from its own polling loop and
    /// may run ticks for distinct jobs concurrently by other means if it
    /// chooses; this engine keeps it simple and serial).
    pub fn tick<P: DriveProvider>(&self, drives: &P) -> Result<Vec<Id>> {
        refresh_schedules(&self.store)?;
        let now = now_unix();
        let mut dispatched = Vec::new();
        for job in due_jobs(&self.store, now)? {
            if self.manager.is_active(job.id) {
                continue;
            }
            let next = next_run_after(&job.schedule_cron, now).ok();
            self.store.set_job_schedule_state(job.id, Some(now), next)?;

            let mut device = match drives.acquire(&job) {
                Ok(device) => device,
                Err(err) => {
                    log::error!("job {} ({}): could not acquire a drive: {err:#}", job.id, job.name);
                    continue;
                }
            };
            dispatched.push(job.id);
            if let Err(err) = self.manager.run_job(job.id, &mut device) {
                log::error!("job {} ({}) failed: {err:#}", job.id, job.name);
            }
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbe_types::{AllocationPolicy, BackupType, Compression};
    use uuid::Uuid;

    #[test]
    fn next_run_after_advances_past_given_instant() {
        // Every minute, on the 0th second.
        let cron_expr = "0 * * * * *";
        let base = 1_700_000_000i64;
        let next = next_run_after(cron_expr, base).unwrap();
        assert!(next > base);
        assert!(next - base <= 60);
    }

    #[test]
    fn next_run_after_rejects_garbage_expression() {
        assert!(next_run_after("not a cron expression", 0).is_err());
    }

    fn test_store() -> CatalogStore {
        CatalogStore::open_in_memory().unwrap()
    }

    fn make_job(store: &CatalogStore, cron_expr: &str) -> Id {
        let pool_id = store
            .create_pool("p", 30, true, AllocationPolicy::Continue)
            .unwrap();
        store
            .create_tape(Uuid::new_v4(), "T1", None, pool_id, 1_000_000_000)
            .unwrap();
        let source_id = store
            .create_source("s", "local", "/tmp/doesnotmatter", &[], &[])
            .unwrap();
        store
            .create_job(
                "j",
                source_id,
                pool_id,
                BackupType::Full,
                cron_expr,
                30,
                Compression::None,
                false,
                None,
            )
            .unwrap()
    }

    #[test]
    fn refresh_schedules_fills_in_missing_next_run_at() {
        let store = test_store();
        let job_id = make_job(&store, "0 * * * * *");
        assert!(store.get_job(job_id).unwrap().next_run_at.is_none());

        refresh_schedules(&store).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert!(job.next_run_at.is_some());
    }

    #[test]
    fn refresh_schedules_skips_jobs_that_already_have_a_next_run_at() {
        let store = test_store();
        let job_id = make_job(&store, "0 * * * * *");
        store.set_job_schedule_state(job_id, None, Some(42)).unwrap();

        refresh_schedules(&store).unwrap();

        assert_eq!(store.get_job(job_id).unwrap().next_run_at, Some(42));
    }

    #[test]
    fn due_jobs_only_returns_jobs_whose_next_run_at_has_arrived() {
        let store = test_store();
        let due_id = make_job(&store, "0 * * * * *");
        let not_due_id = make_job(&store, "0 * * * * *");
        store.set_job_schedule_state(due_id, None, Some(1_000)).unwrap();
        store
            .set_job_schedule_state(not_due_id, None, Some(9_999_999_999))
            .unwrap();

        let due = due_jobs(&store, 1_000).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, due_id);
    }
}
