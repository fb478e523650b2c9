//! Restore Engine.
//!
//! Resolves catalog entries, then streams tar back out through the inverse
//! pipeline. The wrong-tape wait reuses the shape of
//! `tbe-spanning::coordinator`'s tape-change poll loop without sharing the
//! trait, to avoid a dependency cycle between sibling crates.

mod plan;
mod run;

pub use plan::{build_plan, PlanStep, RestorePlan};
pub use run::{run_restore, RestoreOutcome, RestoreRequest};

use std::sync::{Arc, Mutex};

/// Notification collaborator, scoped to the one event restore raises.
pub trait RestoreNotifier: Send + Sync {
    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str);
}

pub struct LoggingRestoreNotifier;

impl RestoreNotifier for LoggingRestoreNotifier {
    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str) {
        log::warn!("wrong tape loaded for restore: expected {expected_label}, found {actual_label}");
    }
}

/// Test/CLI helper that records every notification instead of logging it.
#[derive(Default)]
pub struct RecordingRestoreNotifier {
    pub wrong_tape: Mutex<Vec<(String, String)>>,
}

impl RestoreNotifier for RecordingRestoreNotifier {
    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str) {
        self.wrong_tape
            .lock()
            .unwrap()
            .push((expected_label.to_string(), actual_label.to_string()));
    }
}

impl RecordingRestoreNotifier {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
