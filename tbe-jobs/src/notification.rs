//! `NotificationSender` — `spec.md` §6 collaborator interface.
//!
//! Fire-and-forget: callers never propagate a notification failure into the
//! job's own error path, they only log it.

pub trait NotificationSender: Send + Sync {
    fn send_tape_change_required(
        &self,
        job_name: &str,
        current_label: &str,
        reason: &str,
        expected_next_label: Option<&str>,
    );

    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str);
}

/// Default sender that just logs. Real delivery (email, webhook, ...) is
/// outside this engine's scope.
pub struct LoggingNotificationSender;

impl NotificationSender for LoggingNotificationSender {
    fn send_tape_change_required(
        &self,
        job_name: &str,
        current_label: &str,
        reason: &str,
        expected_next_label: Option<&str>,
    ) {
        log::info!(
            "job {job_name}: tape change required (current={current_label}, reason={reason}, expected_next={:?})",
            expected_next_label
        );
    }

    fn send_wrong_tape(&self, expected_label: &str, actual_label: &str) {
        log::warn!("wrong tape loaded: expected {expected_label}, found {actual_label}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_sender_does_not_panic() {
        let sender = LoggingNotificationSender;
        sender.send_tape_change_required("nightly", "TAPE01", "capacity exhausted", Some("TAPE02"));
        sender.send_wrong_tape("TAPE02", "TAPE09");
    }
}
