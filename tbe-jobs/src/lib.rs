//! Job Lifecycle Manager and Event Bus.
//!
//! Grounded on the teacher's `src/backup/` task-tree orchestration,
//! generalized to drive the Source Scanner, Checksum Worker Pool and
//! Spanning Coordinator (`tbe-spanning`) through one cancellable execution
//! context per job run.

mod events;
mod manager;
mod notification;
mod progress;

pub use events::EventBus;
pub use manager::{EngineConfig, JobHandle, JobManager};
pub use notification::{LoggingNotificationSender, NotificationSender};
pub use progress::JobProgress;
