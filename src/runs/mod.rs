//! Job runs: the persisted state machine for one execution attempt.
//!
//! ```text
//! running ──finalize──► completed | partial | failed | blocked
//! ```
//!
//! A run holds a stream identity only while it is running.

pub mod model;
pub mod repository;

pub use model::{
    JobOutcome, JobRun, NewNotification, Notification, NotificationPriority, OutcomeStatus,
    RunOutcome, RunStatus, RunStatusView,
};
pub use repository::RunRepository;
