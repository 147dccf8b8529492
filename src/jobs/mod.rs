//! Scheduled jobs: the definitions runs are made from, and the cron trigger
//! that starts them.

pub mod model;
pub mod trigger;

pub use model::{ScheduledJob, next_cron_fire};
pub use trigger::{check_due_jobs, spawn_cron_ticker};
