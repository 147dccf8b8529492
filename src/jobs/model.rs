//! Scheduled job definitions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::JobContext;
use crate::error::JobError;
use crate::runs::RunStatus;

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    /// Cron expression (seconds field first). `None` means manual only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Notes the agent carries between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            prompt: prompt.into(),
            schedule: None,
            notes: None,
            enabled: true,
            last_run_at: None,
            last_run_status: None,
            next_fire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: attach a cron schedule and compute the first fire time.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Result<Self, JobError> {
        let schedule = schedule.into();
        self.next_fire_at = next_cron_fire(&schedule)?;
        self.schedule = Some(schedule);
        Ok(self)
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Context handed to the execution step.
    pub fn context(&self) -> JobContext {
        JobContext::new(self.id, &self.name, &self.prompt)
            .with_user(&self.user_id)
            .with_notes(self.notes.clone())
    }
}

/// Parse a cron expression and compute the next fire time from now.
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, JobError> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| JobError::InvalidSchedule {
            schedule: schedule.to_string(),
            reason: e.to_string(),
        })?;
    Ok(cron_schedule.upcoming(Utc).next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_cron_fire_valid() {
        let next = next_cron_fire("0 0 9 * * MON-FRI").unwrap();
        assert!(next.is_some_and(|t| t > Utc::now()));
    }

    #[test]
    fn next_cron_fire_invalid() {
        assert!(matches!(
            next_cron_fire("not a cron"),
            Err(JobError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn context_carries_notes_and_owner() {
        let job = ScheduledJob::new("alice", "inbox sweep", "Triage the inbox")
            .with_notes("Archived newsletters last time");
        let ctx = job.context();
        assert_eq!(ctx.job_id, job.id);
        assert_eq!(ctx.user_id, "alice");
        assert_eq!(ctx.notes.as_deref(), Some("Archived newsletters last time"));
        assert!(ctx.run_id.is_none());
    }

    #[test]
    fn schedule_sets_first_fire() {
        let job = ScheduledJob::new("u", "n", "p")
            .with_schedule("0 */5 * * * *")
            .unwrap();
        assert!(job.next_fire_at.is_some());
        assert!(job.enabled);
    }
}
