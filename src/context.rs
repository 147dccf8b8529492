//! Job context handed to the execution step and to tools.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read-only view of a scheduled job for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: Uuid,
    /// Set once the run record exists.
    pub run_id: Option<Uuid>,
    /// User that owns the job and receives its notifications.
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    /// Notes carried over from previous runs.
    pub notes: Option<String>,
}

impl JobContext {
    pub fn new(job_id: Uuid, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            job_id,
            run_id: None,
            user_id: "default".to_string(),
            name: name.into(),
            prompt: prompt.into(),
            notes: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}
