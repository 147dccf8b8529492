//! Run record state machine on top of the `Database` trait.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, JobError};
use crate::runs::model::{JobOutcome, JobRun, Notification, RunStatus};
use crate::store::Database;

/// Creates, attaches, finalizes and clears job runs.
#[derive(Clone)]
pub struct RunRepository {
    db: Arc<dyn Database>,
}

impl RunRepository {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Insert a new `running` record with no stream and no outcome.
    pub async fn create_run(&self, job_id: Uuid) -> Result<Uuid, Error> {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_id,
            status: RunStatus::Running,
            stream_id: None,
            started_at: Utc::now(),
            outcome: None,
        };
        self.db.insert_run(&run).await?;
        info!(run_id = %run.id, job_id = %job_id, "Run created");
        Ok(run.id)
    }

    /// Record the stream identity of a running run.
    ///
    /// Repeating the same value is a no-op. A different value, or a run that
    /// is no longer running, is rejected.
    pub async fn attach_stream(&self, run_id: Uuid, stream_id: &str) -> Result<(), Error> {
        if self.db.set_run_stream(run_id, stream_id).await? == 1 {
            debug!(run_id = %run_id, stream_id, "Stream attached");
            return Ok(());
        }

        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: run_id,
                state: run.status.to_string(),
                target: "stream attached".to_string(),
            }
            .into());
        }
        Err(JobError::StreamConflict {
            run_id,
            existing: run.stream_id.unwrap_or_default(),
            requested: stream_id.to_string(),
        }
        .into())
    }

    /// Apply an outcome. Returns the resulting status.
    ///
    /// Safe to repeat: once a run is terminal, later calls change nothing and
    /// report the status already recorded.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<RunStatus, Error> {
        if self.db.finalize_run(run_id, job_id, outcome).await? {
            let status = outcome.run_status();
            info!(
                run_id = %run_id,
                job_id = %job_id,
                status = %status,
                notifications = outcome.notifications.len(),
                "Run finalized"
            );
            return Ok(status);
        }

        let run = self.require_run(run_id).await?;
        debug!(run_id = %run_id, status = %run.status, "Run already finalized");
        Ok(run.status)
    }

    /// Best-effort removal of the stream identity. Never fails.
    pub async fn clear_stream(&self, run_id: Uuid) {
        match self.db.clear_run_stream(run_id).await {
            Ok(()) => info!(run_id = %run_id, "Stream identity cleared"),
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to clear stream identity"),
        }
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<JobRun>, Error> {
        Ok(self.db.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, job_id: Uuid, limit: u32) -> Result<Vec<JobRun>, Error> {
        Ok(self.db.list_runs(job_id, limit).await?)
    }

    pub async fn notifications(&self, run_id: Uuid) -> Result<Vec<Notification>, Error> {
        Ok(self.db.list_notifications(run_id).await?)
    }

    async fn require_run(&self, run_id: Uuid) -> Result<JobRun, Error> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| JobError::RunNotFound { id: run_id }.into())
    }
}
