//! `Database` trait: the single async interface for persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::ScheduledJob;
use crate::runs::{JobOutcome, JobRun, Notification};

#[async_trait]
pub trait Database: Send + Sync {
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Scheduled jobs ──────────────────────────────────────────────

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, DatabaseError>;

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Enabled jobs whose next fire time is at or before `now`.
    async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Move `next_fire_at` from `expected` to `next`. Returns false if another
    /// caller already moved it.
    async fn advance_next_fire(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &JobRun) -> Result<(), DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>, DatabaseError>;

    /// Most recent runs of a job, newest first.
    async fn list_runs(&self, job_id: Uuid, limit: u32) -> Result<Vec<JobRun>, DatabaseError>;

    /// Runs still `running` that started before `started_before`.
    async fn list_stale_runs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, DatabaseError>;

    /// Set the stream identity of a running run whose stream is unset or
    /// already equal to `stream_id`. Returns the number of rows changed.
    async fn set_run_stream(&self, run_id: Uuid, stream_id: &str) -> Result<u64, DatabaseError>;

    /// Apply an outcome to a running run in one transaction: terminal status,
    /// outcome fields, cleared stream, notifications and job notes.
    ///
    /// Returns false without writing anything if the run is already terminal.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError>;

    async fn clear_run_stream(&self, run_id: Uuid) -> Result<(), DatabaseError>;

    async fn list_notifications(&self, run_id: Uuid) -> Result<Vec<Notification>, DatabaseError>;
}
