//! The side-effecting steps of a job run.
//!
//! Every identifier and every I/O call of a run happens in here, so the
//! workflow in `job_run` only sequences results. Each step is written to be
//! invoked more than once by the retry loop.

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;
use uuid::Uuid;

use crate::agent::JobExecutor;
use crate::context::JobContext;
use crate::error::{Error, JobError};
use crate::runs::{JobOutcome, RunRepository, RunStatus};
use crate::store::Database;
use crate::stream::ProgressHub;

const STREAM_SUFFIX_LEN: usize = 8;

/// Stream identity for a run: unique across concurrent runs of the same job.
pub fn stream_identity(job_id: Uuid, run_id: Uuid) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STREAM_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("job-{job_id}-{run_id}-{suffix}")
}

/// Step implementations shared by the workflow and recovery.
#[derive(Clone)]
pub struct JobActivities {
    db: Arc<dyn Database>,
    runs: RunRepository,
    executor: Arc<JobExecutor>,
    streams: ProgressHub,
}

impl JobActivities {
    pub fn new(db: Arc<dyn Database>, executor: Arc<JobExecutor>, streams: ProgressHub) -> Self {
        Self {
            runs: RunRepository::new(Arc::clone(&db)),
            db,
            executor,
            streams,
        }
    }

    pub fn runs(&self) -> &RunRepository {
        &self.runs
    }

    pub fn streams(&self) -> &ProgressHub {
        &self.streams
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Read-only: prompt, notes and owner of an enabled job.
    pub async fn load_job_context(&self, job_id: Uuid) -> Result<JobContext, Error> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;
        if !job.enabled {
            return Err(JobError::Disabled { id: job_id }.into());
        }
        Ok(job.context())
    }

    pub async fn create_run(&self, job_id: Uuid) -> Result<Uuid, Error> {
        self.runs.create_run(job_id).await
    }

    /// Generate and attach the run's stream identity.
    ///
    /// A retry after a lost acknowledgement finds the identity already
    /// recorded and returns it instead of minting another.
    pub async fn allocate_stream(&self, job_id: Uuid, run_id: Uuid) -> Result<String, Error> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or(JobError::RunNotFound { id: run_id })?;
        let stream_id = match run.stream_id {
            Some(existing) => {
                debug!(run_id = %run_id, stream_id = %existing, "Reusing stream identity");
                existing
            }
            None => stream_identity(job_id, run_id),
        };
        self.runs.attach_stream(run_id, &stream_id).await?;
        Ok(stream_id)
    }

    pub async fn execute_job(&self, ctx: &JobContext, stream_id: &str) -> Result<JobOutcome, Error> {
        self.executor.execute(ctx, stream_id).await
    }

    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<RunStatus, Error> {
        self.runs.finalize(run_id, job_id, outcome).await
    }

    /// Last resort after a failed finalize. Never fails.
    pub async fn clear_stream(&self, run_id: Uuid) {
        self.runs.clear_stream(run_id).await;
    }

    /// End the progress channel so attached readers see end-of-stream.
    pub async fn close_stream(&self, stream_id: &str) {
        self.streams.close(stream_id).await;
    }
}
