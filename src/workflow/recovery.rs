//! Startup sweep for runs left `running` by a crashed process.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{ConfigError, Error};
use crate::normalize::ErrorDetail;
use crate::runs::JobOutcome;
use crate::workflow::Orchestrator;

impl Orchestrator {
    /// Finalize runs that started more than `recover_after` ago and never
    /// finished. Returns how many were recovered.
    ///
    /// With `Duration::ZERO` every `running` run is recovered, which is right
    /// whenever this process is the only one using the database: runs are
    /// never resumed, so nothing else will ever finish them.
    pub async fn recover_orphaned_runs(&self, recover_after: Duration) -> Result<usize, Error> {
        let age = chrono::Duration::from_std(recover_after).map_err(|e| {
            ConfigError::InvalidValue {
                key: "recover_after".to_string(),
                message: e.to_string(),
            }
        })?;
        let cutoff = Utc::now() - age;
        let stale = self.db().list_stale_runs(cutoff).await?;

        let mut recovered = 0;
        for run in stale {
            let detail = ErrorDetail::new("Run interrupted before it finished")
                .with_code("interrupted")
                .with_context("startedAt", run.started_at.to_rfc3339().into());
            let outcome = JobOutcome::failed(detail, 0);

            match self.activities().finalize_run(run.id, run.job_id, &outcome).await {
                Ok(status) => {
                    info!(run_id = %run.id, job_id = %run.job_id, status = %status, "Recovered orphaned run");
                    recovered += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Failed to recover orphaned run");
                    self.activities().clear_stream(run.id).await;
                }
            }
            if let Some(stream_id) = &run.stream_id {
                self.activities().close_stream(stream_id).await;
            }
        }
        Ok(recovered)
    }
}
