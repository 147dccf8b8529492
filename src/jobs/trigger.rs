//! Cron trigger: polls for due jobs and starts a run for each.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::jobs::model::next_cron_fire;
use crate::workflow::Orchestrator;

/// Claim every due job and start its run on its own task.
///
/// A job is claimed by moving its `next_fire_at` forward; if another ticker
/// got there first the job is skipped. Returns the number of runs started.
pub async fn check_due_jobs(orchestrator: &Arc<Orchestrator>) -> usize {
    let now = Utc::now();
    let due = match orchestrator.db().list_due_jobs(now).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "Failed to load due jobs");
            return 0;
        }
    };

    let mut started = 0;
    for job in due {
        let Some(expected) = job.next_fire_at else {
            continue;
        };
        let next = match job.schedule.as_deref().map(next_cron_fire).transpose() {
            Ok(next) => next.flatten(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Disabling fire for job with bad schedule");
                None
            }
        };

        match orchestrator.db().advance_next_fire(job.id, expected, next).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Job already claimed");
                continue;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to claim due job");
                continue;
            }
        }

        info!(job_id = %job.id, name = %job.name, "Cron fired");
        let orchestrator = Arc::clone(orchestrator);
        let job_id = job.id;
        tokio::spawn(async move {
            match orchestrator.run_job(job_id).await {
                Ok(result) => debug!(
                    job_id = %job_id,
                    run_id = %result.run_id,
                    success = result.success,
                    "Scheduled run finished"
                ),
                Err(e) => warn!(job_id = %job_id, error = %e, "Scheduled run failed"),
            }
        });
        started += 1;
    }
    started
}

/// Spawn the cron ticker loop.
pub fn spawn_cron_ticker(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            check_due_jobs(&orchestrator).await;
        }
    })
}
