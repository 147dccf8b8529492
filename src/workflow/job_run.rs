//! The `run_job` workflow.
//!
//! ```text
//! load context -> create run -> allocate stream -> execute -> finalize
//!                                    \______________ failure __________/
//!                                     normalize -> finalize failed
//!                                                   (or clear stream)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::agent::JobExecutor;
use crate::context::JobContext;
use crate::durable::{ActivityOptions, RetryPolicy, run_activity};
use crate::error::{Error, JobError};
use crate::normalize::normalize_error;
use crate::runs::{JobOutcome, JobRun, RunStatusView};
use crate::store::Database;
use crate::stream::ProgressHub;
use crate::workflow::activities::JobActivities;

/// Steps other than execution that a run may go through: load context,
/// create run, allocate stream, finalize, and the failure finalize.
const BOOKKEEPING_STEPS: u32 = 5;

/// Per-step options. Execution gets the long timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOptions {
    pub step: ActivityOptions,
    pub execute: ActivityOptions,
}

impl WorkflowOptions {
    /// A timed-out execution attempt may already have run tools, so it is
    /// never started again. Failures before the loop (tool loading) still retry.
    pub fn new(retry: RetryPolicy, step_timeout: Duration, execute_timeout: Duration) -> Self {
        Self {
            step: ActivityOptions::new(step_timeout, retry.clone()),
            execute: ActivityOptions::new(execute_timeout, retry).with_non_retryable(&["timeout"]),
        }
    }

    /// Upper bound on how long one `run_job` can keep a run `running`.
    pub fn worst_case_run_duration(&self) -> Duration {
        self.step.worst_case_duration() * BOOKKEEPING_STEPS + self.execute.worst_case_duration()
    }
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            Duration::from_secs(300),
            Duration::from_secs(600),
        )
    }
}

/// What `run_job` reports to the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunResult {
    pub success: bool,
    pub summary: String,
    pub run_id: Uuid,
}

/// Sequences the steps of each run and owns the failure path.
pub struct Orchestrator {
    activities: JobActivities,
    options: WorkflowOptions,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        executor: Arc<JobExecutor>,
        streams: ProgressHub,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            activities: JobActivities::new(db, executor, streams),
            options,
        }
    }

    pub fn activities(&self) -> &JobActivities {
        &self.activities
    }

    pub fn streams(&self) -> &ProgressHub {
        self.activities.streams()
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        self.activities.db()
    }

    /// Run a job once, start to finish.
    ///
    /// Failures before the run record exists propagate untouched. After that,
    /// every path leaves the run terminal (or at least stream-less) and a
    /// failure returns the error that caused it, not a bookkeeping error.
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobRunResult, Error> {
        let acts = &self.activities;
        let ctx = run_activity("load_job_context", &self.options.step, move |_| {
            acts.load_job_context(job_id)
        })
        .await?;

        let run_id =
            run_activity("create_run", &self.options.step, move |_| acts.create_run(job_id)).await?;

        let span = info_span!("job_run", job_id = %job_id, run_id = %run_id);
        self.run_created(ctx.with_run(run_id), run_id)
            .instrument(span)
            .await
    }

    async fn run_created(&self, ctx: JobContext, run_id: Uuid) -> Result<JobRunResult, Error> {
        let job_id = ctx.job_id;
        let mut stream_id = None;

        let result = match self.execute_and_finalize(&ctx, run_id, &mut stream_id).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.record_failure(run_id, job_id, &err).await;
                Err(err)
            }
        };

        if let Some(stream_id) = stream_id {
            self.activities.close_stream(&stream_id).await;
        }
        result
    }

    async fn execute_and_finalize(
        &self,
        ctx: &JobContext,
        run_id: Uuid,
        stream_slot: &mut Option<String>,
    ) -> Result<JobRunResult, Error> {
        let acts = &self.activities;
        let job_id = ctx.job_id;

        let stream_id = run_activity("allocate_stream", &self.options.step, move |_| {
            acts.allocate_stream(job_id, run_id)
        })
        .await?;
        *stream_slot = Some(stream_id.clone());
        info!(stream_id = %stream_id, "Run started");

        let stream = stream_id.as_str();
        let outcome = run_activity("execute_job", &self.options.execute, move |_| {
            acts.execute_job(ctx, stream)
        })
        .await?;

        let outcome_ref = &outcome;
        let status = run_activity("finalize_run", &self.options.step, move |_| {
            acts.finalize_run(run_id, job_id, outcome_ref)
        })
        .await?;

        info!(status = %status, success = outcome.success, "Run finished");
        Ok(JobRunResult {
            success: outcome.success,
            summary: outcome.summary,
            run_id,
        })
    }

    /// Finalize as failed; if even that fails, clear the stream identity.
    async fn record_failure(&self, run_id: Uuid, job_id: Uuid, err: &Error) {
        let detail = normalize_error(err);
        warn!(
            error = %detail.message,
            code = detail.code.as_deref().unwrap_or("unknown"),
            "Run failed"
        );

        let outcome = JobOutcome::failed(detail, 0);
        let acts = &self.activities;
        let outcome_ref = &outcome;
        let finalized = run_activity("finalize_run", &self.options.step, move |_| {
            acts.finalize_run(run_id, job_id, outcome_ref)
        })
        .await;

        if let Err(finalize_err) = finalized {
            error!(
                error = %finalize_err,
                original = %err,
                "Failed to record run failure, clearing stream identity"
            );
            acts.clear_stream(run_id).await;
        }
    }

    /// Status of a run for UI polling, with the indicators currently shown.
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunStatusView, Error> {
        let run = self
            .activities
            .runs()
            .get(run_id)
            .await?
            .ok_or(JobError::RunNotFound { id: run_id })?;
        let progress = match &run.stream_id {
            Some(stream_id) => self.streams().current_indicators(stream_id).await,
            None => Vec::new(),
        };
        let mut view = RunStatusView::from(run);
        view.progress = progress;
        Ok(view)
    }

    pub async fn list_runs(&self, job_id: Uuid, limit: u32) -> Result<Vec<JobRun>, Error> {
        self.activities.runs().list_runs(job_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::agent::COMPLETE_JOB_TOOL;
    use crate::error::LlmError;
    use crate::jobs::ScheduledJob;
    use crate::normalize::ErrorDetail;
    use crate::runs::{NewNotification, RunStatus};
    use crate::store::LibSqlBackend;
    use crate::stream::MemoryStreamBackend;
    use crate::testing::{
        CountingTool, FailingToolbox, FlakyDatabase, ScriptedLlm, StaticToolbox,
        UnavailableStreamBackend,
    };
    use crate::tools::{Tool, Toolbox};

    fn fast_options() -> WorkflowOptions {
        WorkflowOptions::new(
            RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 2.0,
                max_interval: Duration::from_millis(5),
            },
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
    }

    struct Harness {
        db: Arc<FlakyDatabase>,
        orchestrator: Orchestrator,
        job: ScheduledJob,
        tool: Arc<CountingTool>,
    }

    async fn harness_with(
        llm: ScriptedLlm,
        streams: ProgressHub,
        toolbox: Option<Arc<dyn Toolbox>>,
    ) -> Harness {
        harness_with_options(llm, streams, toolbox, fast_options()).await
    }

    async fn harness_with_options(
        llm: ScriptedLlm,
        streams: ProgressHub,
        toolbox: Option<Arc<dyn Toolbox>>,
        options: WorkflowOptions,
    ) -> Harness {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        let db = Arc::new(FlakyDatabase::new(inner));
        let job = ScheduledJob::new("alice", "inbox sweep", "Send the weekly emails")
            .with_notes("old notes");
        db.create_job(&job).await.unwrap();

        let tool = Arc::new(CountingTool::new("lookup"));
        let toolbox: Arc<dyn Toolbox> = match toolbox {
            Some(toolbox) => toolbox,
            None => Arc::new(StaticToolbox::new(vec![tool.clone() as Arc<dyn Tool>])),
        };
        let executor = Arc::new(JobExecutor::new(Arc::new(llm), toolbox, streams.clone()));
        let orchestrator = Orchestrator::new(db.clone(), executor, streams, options);
        Harness {
            db,
            orchestrator,
            job,
            tool,
        }
    }

    async fn harness(llm: ScriptedLlm) -> Harness {
        let streams = ProgressHub::new(Arc::new(MemoryStreamBackend::new()));
        harness_with(llm, streams, None).await
    }

    fn sent_three_emails() -> ScriptedLlm {
        ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Ok(ScriptedLlm::tool_call(
                COMPLETE_JOB_TOOL,
                json!({
                    "summary": "Sent 3 emails",
                    "status": "success",
                    "notes": "new notes",
                    "notifications": [
                        {"title": "Emails sent", "body": "3 delivered"},
                        {"title": "Follow up", "body": "Bob replied", "priority": "high"}
                    ]
                }),
            )),
        ])
    }

    #[tokio::test]
    async fn completed_run_records_outcome_and_notifications() {
        let h = harness(sent_three_emails()).await;

        let result = h.orchestrator.run_job(h.job.id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.summary, "Sent 3 emails");

        let run = h.db.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.stream_id.is_none());
        let outcome = run.outcome.unwrap();
        assert_eq!(outcome.summary, "Sent 3 emails");
        assert_eq!(outcome.notifications_emitted, 2);
        assert_eq!(outcome.tool_calls_executed, 1);
        assert_eq!(outcome.model_id.as_deref(), Some("scripted"));

        let notifications = h.db.list_notifications(result.run_id).await.unwrap();
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|n| n.user_id == "alice"));

        let job = h.db.get_job(h.job.id).await.unwrap().unwrap();
        assert_eq!(job.notes.as_deref(), Some("new notes"));
        assert_eq!(job.last_run_status, Some(RunStatus::Completed));
        assert!(job.last_run_at.is_some());
    }

    #[tokio::test]
    async fn mid_loop_failure_finalizes_failed_with_partial_count() {
        let llm = ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Err(LlmError::Io(std::io::Error::other("upstream connection reset"))),
        ]);
        let h = harness(llm).await;

        let result = h.orchestrator.run_job(h.job.id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.summary, "Execution failed: upstream connection reset");

        let run = h.db.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.stream_id.is_none());
        let outcome = run.outcome.unwrap();
        assert_eq!(outcome.tool_calls_executed, 2);
        assert_eq!(
            outcome.error_details.unwrap().message,
            "upstream connection reset"
        );

        let job = h.db.get_job(h.job.id).await.unwrap().unwrap();
        assert_eq!(job.notes.as_deref(), Some("old notes"));
        assert_eq!(h.tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn step_ceiling_completes_with_warning() {
        let h = harness(ScriptedLlm::always_text("Working on it")).await;

        let result = h.orchestrator.run_job(h.job.id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.summary, "Working on it");

        let run = h.db.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.outcome.unwrap().warnings.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_stream_store_still_completes() {
        let streams = ProgressHub::new(Arc::new(UnavailableStreamBackend));
        let h = harness_with(sent_three_emails(), streams, None).await;

        let result = h.orchestrator.run_job(h.job.id).await.unwrap();
        let run = h.db.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn create_run_failure_propagates_without_a_run() {
        let h = harness(sent_three_emails()).await;
        h.db.fail_insert_run.store(true, Ordering::SeqCst);

        let err = h.orchestrator.run_job(h.job.id).await.unwrap_err();
        match &err {
            Error::Activity(failure) => {
                assert_eq!(failure.activity, "create_run");
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("expected activity failure, got {other:?}"),
        }
        assert!(h.db.list_runs(h.job.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_failure_clears_stream_and_returns_original_error() {
        let h = harness(sent_three_emails()).await;
        h.db.fail_finalize.store(true, Ordering::SeqCst);

        let err = h.orchestrator.run_job(h.job.id).await.unwrap_err();
        match &err {
            Error::Activity(failure) => assert_eq!(failure.activity, "finalize_run"),
            other => panic!("expected activity failure, got {other:?}"),
        }
        assert_eq!(normalize_error(&err).message, "Query failed: disk I/O error");

        let runs = h.db.list_runs(h.job.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Running);
        assert!(runs[0].stream_id.is_none());
        assert!(h.db.list_notifications(runs[0].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execution_infrastructure_failure_is_recorded_and_rethrown() {
        let streams = ProgressHub::new(Arc::new(MemoryStreamBackend::new()));
        let h = harness_with(sent_three_emails(), streams, Some(Arc::new(FailingToolbox))).await;

        let err = h.orchestrator.run_job(h.job.id).await.unwrap_err();
        assert!(matches!(&err, Error::Activity(f) if f.activity == "execute_job" && f.attempts == 3));

        let runs = h.db.list_runs(h.job.id, 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].stream_id.is_none());
        let detail = runs[0].outcome.clone().unwrap().error_details.unwrap();
        assert_eq!(detail.message, "Failed to load tools: tool service unreachable");
        assert_eq!(detail.code.as_deref(), Some("tool_load_failed"));
        assert_eq!(detail.context.unwrap()["activity"], "execute_job");
    }

    #[tokio::test]
    async fn timed_out_execution_runs_tools_once_and_fails_the_run() {
        let llm = ScriptedLlm::new(vec![Ok(ScriptedLlm::tool_call("lookup", json!({})))])
            .then_stall();
        let mut options = fast_options();
        options.execute.start_to_close_timeout = Duration::from_millis(200);
        let streams = ProgressHub::new(Arc::new(MemoryStreamBackend::new()));
        let h = harness_with_options(llm, streams, None, options).await;

        let err = h.orchestrator.run_job(h.job.id).await.unwrap_err();
        match &err {
            Error::Activity(failure) => {
                assert_eq!(failure.activity, "execute_job");
                assert_eq!(failure.attempts, 1);
                assert!(matches!(failure.cause(), Some(Error::TimedOut { .. })));
            }
            other => panic!("expected activity failure, got {other:?}"),
        }
        assert_eq!(h.tool.calls.load(Ordering::SeqCst), 1);

        let runs = h.db.list_runs(h.job.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].stream_id.is_none());
        let detail = runs[0].outcome.clone().unwrap().error_details.unwrap();
        assert_eq!(detail.code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn failed_execution_and_failed_finalize_rethrow_the_execution_error() {
        let streams = ProgressHub::new(Arc::new(MemoryStreamBackend::new()));
        let h = harness_with(sent_three_emails(), streams, Some(Arc::new(FailingToolbox))).await;
        h.db.fail_finalize.store(true, Ordering::SeqCst);

        let err = h.orchestrator.run_job(h.job.id).await.unwrap_err();
        match &err {
            Error::Activity(failure) => {
                assert_eq!(failure.activity, "execute_job");
                assert_eq!(failure.cause().map(Error::code), Some("tool_load_failed"));
            }
            other => panic!("expected activity failure, got {other:?}"),
        }
        assert_eq!(
            normalize_error(&err).message,
            "Failed to load tools: tool service unreachable"
        );

        let runs = h.db.list_runs(h.job.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Running);
        assert!(runs[0].stream_id.is_none());
    }

    #[test]
    fn worst_case_run_covers_every_step() {
        let options = WorkflowOptions::new(
            RetryPolicy {
                max_attempts: 2,
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 2.0,
                max_interval: Duration::from_secs(1),
            },
            Duration::from_secs(10),
            Duration::from_secs(100),
        );
        // Five bookkeeping steps of 2 x 10s + 1s, plus 2 x 100s + 1s.
        assert_eq!(options.worst_case_run_duration(), Duration::from_secs(5 * 21 + 201));
        assert_eq!(options.execute.non_retryable_codes, vec!["timeout"]);
    }

    #[tokio::test]
    async fn unknown_and_disabled_jobs_are_rejected() {
        let h = harness(sent_three_emails()).await;
        let err = h.orchestrator.run_job(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let mut disabled = ScheduledJob::new("alice", "off", "nothing");
        disabled.enabled = false;
        h.db.create_job(&disabled).await.unwrap();
        let err = h.orchestrator.run_job(disabled.id).await.unwrap_err();
        assert_eq!(err.code(), "job_disabled");
        assert!(h.db.list_runs(disabled.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_finalize_changes_nothing() {
        let h = harness(sent_three_emails()).await;
        let result = h.orchestrator.run_job(h.job.id).await.unwrap();

        let mut again = JobOutcome::failed(ErrorDetail::new("late"), 0);
        again.notifications = vec![NewNotification::new("Emails sent", "3 delivered")];
        let status = h
            .orchestrator
            .activities()
            .finalize_run(result.run_id, h.job.id, &again)
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(h.db.list_notifications(result.run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_status_view_reports_terminal_run() {
        let h = harness(sent_three_emails()).await;
        let result = h.orchestrator.run_job(h.job.id).await.unwrap();

        let view = h.orchestrator.get_run_status(result.run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Completed);
        assert!(view.stream_id.is_none());
        assert!(view.progress.is_empty());
        assert_eq!(view.outcome.unwrap().summary, "Sent 3 emails");

        let err = h.orchestrator.get_run_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::RunNotFound { .. })));
    }
}
