//! Job execution unit: one bounded tool-calling loop per run.
//!
//! The loop ends when the model calls `complete_job` or when the step
//! ceiling is reached. Failures inside the loop become a failed outcome so
//! the orchestrator always has something to finalize with; only
//! infrastructure failures before the loop starts (loading tools) are
//! returned as errors.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::agent::completion::{
    COMPLETE_JOB_TOOL, JobCompletion, complete_job_definition, parse_completion,
};
use crate::context::JobContext;
use crate::error::Error;
use crate::llm::{ChatMessage, LlmProvider, TokenUsage, ToolCall, ToolCompletionRequest};
use crate::normalize::{ErrorDetail, normalize_error, normalize_panic};
use crate::runs::{JobOutcome, OutcomeStatus};
use crate::stream::{ProgressEvent, ProgressHub, StreamWriter};
use crate::tools::registry::definition_of;
use crate::tools::{Tool, Toolbox};

/// Default step ceiling.
pub const DEFAULT_MAX_STEPS: u32 = 15;

/// Tool output longer than this is cut before it goes back to the model.
const MAX_TOOL_OUTPUT_CHARS: usize = 8_000;

const STATUS_INDICATOR: &str = "status";
const TOOL_INDICATOR: &str = "tool";

const CONTINUE_NUDGE: &str = "Continue working on the job. Use the available tools, and call \
                              complete_job with a summary once you are finished.";

/// Runs a job's prompt through the model until it completes or hits the ceiling.
pub struct JobExecutor {
    llm: Arc<dyn LlmProvider>,
    toolbox: Arc<dyn Toolbox>,
    streams: ProgressHub,
    max_steps: u32,
}

#[derive(Default)]
struct LoopState {
    tool_calls_executed: u32,
    usage: TokenUsage,
    last_text: Option<String>,
}

enum LoopEnd {
    Completed(JobCompletion),
    StepLimit,
}

impl JobExecutor {
    pub fn new(llm: Arc<dyn LlmProvider>, toolbox: Arc<dyn Toolbox>, streams: ProgressHub) -> Self {
        Self {
            llm,
            toolbox,
            streams,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Execute the job, writing progress to `stream_id`.
    pub async fn execute(&self, ctx: &JobContext, stream_id: &str) -> Result<JobOutcome, Error> {
        let trace_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "execute_job",
            job_id = %ctx.job_id,
            run_id = ?ctx.run_id,
            stream_id,
            trace_id = %trace_id,
        );
        self.execute_inner(ctx, stream_id, trace_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        ctx: &JobContext,
        stream_id: &str,
        trace_id: String,
    ) -> Result<JobOutcome, Error> {
        let started = Instant::now();
        let writer = self.streams.create_channel(stream_id).await;
        writer
            .write(
                ProgressEvent::new(STATUS_INDICATOR, format!("Starting {}", ctx.name))
                    .with_icon("play")
                    .with_progress(0),
            )
            .await;

        let tools = match self.toolbox.load(ctx).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "Failed to load tools");
                writer
                    .write(
                        ProgressEvent::new(STATUS_INDICATOR, format!("Error: {e}"))
                            .with_icon("error"),
                    )
                    .await;
                return Err(e.into());
            }
        };
        writer
            .write(
                ProgressEvent::new(
                    STATUS_INDICATOR,
                    format!("Tools ready ({} available)", tools.len()),
                )
                .with_icon("tools")
                .with_progress(5),
            )
            .await;
        info!(tools = tools.len(), max_steps = self.max_steps, "Job execution started");

        let mut state = LoopState::default();
        let result = AssertUnwindSafe(self.run_loop(ctx, &tools, &writer, &mut state))
            .catch_unwind()
            .await;

        let mut outcome = match result {
            Ok(Ok(LoopEnd::Completed(completion))) => completed_outcome(completion),
            Ok(Ok(LoopEnd::StepLimit)) => {
                warn!(
                    max_steps = self.max_steps,
                    "Step limit reached without complete_job"
                );
                let mut outcome = JobOutcome::completed(state.last_text.clone().unwrap_or_else(
                    || format!("Stopped after {} steps without a summary", self.max_steps),
                ));
                outcome.warnings.push(format!(
                    "No explicit completion: step limit of {} reached",
                    self.max_steps
                ));
                outcome
            }
            Ok(Err(e)) => {
                warn!(error = %e, tool_calls = state.tool_calls_executed, "Job execution failed");
                JobOutcome::failed(normalize_error(&e), state.tool_calls_executed)
            }
            Err(payload) => {
                let detail = normalize_panic(payload.as_ref());
                warn!(error = %detail.message, "Job execution panicked");
                JobOutcome::failed(detail, state.tool_calls_executed)
            }
        };

        outcome.tool_calls_executed = state.tool_calls_executed;
        outcome.token_usage = Some(state.usage);
        outcome.model_id = Some(self.llm.model_name().to_string());
        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        outcome.trace_id = Some(trace_id);

        writer.write(ProgressEvent::tombstone(TOOL_INDICATOR)).await;
        let terminal = if outcome.success {
            ProgressEvent::new(STATUS_INDICATOR, "Complete")
                .with_icon("check")
                .with_progress(100)
        } else {
            let message = outcome
                .error_details
                .as_ref()
                .map(|d| d.message.as_str())
                .unwrap_or(outcome.summary.as_str());
            ProgressEvent::new(STATUS_INDICATOR, format!("Error: {message}")).with_icon("error")
        };
        writer.write(terminal).await;

        info!(
            success = outcome.success,
            tool_calls = outcome.tool_calls_executed,
            input_tokens = state.usage.input_tokens,
            output_tokens = state.usage.output_tokens,
            duration_ms = outcome.duration_ms,
            "Job execution finished"
        );
        Ok(outcome)
    }

    async fn run_loop(
        &self,
        ctx: &JobContext,
        tools: &[Arc<dyn Tool>],
        writer: &StreamWriter,
        state: &mut LoopState,
    ) -> Result<LoopEnd, Error> {
        let mut definitions: Vec<_> = tools.iter().map(|t| definition_of(t.as_ref())).collect();
        definitions.push(complete_job_definition());

        let mut messages = vec![
            ChatMessage::system(system_prompt(ctx)),
            ChatMessage::user(ctx.prompt.clone()),
        ];

        for step in 1..=self.max_steps {
            let percent = 5 + (step.saturating_sub(1) * 90 / self.max_steps);
            writer
                .write(
                    ProgressEvent::new(STATUS_INDICATOR, format!("Thinking (step {step})"))
                        .with_icon("brain")
                        .with_progress(u8::try_from(percent).unwrap_or(95)),
                )
                .await;

            let request = ToolCompletionRequest::new(messages.clone(), definitions.clone());
            let response = self.llm.complete_with_tools(request).await?;
            state.usage.add(response.input_tokens, response.output_tokens);

            let text = response
                .content
                .clone()
                .filter(|t| !t.trim().is_empty());
            if let Some(text) = &text {
                state.last_text = Some(text.clone());
            }

            if response.tool_calls.is_empty() {
                debug!(step, "Model replied without tool calls");
                messages.push(ChatMessage::assistant(text.unwrap_or_default()));
                messages.push(ChatMessage::user(CONTINUE_NUDGE));
                continue;
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let mut completion = None;
            for call in &response.tool_calls {
                if call.name == COMPLETE_JOB_TOOL {
                    match parse_completion(&call.arguments) {
                        Ok(parsed) => {
                            messages.push(ChatMessage::tool_result(&call.id, "Completion recorded."));
                            completion = Some(parsed);
                        }
                        Err(reason) => {
                            debug!(step, reason = %reason, "Rejected complete_job call");
                            messages.push(ChatMessage::tool_result(&call.id, format!("Error: {reason}")));
                        }
                    }
                    continue;
                }

                let output = self.run_tool(ctx, tools, call, writer, state).await;
                messages.push(ChatMessage::tool_result(&call.id, output));
            }

            if let Some(completion) = completion {
                info!(step, "Job completed via complete_job");
                return Ok(LoopEnd::Completed(completion));
            }
        }

        Ok(LoopEnd::StepLimit)
    }

    /// Run one tool call. Failures are returned as text for the model.
    async fn run_tool(
        &self,
        ctx: &JobContext,
        tools: &[Arc<dyn Tool>],
        call: &ToolCall,
        writer: &StreamWriter,
        state: &mut LoopState,
    ) -> String {
        let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
            debug!(tool = %call.name, "Model requested unknown tool");
            return format!("Error: unknown tool '{}'", call.name);
        };

        state.tool_calls_executed += 1;
        writer
            .write(ProgressEvent::new(TOOL_INDICATOR, format!("Running {}", call.name)).with_icon("wrench"))
            .await;

        let timeout = tool.execution_timeout();
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, tool.execute(call.arguments.clone(), ctx)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                debug!(tool = %call.name, elapsed_ms, "Tool call succeeded");
                truncate(&output.to_model_text(), MAX_TOOL_OUTPUT_CHARS)
            }
            Ok(Err(e)) => {
                debug!(tool = %call.name, elapsed_ms, error = %e, "Tool call failed");
                format!("Error: {e}")
            }
            Err(_) => {
                debug!(tool = %call.name, elapsed_ms, "Tool call timed out");
                format!("Error: tool '{}' timed out after {:?}", call.name, timeout)
            }
        }
    }
}

fn completed_outcome(completion: JobCompletion) -> JobOutcome {
    let success = completion.success();
    let mut outcome = JobOutcome::completed(completion.summary.clone());
    outcome.success = success;
    outcome.status = completion.status;
    outcome.updated_notes = completion.notes;
    outcome.notifications = completion.notifications;

    if let Some(raw) = completion.unrecognized_status {
        outcome
            .warnings
            .push(format!("Unrecognized completion status '{raw}'"));
    }
    if completion.status == Some(OutcomeStatus::Blocked) {
        let reason = completion
            .blocked_reason
            .clone()
            .unwrap_or_else(|| completion.summary.clone());
        let mut detail = ErrorDetail::new(reason).with_code("blocked");
        if let Some(blocked_reason) = completion.blocked_reason {
            detail = detail.with_context("blockedReason", blocked_reason.into());
        }
        outcome.error_details = Some(detail);
    }
    outcome
}

fn system_prompt(ctx: &JobContext) -> String {
    let mut prompt = format!(
        "You are running the scheduled job \"{}\" on behalf of its owner. Work \
         autonomously with the tools provided. When you are done, call {} exactly once \
         with a short summary, an overall status, any notifications the owner should \
         see, and notes worth remembering for the next run.",
        ctx.name, COMPLETE_JOB_TOOL
    );
    match ctx.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        Some(notes) => {
            prompt.push_str("\n\nNotes from previous runs:\n");
            prompt.push_str(notes);
        }
        None => prompt.push_str("\n\nThis job has no notes from previous runs."),
    }
    prompt
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}… [truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::error::LlmError;
    use crate::runs::{NotificationPriority, RunStatus};
    use crate::stream::MemoryStreamBackend;
    use crate::testing::{
        CountingTool, FailingToolbox, ScriptedLlm, StaticToolbox, UnavailableStreamBackend,
    };

    fn ctx() -> JobContext {
        JobContext::new(Uuid::new_v4(), "inbox sweep", "Archive old newsletters")
            .with_run(Uuid::new_v4())
    }

    fn hub() -> ProgressHub {
        ProgressHub::new(Arc::new(MemoryStreamBackend::new()))
    }

    fn executor(llm: Arc<ScriptedLlm>, tool: Arc<CountingTool>, streams: ProgressHub) -> JobExecutor {
        JobExecutor::new(
            llm,
            Arc::new(StaticToolbox::new(vec![tool as Arc<dyn Tool>])),
            streams,
        )
    }

    #[tokio::test]
    async fn completion_tool_ends_the_loop() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Ok(ScriptedLlm::tool_call(
                COMPLETE_JOB_TOOL,
                json!({
                    "summary": "Sent 3 emails",
                    "status": "success",
                    "notes": "remember bob",
                    "notifications": [
                        {"title": "Sent", "body": "3 emails"},
                        {"title": "Bounce", "body": "1 bounced", "priority": "urgent"}
                    ]
                }),
            )),
        ]));
        let tool = Arc::new(CountingTool::new("lookup"));
        let exec = executor(llm.clone(), tool.clone(), hub());

        let outcome = exec.execute(&ctx(), "job-s1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.summary, "Sent 3 emails");
        assert_eq!(outcome.run_status(), RunStatus::Completed);
        assert_eq!(outcome.notifications.len(), 2);
        assert_eq!(outcome.notifications[1].priority, NotificationPriority::Urgent);
        assert_eq!(outcome.updated_notes.as_deref(), Some("remember bob"));
        assert_eq!(outcome.tool_calls_executed, 1);
        assert_eq!(outcome.model_id.as_deref(), Some("scripted"));
        assert!(outcome.trace_id.is_some());
        assert!(outcome.warnings.is_empty());
        assert_eq!(llm.calls(), 2);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_exactly_at_step_ceiling() {
        let llm = Arc::new(ScriptedLlm::always_text("Still looking into it"));
        let tool = Arc::new(CountingTool::new("lookup"));
        let exec = executor(llm.clone(), tool, hub());
        assert_eq!(exec.max_steps(), 15);

        let outcome = exec.execute(&ctx(), "job-s2").await.unwrap();
        assert_eq!(llm.calls(), 15);
        assert!(outcome.success);
        assert_eq!(outcome.status, Some(OutcomeStatus::Success));
        assert_eq!(outcome.summary, "Still looking into it");
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("step limit of 15"));
    }

    #[tokio::test]
    async fn custom_ceiling_counts_tool_steps_too() {
        let llm = Arc::new(ScriptedLlm::always_tool("lookup"));
        let tool = Arc::new(CountingTool::new("lookup"));
        let exec = executor(llm.clone(), tool.clone(), hub()).with_max_steps(4);

        let outcome = exec.execute(&ctx(), "job-s3").await.unwrap();
        assert_eq!(llm.calls(), 4);
        assert_eq!(outcome.tool_calls_executed, 4);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn error_mid_loop_becomes_failed_outcome() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Err(LlmError::Io(std::io::Error::other("socket hang up"))),
        ]));
        let tool = Arc::new(CountingTool::new("lookup"));
        let exec = executor(llm, tool, hub());

        let outcome = exec.execute(&ctx(), "job-s4").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.run_status(), RunStatus::Failed);
        assert_eq!(outcome.tool_calls_executed, 2);
        assert_eq!(outcome.summary, "Execution failed: socket hang up");
        let detail = outcome.error_details.unwrap();
        assert_eq!(detail.message, "socket hang up");
        assert_eq!(detail.code.as_deref(), Some("llm_request_failed"));
    }

    #[tokio::test]
    async fn tool_failure_is_reported_to_the_model() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({"fail": true}))),
            Ok(ScriptedLlm::tool_call("missing_tool", json!({}))),
            Ok(ScriptedLlm::tool_call(
                COMPLETE_JOB_TOOL,
                json!({"summary": "Gave up on lookup", "status": "partial"}),
            )),
        ]));
        let tool = Arc::new(CountingTool::new("lookup"));
        let exec = executor(llm.clone(), tool, hub());

        let outcome = exec.execute(&ctx(), "job-s5").await.unwrap();
        assert_eq!(outcome.run_status(), RunStatus::Partial);
        assert_eq!(outcome.tool_calls_executed, 1);

        let requests = llm.requests();
        let after_failure = requests[1].messages.last().unwrap();
        assert!(after_failure.content.starts_with("Error:"));
        let after_unknown = requests[2].messages.last().unwrap();
        assert!(after_unknown.content.contains("unknown tool 'missing_tool'"));
    }

    #[tokio::test]
    async fn completion_without_summary_is_rejected() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call(COMPLETE_JOB_TOOL, json!({"status": "success"}))),
            Ok(ScriptedLlm::tool_call(COMPLETE_JOB_TOOL, json!({"summary": "Done now"}))),
        ]));
        let exec = executor(llm.clone(), Arc::new(CountingTool::new("lookup")), hub());

        let outcome = exec.execute(&ctx(), "job-s6").await.unwrap();
        assert_eq!(outcome.summary, "Done now");
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn blocked_completion_records_reason() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(ScriptedLlm::tool_call(
            COMPLETE_JOB_TOOL,
            json!({
                "summary": "Could not reach the mailbox",
                "status": "blocked",
                "blockedReason": "IMAP credentials rejected"
            }),
        ))]));
        let exec = executor(llm, Arc::new(CountingTool::new("lookup")), hub());

        let outcome = exec.execute(&ctx(), "job-s7").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.run_status(), RunStatus::Blocked);
        let detail = outcome.error_details.unwrap();
        assert_eq!(detail.message, "IMAP credentials rejected");
        assert_eq!(detail.context.unwrap()["blockedReason"], "IMAP credentials rejected");
    }

    #[tokio::test]
    async fn unavailable_stream_store_does_not_affect_outcome() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(ScriptedLlm::tool_call(
            COMPLETE_JOB_TOOL,
            json!({"summary": "ok", "status": "success"}),
        ))]));
        let streams = ProgressHub::new(Arc::new(UnavailableStreamBackend));
        let exec = executor(llm, Arc::new(CountingTool::new("lookup")), streams);

        let outcome = exec.execute(&ctx(), "job-s8").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.run_status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn tool_load_failure_is_an_error() {
        let llm = Arc::new(ScriptedLlm::always_text("unused"));
        let exec = JobExecutor::new(llm.clone(), Arc::new(FailingToolbox), hub());

        let err = exec.execute(&ctx(), "job-s9").await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
        assert!(err.is_retryable());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn progress_events_are_written() {
        let streams = hub();
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(ScriptedLlm::tool_call("lookup", json!({}))),
            Ok(ScriptedLlm::tool_call(COMPLETE_JOB_TOOL, json!({"summary": "ok"}))),
        ]));
        let exec = executor(llm, Arc::new(CountingTool::new("lookup")), streams.clone());

        let mut reader = {
            let writer = streams.create_channel("job-s10").await;
            drop(writer);
            streams.attach("job-s10").await.unwrap()
        };
        exec.execute(&ctx(), "job-s10").await.unwrap();
        streams.close("job-s10").await;

        let mut texts = Vec::new();
        while let Some(event) = reader.next().await {
            texts.push(event.text);
        }
        assert!(texts.first().unwrap().starts_with("Starting"));
        assert!(texts.iter().any(|t| t.starts_with("Tools ready")));
        assert!(texts.iter().any(|t| t == "Running lookup"));
        assert_eq!(texts.last().map(String::as_str), Some("Complete"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé… [truncated]");
    }

    #[test]
    fn system_prompt_includes_notes() {
        let with_notes = ctx().with_notes(Some("Skip the weekly digest".into()));
        assert!(system_prompt(&with_notes).contains("Skip the weekly digest"));
        assert!(system_prompt(&ctx()).contains("no notes"));
    }
}
