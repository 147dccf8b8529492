//! Test doubles shared across unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::context::JobContext;
use crate::error::{DatabaseError, LlmError, StreamError, ToolError};
use crate::jobs::ScheduledJob;
use crate::llm::{
    FinishReason, LlmProvider, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use crate::runs::{JobOutcome, JobRun, Notification};
use crate::store::{Database, LibSqlBackend};
use crate::stream::{SequencedEvent, StreamBackend};
use crate::tools::{Tool, ToolOutput, Toolbox};

type Scripted = Result<ToolCompletionResponse, LlmError>;

/// LLM that replays a fixed script, then repeats a fallback forever
/// (or never answers again, see [`ScriptedLlm::then_stall`]).
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Scripted>>,
    fallback: ToolCompletionResponse,
    stall: bool,
    calls: AtomicU32,
    requests: Mutex<Vec<ToolCompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self::with_fallback(script, Self::text("(no more scripted replies)"))
    }

    pub fn with_fallback(script: Vec<Scripted>, fallback: ToolCompletionResponse) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            stall: false,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Hang on every request once the script runs out.
    pub fn then_stall(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn always_text(text: &str) -> Self {
        Self::with_fallback(Vec::new(), Self::text(text))
    }

    pub fn always_tool(name: &str) -> Self {
        Self::with_fallback(Vec::new(), Self::tool_call(name, json!({})))
    }

    pub fn text(text: &str) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments,
            }],
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::ToolUse,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ToolCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None if self.stall => std::future::pending::<Scripted>().await,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Tool that counts its calls and fails when asked to (`{"fail": true}`).
pub struct CountingTool {
    name: String,
    pub calls: AtomicU32,
}

impl CountingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts invocations"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {"fail": {"type": "boolean"}}})
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if params.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ToolError::ExecutionFailed {
                name: self.name.clone(),
                reason: "asked to fail".into(),
            });
        }
        Ok(ToolOutput::success(json!({"call": n}), Duration::from_millis(1)))
    }
}

/// Toolbox with a fixed tool list.
pub struct StaticToolbox {
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolbox {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Toolbox for StaticToolbox {
    async fn load(&self, _ctx: &JobContext) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        Ok(self.tools.clone())
    }
}

/// Toolbox whose backing service is down.
pub struct FailingToolbox;

#[async_trait]
impl Toolbox for FailingToolbox {
    async fn load(&self, _ctx: &JobContext) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        Err(ToolError::LoadFailed {
            reason: "tool service unreachable".into(),
        })
    }
}

/// Stream store that is always down.
pub struct UnavailableStreamBackend;

#[async_trait]
impl StreamBackend for UnavailableStreamBackend {
    async fn open(&self, _stream_id: &str) -> Result<(), StreamError> {
        Err(StreamError::Unavailable("connection refused".into()))
    }

    async fn append(&self, _stream_id: &str, _event: &SequencedEvent) -> Result<(), StreamError> {
        Err(StreamError::Unavailable("connection refused".into()))
    }

    async fn snapshot(
        &self,
        _stream_id: &str,
    ) -> Result<Option<Vec<SequencedEvent>>, StreamError> {
        Err(StreamError::Unavailable("connection refused".into()))
    }

    async fn close(&self, _stream_id: &str) -> Result<(), StreamError> {
        Err(StreamError::Unavailable("connection refused".into()))
    }
}

/// libSQL database with switchable write failures.
pub struct FlakyDatabase {
    inner: LibSqlBackend,
    pub fail_insert_run: AtomicBool,
    pub fail_finalize: AtomicBool,
}

impl FlakyDatabase {
    pub fn new(inner: LibSqlBackend) -> Self {
        Self {
            inner,
            fail_insert_run: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
        }
    }

    fn disk_error() -> DatabaseError {
        DatabaseError::Query("disk I/O error".into())
    }
}

#[async_trait]
impl Database for FlakyDatabase {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), DatabaseError> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, DatabaseError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, DatabaseError> {
        self.inner.list_jobs().await
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, DatabaseError> {
        self.inner.list_due_jobs(now).await
    }

    async fn advance_next_fire(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        self.inner.advance_next_fire(id, expected, next).await
    }

    async fn insert_run(&self, run: &JobRun) -> Result<(), DatabaseError> {
        if self.fail_insert_run.load(Ordering::SeqCst) {
            return Err(Self::disk_error());
        }
        self.inner.insert_run(run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>, DatabaseError> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, job_id: Uuid, limit: u32) -> Result<Vec<JobRun>, DatabaseError> {
        self.inner.list_runs(job_id, limit).await
    }

    async fn list_stale_runs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, DatabaseError> {
        self.inner.list_stale_runs(started_before).await
    }

    async fn set_run_stream(&self, run_id: Uuid, stream_id: &str) -> Result<u64, DatabaseError> {
        self.inner.set_run_stream(run_id, stream_id).await
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(Self::disk_error());
        }
        self.inner.finalize_run(run_id, job_id, outcome).await
    }

    async fn clear_run_stream(&self, run_id: Uuid) -> Result<(), DatabaseError> {
        self.inner.clear_run_stream(run_id).await
    }

    async fn list_notifications(&self, run_id: Uuid) -> Result<Vec<Notification>, DatabaseError> {
        self.inner.list_notifications(run_id).await
    }
}
