//! Job run data model: lifecycle status, outcomes, notifications.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::TokenUsage;
use crate::normalize::ErrorDetail;
use crate::stream::ProgressEvent;

/// Lifecycle status of a run. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status for an outcome. Without a recognised status the
    /// success flag decides.
    pub fn from_outcome(status: Option<OutcomeStatus>, success: bool) -> Self {
        match status {
            Some(OutcomeStatus::Success) => RunStatus::Completed,
            Some(OutcomeStatus::Partial) => RunStatus::Partial,
            Some(OutcomeStatus::Failed) => RunStatus::Failed,
            Some(OutcomeStatus::Blocked) => RunStatus::Blocked,
            None if success => RunStatus::Completed,
            None => RunStatus::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "blocked" => Ok(RunStatus::Blocked),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Status reported by the agent for its own work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failed,
    Blocked,
}

impl OutcomeStatus {
    /// Map an untrusted status string through the whitelist.
    pub fn parse_whitelisted(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Some(OutcomeStatus::Success),
            "partial" => Some(OutcomeStatus::Partial),
            "failed" => Some(OutcomeStatus::Failed),
            "blocked" => Some(OutcomeStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }

    /// Unknown values fall back to `Normal`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => NotificationPriority::Low,
            "high" => NotificationPriority::High,
            "urgent" => NotificationPriority::Urgent,
            _ => NotificationPriority::Normal,
        }
    }
}

/// A notification requested by a job, written at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub priority: NotificationPriority,
}

impl NewNotification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: NotificationPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

/// What one execution of a job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub notifications: Vec<NewNotification>,
    /// Replacement notes for the job. `None` leaves them unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OutcomeStatus>,
    pub tool_calls_executed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl JobOutcome {
    /// A successful outcome with only a summary.
    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            notifications: Vec::new(),
            updated_notes: None,
            status: Some(OutcomeStatus::Success),
            tool_calls_executed: 0,
            token_usage: None,
            model_id: None,
            duration_ms: 0,
            trace_id: None,
            error_details: None,
            warnings: Vec::new(),
        }
    }

    /// Failed outcome carrying `detail`. Notes are left unchanged.
    pub fn failed(detail: ErrorDetail, tool_calls_executed: u32) -> Self {
        Self {
            success: false,
            summary: format!("Execution failed: {}", detail.message),
            status: Some(OutcomeStatus::Failed),
            tool_calls_executed,
            error_details: Some(detail),
            ..Self::completed(String::new())
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_outcome(self.status, self.success)
    }
}

/// Outcome fields as recorded on a finalized run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub summary: String,
    pub tool_calls_executed: u32,
    pub notifications_emitted: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// One execution attempt of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    /// Progress channel name; only set while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Present once the run is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// What a UI polls to follow a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// Indicators currently shown on the run's stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressEvent>,
}

impl From<JobRun> for RunStatusView {
    fn from(run: JobRun) -> Self {
        Self {
            run_id: run.id,
            job_id: run.job_id,
            status: run.status,
            stream_id: run.stream_id,
            outcome: run.outcome,
            progress: Vec::new(),
        }
    }
}
