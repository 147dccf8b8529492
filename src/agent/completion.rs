//! The `complete_job` tool: the model's explicit end-of-job signal.

use serde::Deserialize;

use crate::llm::ToolDefinition;
use crate::runs::{NewNotification, NotificationPriority, OutcomeStatus};

pub const COMPLETE_JOB_TOOL: &str = "complete_job";

/// Schema offered to the model alongside the job's own tools.
pub fn complete_job_definition() -> ToolDefinition {
    ToolDefinition {
        name: COMPLETE_JOB_TOOL.to_string(),
        description: "Finish this job. Call exactly once when the work is done, cannot \
                      proceed, or only partly succeeded. The summary is shown to the job's \
                      owner."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "What was done, in one or two sentences"
                },
                "status": {
                    "type": "string",
                    "enum": ["success", "partial", "failed", "blocked"],
                    "description": "Overall result (default: success)"
                },
                "notes": {
                    "type": "string",
                    "description": "Notes to remember for the next run of this job. Replaces the previous notes."
                },
                "blockedReason": {
                    "type": "string",
                    "description": "Why the job cannot proceed, when status is blocked"
                },
                "notifications": {
                    "type": "array",
                    "description": "Alerts for the job's owner",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "body": {"type": "string"},
                            "priority": {
                                "type": "string",
                                "enum": ["low", "normal", "high", "urgent"]
                            }
                        },
                        "required": ["title", "body"]
                    }
                }
            },
            "required": ["summary"]
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteJobArgs {
    summary: Option<String>,
    notes: Option<String>,
    status: Option<String>,
    #[serde(alias = "blockedReason")]
    blocked_reason: Option<String>,
    #[serde(default)]
    notifications: Vec<NotificationArg>,
}

#[derive(Debug, Deserialize)]
struct NotificationArg {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    priority: Option<String>,
}

/// Validated arguments of a `complete_job` call.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub summary: String,
    pub notes: Option<String>,
    /// `None` when the model sent no status or one outside the whitelist.
    pub status: Option<OutcomeStatus>,
    /// The raw status string, kept when it was not recognised.
    pub unrecognized_status: Option<String>,
    pub blocked_reason: Option<String>,
    pub notifications: Vec<NewNotification>,
}

impl JobCompletion {
    pub fn success(&self) -> bool {
        !matches!(
            self.status,
            Some(OutcomeStatus::Failed) | Some(OutcomeStatus::Blocked)
        )
    }
}

/// Validate `complete_job` arguments. The error text goes back to the model.
pub fn parse_completion(arguments: &serde_json::Value) -> Result<JobCompletion, String> {
    let args: CompleteJobArgs = serde_json::from_value(arguments.clone())
        .map_err(|e| format!("invalid {COMPLETE_JOB_TOOL} arguments: {e}"))?;

    let summary = args
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("{COMPLETE_JOB_TOOL} requires a non-empty summary"))?;

    let raw_status = args
        .status
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let status = raw_status.as_deref().and_then(OutcomeStatus::parse_whitelisted);
    let unrecognized_status = match (&raw_status, status) {
        (Some(raw), None) => Some(raw.clone()),
        _ => None,
    };

    let notifications = args
        .notifications
        .into_iter()
        .filter(|n| !n.title.trim().is_empty())
        .map(|n| {
            let priority = n
                .priority
                .as_deref()
                .map(NotificationPriority::parse_lenient)
                .unwrap_or_default();
            NewNotification::new(n.title.trim(), n.body.trim()).with_priority(priority)
        })
        .collect();

    Ok(JobCompletion {
        summary,
        notes: args.notes,
        status,
        unrecognized_status,
        blocked_reason: args
            .blocked_reason
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        notifications,
    })
}
