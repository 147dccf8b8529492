//! Error types for agent jobs.

use std::time::Duration;

use uuid::Uuid;

use crate::durable::ActivityFailure;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("{0}")]
    Activity(#[from] ActivityFailure),

    #[error("{context} timed out after {timeout:?}")]
    TimedOut { context: String, timeout: Duration },

    #[error("{context} panicked: {message}")]
    Panicked { context: String, message: String },
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(e) => e.code(),
            Error::Database(e) => e.code(),
            Error::Llm(e) => e.code(),
            Error::Tool(e) => e.code(),
            Error::Job(e) => e.code(),
            Error::Stream(_) => "stream_unavailable",
            Error::Activity(f) => f.cause().map(Error::code).unwrap_or("activity_failed"),
            Error::TimedOut { .. } => "timeout",
            Error::Panicked { .. } => "panic",
        }
    }

    /// Whether the durable substrate should try this step again.
    ///
    /// Logic errors fail fast; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config(_) | Error::Panicked { .. } => false,
            Error::Database(e) => !matches!(
                e,
                DatabaseError::NotFound { .. } | DatabaseError::Constraint(_)
            ),
            Error::Llm(e) => !matches!(
                e,
                LlmError::AuthFailed { .. } | LlmError::ContextLengthExceeded { .. }
            ),
            Error::Job(e) => matches!(e, JobError::Failed { .. }),
            Error::Activity(f) => f.cause().is_some_and(Error::is_retryable),
            Error::Tool(_) | Error::Stream(_) | Error::TimedOut { .. } => true,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::MissingEnvVar(_) => "config_missing",
            ConfigError::InvalidValue { .. } => "config_invalid",
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn code(&self) -> &'static str {
        match self {
            DatabaseError::Pool(_) => "database_unavailable",
            DatabaseError::Query(_) => "database_query",
            DatabaseError::NotFound { .. } => "not_found",
            DatabaseError::Constraint(_) => "database_constraint",
            DatabaseError::Migration(_) => "database_migration",
            DatabaseError::Serialization(_) => "database_serialization",
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::RequestFailed { .. } | LlmError::Http(_) | LlmError::Io(_) => {
                "llm_request_failed"
            }
            LlmError::RateLimited { .. } => "llm_rate_limited",
            LlmError::InvalidResponse { .. } | LlmError::Json(_) => "llm_invalid_response",
            LlmError::ContextLengthExceeded { .. } => "llm_context_length",
            LlmError::AuthFailed { .. } => "llm_auth_failed",
        }
    }
}

/// Tool errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Failed to load tools: {reason}")]
    LoadFailed { reason: String },
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound { .. } => "tool_not_found",
            ToolError::ExecutionFailed { .. } => "tool_failed",
            ToolError::Timeout { .. } => "tool_timeout",
            ToolError::InvalidParameters { .. } => "tool_invalid_parameters",
            ToolError::LoadFailed { .. } => "tool_load_failed",
        }
    }
}

/// Job and run lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is disabled")]
    Disabled { id: Uuid },

    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Run {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Run {run_id} already streams to {existing}, refusing {requested}")]
    StreamConflict {
        run_id: Uuid,
        existing: String,
        requested: String,
    },

    #[error("Invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound { .. } | JobError::RunNotFound { .. } => "not_found",
            JobError::Disabled { .. } => "job_disabled",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::StreamConflict { .. } => "stream_conflict",
            JobError::InvalidSchedule { .. } => "invalid_schedule",
            JobError::Failed { .. } => "job_failed",
        }
    }
}

/// Progress stream errors. Never surfaced from a stream write.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream store unavailable: {0}")]
    Unavailable(String),

    #[error("Stream {stream_id} is closed")]
    Closed { stream_id: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
