//! Root-cause extraction for wrapped errors.
//!
//! Step failures reach the orchestrator wrapped in one or more layers
//! ("activity execute_job failed after 3 attempt(s)") that say nothing useful
//! to an operator. [`normalize_error`] walks the `source()` chain to its
//! deepest node and reports that message instead, along with a stable code
//! and the rendered chain.

use std::any::Any;
use std::error::Error as StdError;

use serde::{Deserialize, Serialize};

use crate::durable::ActivityFailure;
use crate::error::{ConfigError, DatabaseError, Error, JobError, LlmError, ToolError};

/// Guards against pathological self-referential chains.
const MAX_CHAIN_DEPTH: usize = 32;

/// Structured description of a failure, as recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Rendered cause chain, outermost first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
            context: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Merge a key into the context object.
    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        let mut map = match self.context.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(key.to_string(), value);
        self.context = Some(serde_json::Value::Object(map));
        self
    }
}

/// Normalize any error into its root cause.
///
/// A non-empty `details` list on an [`ActivityFailure`] takes precedence over
/// the cause chain. The code is taken from the deepest node that has one.
pub fn normalize_error(err: &(dyn StdError + 'static)) -> ErrorDetail {
    let mut chain: Vec<String> = Vec::new();
    let mut deepest = String::new();
    let mut code: Option<&'static str> = None;
    let mut from_details: Option<String> = None;
    let mut activity: Option<String> = None;

    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(node) = current {
        if chain.len() >= MAX_CHAIN_DEPTH {
            break;
        }

        if let Some(c) = code_of(node) {
            code = Some(c);
        }
        if let Some(failure) = node.downcast_ref::<ActivityFailure>() {
            if activity.is_none() {
                activity = Some(failure.activity.clone());
            }
            if from_details.is_none() {
                from_details = failure
                    .details
                    .iter()
                    .map(|d| d.trim())
                    .find(|d| !d.is_empty())
                    .map(str::to_string);
            }
        }

        let message = node.to_string();
        if chain.last() != Some(&message) {
            chain.push(message.clone());
        }
        deepest = message;
        current = node.source();
    }

    let message = match from_details {
        Some(detail) => detail,
        None if deepest.trim().is_empty() => "Unknown error".to_string(),
        None => deepest,
    };

    let mut detail = ErrorDetail {
        message,
        code: code.map(str::to_string),
        stack: Some(render_chain(&chain)),
        context: None,
    };
    if let Some(activity) = activity {
        detail = detail.with_context("activity", serde_json::Value::String(activity));
    }
    detail
}

/// Normalize a panic payload (the non-`Error` case).
pub fn normalize_panic(payload: &(dyn Any + Send)) -> ErrorDetail {
    ErrorDetail::new(panic_message(payload)).with_code("panic")
}

/// Best-effort text for a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Error>() {
        e.to_string()
    } else {
        "Unknown panic payload".to_string()
    }
}

fn code_of(node: &(dyn StdError + 'static)) -> Option<&'static str> {
    if let Some(e) = node.downcast_ref::<Error>() {
        return match e {
            // Wrappers defer to whatever lies beneath them.
            Error::Activity(_) => None,
            other => Some(other.code()),
        };
    }
    if let Some(e) = node.downcast_ref::<LlmError>() {
        return Some(e.code());
    }
    if let Some(e) = node.downcast_ref::<DatabaseError>() {
        return Some(e.code());
    }
    if let Some(e) = node.downcast_ref::<ToolError>() {
        return Some(e.code());
    }
    if let Some(e) = node.downcast_ref::<JobError>() {
        return Some(e.code());
    }
    if let Some(e) = node.downcast_ref::<ConfigError>() {
        return Some(e.code());
    }
    None
}

fn render_chain(chain: &[String]) -> String {
    let mut out = chain.first().cloned().unwrap_or_default();
    if chain.len() > 1 {
        out.push_str("\n\nCaused by:");
        for (i, message) in chain.iter().skip(1).enumerate() {
            out.push_str(&format!("\n    {i}: {message}"));
        }
    }
    out
}
