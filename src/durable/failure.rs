//! Wrapper error produced when an activity gives up.

use std::fmt;

use crate::error::Error;

/// An activity that failed after exhausting (or being refused) retries.
///
/// The real error is kept as `cause`. Failures rebuilt from a serialized form
/// (no live cause available) carry the original message in `details` instead.
#[derive(Debug)]
pub struct ActivityFailure {
    pub activity: String,
    pub attempts: u32,
    pub details: Vec<String>,
    cause: Option<Box<Error>>,
}

impl ActivityFailure {
    /// Wrap the error returned by the final attempt.
    pub fn new(activity: impl Into<String>, attempts: u32, cause: Error) -> Self {
        Self {
            activity: activity.into(),
            attempts,
            details: Vec::new(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Rebuild a failure whose cause only survives as text, such as one
    /// reported by a substrate that serializes failures across a process
    /// boundary. [`crate::normalize::normalize_error`] prefers these details
    /// over the wrapper's own message. The in-process runner always keeps
    /// the live cause and never calls this.
    pub fn from_details(activity: impl Into<String>, attempts: u32, details: Vec<String>) -> Self {
        Self {
            activity: activity.into(),
            attempts,
            details,
            cause: None,
        }
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "activity {} failed after {} attempt(s)",
            self.activity, self.attempts
        )
    }
}

// The source must be the unboxed `Error` so it can be downcast.
impl std::error::Error for ActivityFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use std::error::Error as _;

    #[test]
    fn cause_is_exposed_as_source() {
        let failure = ActivityFailure::new(
            "create_run",
            3,
            Error::Database(DatabaseError::Query("disk I/O error".into())),
        );
        assert_eq!(failure.to_string(), "activity create_run failed after 3 attempt(s)");
        let source = failure.source().unwrap();
        assert!(source.to_string().contains("disk I/O error"));
    }

    #[test]
    fn detail_only_failure_has_no_source() {
        let failure =
            ActivityFailure::from_details("execute_job", 1, vec!["socket hang up".into()]);
        assert!(failure.source().is_none());
        assert!(failure.cause().is_none());
        assert_eq!(failure.details, vec!["socket hang up".to_string()]);
    }
}
