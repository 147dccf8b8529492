//! In-process durable-execution substrate.
//!
//! Orchestration code calls named activities through [`run_activity`], which
//! applies a per-step timeout and a bounded retry policy with exponential
//! backoff. Failures that exhaust the policy are wrapped in an
//! [`ActivityFailure`] that keeps the original error as its cause.
//!
//! Workflow replay across process restarts is not provided here; runs left
//! behind by a crash are reconciled by `workflow::recovery` instead.

pub mod activity;
pub mod failure;

pub use activity::{ActivityOptions, RetryPolicy, run_activity};
pub use failure::ActivityFailure;
