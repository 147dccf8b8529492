//! Orchestrator: drives one job run through its steps under the durable
//! activity runner.

pub mod activities;
pub mod job_run;
pub mod recovery;

pub use activities::{JobActivities, stream_identity};
pub use job_run::{JobRunResult, Orchestrator, WorkflowOptions};
