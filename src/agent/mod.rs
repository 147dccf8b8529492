//! Agent module: the job execution tool loop and its completion tool.

pub mod completion;
pub mod executor;

pub use completion::{COMPLETE_JOB_TOOL, JobCompletion, complete_job_definition, parse_completion};
pub use executor::{DEFAULT_MAX_STEPS, JobExecutor};
