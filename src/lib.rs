//! Agent Jobs: durable orchestration of scheduled agent runs.

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod durable;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod normalize;
pub mod runs;
pub mod store;
pub mod stream;
pub mod tools;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::JobsConfig;
pub use error::{Error, Result};
