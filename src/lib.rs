//! jobrunner: resolves and supervises sandboxed pipeline jobs.
//!
//! A repository declares named actions in `project.yaml`; a job asks for one
//! of them to run. This library validates the definition, resolves the
//! requested action against its dependencies into a docker invocation, runs
//! it under a wall-clock budget and reports a classified, safe-to-share
//! status back to the job queue.

pub mod cli;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod pipeline;
pub mod project;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{ErrorKind, JobError};
