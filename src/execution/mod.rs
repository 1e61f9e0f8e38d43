//! Execution of resolved jobs.
//!
//! # Architecture
//!
//! ```text
//! JobSupervisor → JobRunner (resolve + run) → ExecutionBackend (docker run)
//! ```
//!
//! The supervisor only sees the [`JobRunner`] seam, so tests substitute
//! runners that succeed, fail, or hang without touching docker.
//!
//! # Example
//!
//! ```ignore
//! use jobrunner::execution::{DockerJobRunner, JobRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! let runner = DockerJobRunner::new(resolver);
//! let success = runner.run(&job, CancellationToken::new()).await?;
//! println!("outputs in {}", success.output_path);
//! ```

pub mod backend;
pub mod runner;

pub use backend::{BackendError, BackendOutput, DockerCli, ExecutionBackend};
pub use runner::{DockerJobRunner, JobRunner, JobSuccess};
