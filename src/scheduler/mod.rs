//! Job supervision against an external queue.
//!
//! This module provides the loop that turns queued jobs into reported
//! outcomes:
//!
//! - **Job**: the queue's job record, plus the PATCH bodies sent back
//! - **JobQueue**: the queue seam, with an HTTP implementation
//! - **JobSupervisor**: fetch, mark started, run under a time budget,
//!   classify, report
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────┐   GET ?started=False    ┌───────────────┐
//!      │  Job queue   │ ◄────────────────────── │ JobSupervisor │
//!      │   (HTTP)     │ ──────────────────────► │               │
//!      └──────────────┘   PATCH started/outcome └───────┬───────┘
//!                                                       │ spawn + timeout
//!                                               ┌───────▼───────┐
//!                                               │   JobRunner   │
//!                                               │ (resolve+run) │
//!                                               └───────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobrunner::scheduler::{HttpJobQueue, JobSupervisor, SupervisorConfig};
//! use tokio_util::sync::CancellationToken;
//! use std::sync::Arc;
//!
//! let queue = Arc::new(HttpJobQueue::new("https://jobs.example.org/jobs/", "tpp")?);
//! let shutdown = CancellationToken::new();
//! let supervisor = JobSupervisor::new(queue, runner, SupervisorConfig::default())
//!     .with_shutdown(shutdown.clone());
//!
//! supervisor.watch().await;
//! ```

pub mod job;
pub mod queue;
pub mod supervisor;

// Re-export main types for convenience
pub use job::{Job, JobOutcome, JobStatus, JobUpdate};
pub use queue::{HttpJobQueue, JobPage, JobQueue, QueueError};
pub use supervisor::{
    JobSupervisor, SupervisorConfig, DEFAULT_REPORT_ATTEMPTS, TIMEOUT_STATUS_CODE,
};
