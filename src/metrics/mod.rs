//! Metrics module for Prometheus-based monitoring.
//!
//! The supervisor records one outcome per reported job, plus a gauge of jobs
//! currently running.
//!
//! # Example
//!
//! ```ignore
//! use jobrunner::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("succeeded", 42.0);
//!
//! // Text format, e.g. for `watch --print-metrics`
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, REGISTRY};
