//! Recording helpers over the global metrics.

use super::prometheus::{JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION};
use crate::scheduler::job::JobOutcome;

/// Metrics collector for supervised jobs.
///
/// Every method is a no-op until `init_metrics()` has run, so library users
/// that never export metrics pay nothing.
///
/// # Example
///
/// ```ignore
/// use jobrunner::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.inc_jobs_in_progress();
/// // ... run the job ...
/// collector.dec_jobs_in_progress();
/// collector.record_outcome(&outcome);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one finished job.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal status label (`succeeded`, `failed`, `timed_out`)
    /// * `duration_secs` - Wall-clock time from pickup to outcome
    pub fn record_job(&self, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a classified outcome.
    pub fn record_outcome(&self, outcome: &JobOutcome) {
        self.record_job(
            &outcome.status.to_string(),
            outcome.duration_ms as f64 / 1000.0,
        );
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
