//! The polling and execution loop.
//!
//! One supervisor runs one job at a time:
//!
//! ```text
//! IDLE → FETCHED → RUNNING → {SUCCEEDED | FAILED | TIMED_OUT} → REPORTED → IDLE
//! ```
//!
//! The job is marked started before it runs, so a crash mid-run is
//! distinguishable from a job that was never picked up. Every job that is
//! marked started gets one terminal report, retried a bounded number of
//! times if the queue rejects it. The exception is shutdown: the running job
//! is cancelled through its token and left unreported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::job::{Job, JobOutcome, JobUpdate};
use super::queue::{JobQueue, QueueError};
use crate::error::{JobError, RESERVED_STATUS_CODE, UNCLASSIFIED_STATUS_CODE};
use crate::execution::JobRunner;
use crate::metrics::MetricsCollector;
use crate::pipeline::{RunnerConfig, DEFAULT_CANCEL_GRACE, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Status code reported when a job exceeds its budget.
pub const TIMEOUT_STATUS_CODE: i32 = RESERVED_STATUS_CODE;

/// Attempts made to deliver a terminal report before giving up.
pub const DEFAULT_REPORT_ATTEMPTS: u32 = 5;

/// Timing configuration for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Maximum time allowed for a single job.
    pub job_timeout: Duration,
    /// Delay between queue polls in continuous mode.
    pub poll_interval: Duration,
    /// Time a cancelled runner gets before its task is aborted.
    pub cancel_grace: Duration,
    /// Attempts made to deliver a terminal report, one poll interval apart.
    pub report_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            report_attempts: DEFAULT_REPORT_ATTEMPTS,
        }
    }
}

impl SupervisorConfig {
    pub fn from_runner_config(config: &RunnerConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            poll_interval: config.poll_interval,
            cancel_grace: config.cancel_grace,
            report_attempts: DEFAULT_REPORT_ATTEMPTS,
        }
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Sets how many times a terminal report is attempted.
    pub fn with_report_attempts(mut self, attempts: u32) -> Self {
        self.report_attempts = attempts.max(1);
        self
    }
}

/// Pulls jobs from a queue, runs them, and reports classified outcomes.
pub struct JobSupervisor {
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn JobRunner>,
    config: SupervisorConfig,
    metrics: MetricsCollector,
    shutdown: CancellationToken,
}

impl JobSupervisor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn JobRunner>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            queue,
            runner,
            config,
            metrics: MetricsCollector::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Uses `shutdown` to stop polling and to cancel the job in flight.
    ///
    /// Each job's runner receives a child of this token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs one fetch-to-report cycle.
    ///
    /// Returns `None` when no job is pending or shutdown interrupted the
    /// cycle. Queue failures are returned; runner failures are classified
    /// into the outcome.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        let next = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            next = self.queue.next_pending() => next?,
        };
        let Some(job) = next else {
            debug!("No pending jobs");
            return Ok(None);
        };

        let span = info_span!("job", job_id = %job.id());
        self.supervise(job).instrument(span).await
    }

    async fn supervise(&self, job: Job) -> Result<Option<JobOutcome>, QueueError> {
        info!(operation = %job.operation, repo = %job.repo, "Picked up job");
        self.queue.update(&job, &JobUpdate::started()).await?;

        let Some(outcome) = self.execute(&job).await else {
            warn!("Shutdown requested, job left unreported");
            return Ok(None);
        };
        self.metrics.record_outcome(&outcome);

        self.report(&job, &outcome.to_update()).await?;
        info!(
            status = %outcome.status,
            status_code = outcome.status_code,
            duration_ms = outcome.duration_ms,
            "Reported job outcome"
        );
        Ok(Some(outcome))
    }

    /// Sends a terminal update, retrying one poll interval apart.
    async fn report(&self, job: &Job, update: &JobUpdate) -> Result<(), QueueError> {
        let attempts = self.config.report_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.queue.update(job, update).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && !self.shutdown.is_cancelled() => {
                    warn!(attempt, attempts, error = %e, "Reporting job outcome failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        attempts = attempt,
                        error = %e,
                        update = ?update,
                        "Giving up on reporting job outcome"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Runs the job under the time budget and classifies the result.
    ///
    /// Returns `None` when shutdown fired before the job finished.
    async fn execute(&self, job: &Job) -> Option<JobOutcome> {
        let start_time = Instant::now();
        let cancel = self.shutdown.child_token();

        let runner = Arc::clone(&self.runner);
        let task_job = job.clone();
        let task_cancel = cancel.clone();
        let mut handle = tokio::spawn(
            async move { runner.run(&task_job, task_cancel).await }.in_current_span(),
        );

        self.metrics.inc_jobs_in_progress();
        let result = tokio::select! {
            biased;
            result = tokio::time::timeout(self.config.job_timeout, &mut handle) => Some(result),
            _ = self.shutdown.cancelled() => None,
        };
        self.metrics.dec_jobs_in_progress();

        let duration_ms = start_time.elapsed().as_millis() as u64;

        let Some(result) = result else {
            warn!(runner = %self.runner.name(), "Shutdown requested, cancelling job");
            self.wind_down(&cancel, handle).await;
            return None;
        };

        let outcome = match result {
            Ok(Ok(Ok(success))) => JobOutcome::success(job, success.output_path, duration_ms),
            Ok(Ok(Err(e))) => self.classify(job, &e, duration_ms),
            Ok(Err(join_error)) => {
                error!(
                    runner = %self.runner.name(),
                    error = %join_error,
                    "Runner task panicked"
                );
                self.unclassified(job, duration_ms)
            }
            Err(_) => {
                warn!(
                    runner = %self.runner.name(),
                    budget_secs = self.config.job_timeout.as_secs_f64(),
                    "Job exceeded its time budget, cancelling"
                );
                self.wind_down(&cancel, handle).await;
                JobOutcome::timeout(job, TIMEOUT_STATUS_CODE, self.timeout_message(), duration_ms)
            }
        };
        Some(outcome)
    }

    /// Cancels the runner and aborts its task if it outlives the grace period.
    async fn wind_down<T>(&self, cancel: &CancellationToken, mut handle: JoinHandle<T>) {
        cancel.cancel();
        if tokio::time::timeout(self.config.cancel_grace, &mut handle)
            .await
            .is_err()
        {
            warn!(runner = %self.runner.name(), "Runner ignored cancellation, aborting");
            handle.abort();
        }
    }

    fn classify(&self, job: &Job, error: &anyhow::Error, duration_ms: u64) -> JobOutcome {
        match error.downcast_ref::<JobError>() {
            Some(job_error) => {
                // Full detail stays in local logs; only safe_details leaves.
                warn!(
                    kind = %job_error.kind(),
                    status_code = job_error.status_code(),
                    error = %job_error,
                    "Job failed"
                );
                JobOutcome::failure(
                    job,
                    job_error.status_code(),
                    job_error.safe_details(),
                    duration_ms,
                )
            }
            None => {
                error!(
                    runner = %self.runner.name(),
                    error = %format!("{error:#}"),
                    "Unclassified job failure"
                );
                self.unclassified(job, duration_ms)
            }
        }
    }

    fn unclassified(&self, job: &Job, duration_ms: u64) -> JobOutcome {
        JobOutcome::failure(
            job,
            UNCLASSIFIED_STATUS_CODE,
            format!("Unclassified error id {}", self.runner.name()),
            duration_ms,
        )
    }

    fn timeout_message(&self) -> String {
        format!(
            "TimeoutError({}s) id {}",
            self.config.job_timeout.as_secs_f64(),
            self.runner.name()
        )
    }

    /// Runs cycles until the shutdown token fires.
    ///
    /// After a job is reported the next cycle starts immediately; after an
    /// empty poll or a queue failure the supervisor waits one poll interval.
    /// A job in flight when shutdown fires is cancelled and left unreported.
    pub async fn watch(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            job_timeout_secs = self.config.job_timeout.as_secs_f64(),
            runner = %self.runner.name(),
            "Supervisor started"
        );

        while !self.shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Job queue request failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Supervisor stopped");
    }
}
