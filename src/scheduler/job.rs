//! Job records exchanged with the job queue.
//!
//! - `Job`: a job as listed by the queue service
//! - `JobUpdate`: a PATCH body sent back to the queue
//! - `JobOutcome`: the classified result of one supervised run
//! - `JobStatus`: terminal state of a run

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{JobContext, WorkspaceIdentity};

/// A job as described by the queue service.
///
/// The queue owns these records; the supervisor only reports `started` and
/// the final status fields back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// URL the job is updated at.
    pub url: String,
    pub repo: String,
    /// Branch or tag the workspace was checked out at.
    #[serde(alias = "branch")]
    pub tag: String,
    /// Database flavour, e.g. `full` or `slice`.
    pub db: String,
    /// Requested action id.
    pub operation: String,
    #[serde(default)]
    pub backend: Option<String>,
    /// Checkout containing `project.yaml`.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub status_code: Option<i32>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job.
    pub fn new(
        url: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
        db: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            repo: repo.into(),
            tag: tag.into(),
            db: db.into(),
            operation: operation.into(),
            backend: None,
            workdir: None,
            owner: None,
            name: None,
            started: false,
            status_code: None,
            status_message: None,
            output_path: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Sets the checkout directory.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Sets the workspace owner and name.
    pub fn with_workspace(mut self, owner: impl Into<String>, name: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.name = Some(name.into());
        self
    }

    /// Short id for logs: the last path segment of the job URL.
    pub fn id(&self) -> &str {
        self.url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(self.url.as_str())
    }

    /// Storage identity of the job's workspace.
    pub fn workspace(&self) -> WorkspaceIdentity {
        WorkspaceIdentity {
            repo: self.repo.clone(),
            branch: self.tag.clone(),
            db: self.db.clone(),
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }

    /// What the job asks the resolver for.
    pub fn context(&self) -> JobContext {
        JobContext::new(self.operation.clone(), self.workspace())
    }
}

/// A PATCH body for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobUpdate {
    /// Sent on pickup, before any work starts.
    Started { started: bool },
    Succeeded {
        output_path: String,
        status_code: i32,
    },
    Failed {
        status_code: i32,
        status_message: String,
    },
}

impl JobUpdate {
    pub fn started() -> Self {
        JobUpdate::Started { started: true }
    }
}

/// Terminal state of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The runner returned normally.
    Succeeded,
    /// The runner raised a classified or unclassified error.
    Failed,
    /// The wall-clock budget ran out.
    TimedOut,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Classified result of one run, as reported to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    /// URL of the job this outcome belongs to.
    pub job_url: String,
    pub status: JobStatus,
    pub status_code: i32,
    /// Safe-to-report message; absent on success.
    pub status_message: Option<String>,
    pub output_path: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Creates a successful outcome.
    pub fn success(job: &Job, output_path: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_url: job.url.clone(),
            status: JobStatus::Succeeded,
            status_code: 0,
            status_message: None,
            output_path: Some(output_path.into()),
            completed_at: Utc::now(),
            duration_ms,
        }
    }

    /// Creates a failed outcome.
    pub fn failure(
        job: &Job,
        status_code: i32,
        status_message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_url: job.url.clone(),
            status: JobStatus::Failed,
            status_code,
            status_message: Some(status_message.into()),
            output_path: None,
            completed_at: Utc::now(),
            duration_ms,
        }
    }

    /// Creates a timed-out outcome.
    pub fn timeout(
        job: &Job,
        status_code: i32,
        status_message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            status: JobStatus::TimedOut,
            ..Self::failure(job, status_code, status_message, duration_ms)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// The final PATCH body for this outcome.
    pub fn to_update(&self) -> JobUpdate {
        match (&self.status, &self.output_path) {
            (JobStatus::Succeeded, Some(output_path)) => JobUpdate::Succeeded {
                output_path: output_path.clone(),
                status_code: self.status_code,
            },
            _ => JobUpdate::Failed {
                status_code: self.status_code,
                status_message: self.status_message.clone().unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTED_JOB: &str = r#"{
        "url": "http://test.com/jobs/0/",
        "repo": "myrepo",
        "tag": "mytag",
        "backend": "tpp",
        "db": "full",
        "started": false,
        "operation": "generate_cohort",
        "status_code": null,
        "output_path": "output_path",
        "created_at": null,
        "started_at": null,
        "completed_at": null
    }"#;

    #[test]
    fn test_job_deserialization() {
        let job: Job = serde_json::from_str(LISTED_JOB).unwrap();
        assert_eq!(job.operation, "generate_cohort");
        assert_eq!(job.tag, "mytag");
        assert_eq!(job.backend.as_deref(), Some("tpp"));
        assert!(!job.started);
        assert!(job.workdir.is_none());
        assert_eq!(job.id(), "0");
    }

    #[test]
    fn test_branch_alias() {
        let job: Job = serde_json::from_str(
            r#"{"url": "u", "repo": "r", "branch": "main", "db": "full", "operation": "a"}"#,
        )
        .unwrap();
        assert_eq!(job.tag, "main");
    }

    #[test]
    fn test_job_context() {
        let job = Job::new("http://q/jobs/7/", "repo", "master", "full", "run_model")
            .with_workspace("me", "study");
        let context = job.context();
        assert_eq!(context.operation, "run_model");
        assert_eq!(context.workspace.volume_name(), "repo-master-full-me-study");
    }

    #[test]
    fn test_update_bodies() {
        assert_eq!(
            serde_json::to_value(JobUpdate::started()).unwrap(),
            serde_json::json!({"started": true})
        );

        let job = Job::new("u", "r", "t", "full", "a");
        let success = JobOutcome::success(&job, "output_path", 10);
        assert_eq!(
            serde_json::to_value(success.to_update()).unwrap(),
            serde_json::json!({"output_path": "output_path", "status_code": 0})
        );

        let failure = JobOutcome::failure(&job, 99, "Unclassified error id X", 10);
        assert_eq!(
            serde_json::to_value(failure.to_update()).unwrap(),
            serde_json::json!({"status_code": 99, "status_message": "Unclassified error id X"})
        );
    }

    #[test]
    fn test_timeout_outcome() {
        let job = Job::new("u", "r", "t", "full", "a");
        let outcome = JobOutcome::timeout(&job, -1, "TimeoutError(1s) id X", 1000);
        assert_eq!(outcome.status, JobStatus::TimedOut);
        assert!(!outcome.is_success());
        assert_eq!(outcome.status.to_string(), "timed_out");
    }
}
