//! The unit of work the supervisor runs under its time budget.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::{DockerCli, ExecutionBackend};
use crate::error::JobError;
use crate::pipeline::PipelineResolver;
use crate::scheduler::job::Job;

/// Result fields attached to a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSuccess {
    pub output_path: String,
}

/// Runs one job to completion.
///
/// Errors that downcast to [`JobError`] are classified and reported with
/// their status code; anything else is reported as unclassified.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Name used in timeout and unclassified-error reports.
    fn name(&self) -> &str;

    /// Runs `job`. Implementations should stop promptly once `cancel` fires.
    async fn run(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<JobSuccess>;
}

/// Resolves a job against its checkout and runs it in docker.
pub struct DockerJobRunner {
    resolver: PipelineResolver,
    backend: Arc<dyn ExecutionBackend>,
}

impl DockerJobRunner {
    pub fn new(resolver: PipelineResolver) -> Self {
        Self::with_backend(resolver, Arc::new(DockerCli::new()))
    }

    pub fn with_backend(resolver: PipelineResolver, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { resolver, backend }
    }
}

#[async_trait]
impl JobRunner for DockerJobRunner {
    fn name(&self) -> &str {
        "DockerJobRunner"
    }

    async fn run(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<JobSuccess> {
        let workdir = job
            .workdir
            .clone()
            .ok_or_else(|| JobError::WorkspaceNotFound {
                path: PathBuf::from(&job.repo),
            })?;

        let action = self.resolver.resolve(&workdir, &job.context())?;

        let output = self
            .backend
            .run(action.container_name(), action.docker_invocation(), &cancel)
            .await?;

        if !output.success() {
            warn!(
                container = %action.container_name(),
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "Container failed"
            );
            return Err(JobError::Backend {
                kind: action.error_kind(),
                container: action.container_name().to_string(),
                detail: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            }
            .into());
        }

        info!(action_id = %action.action_id(), "Action finished");
        Ok(JobSuccess {
            output_path: action.output_path().to_string_lossy().into_owned(),
        })
    }
}
