//! Resolution of a requested action into a ready-to-run invocation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::completion::assert_finished;
use super::config::{Environment, RunnerConfig};
use super::interpolate::interpolate_action;
use super::materialize::{Materializer, ResolvedAction};
use super::paths::{PathResolver, WorkspaceIdentity};
use crate::error::JobError;
use crate::project::{CommandRegistry, DependencyGraph, ProjectDefinition};

/// What a job asks for: one action, run against one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub operation: String,
    pub workspace: WorkspaceIdentity,
}

impl JobContext {
    pub fn new(operation: impl Into<String>, workspace: WorkspaceIdentity) -> Self {
        Self {
            operation: operation.into(),
            workspace,
        }
    }
}

/// Resolves jobs against project definitions.
///
/// Holds only immutable configuration, so one resolver can serve any number
/// of jobs.
#[derive(Debug, Clone)]
pub struct PipelineResolver {
    registry: CommandRegistry,
    paths: PathResolver,
    environment: Environment,
}

impl PipelineResolver {
    pub fn new(registry: CommandRegistry, paths: PathResolver, environment: Environment) -> Self {
        Self {
            registry,
            paths,
            environment,
        }
    }

    /// Builds a resolver from runner configuration.
    pub fn from_config(registry: CommandRegistry, config: &RunnerConfig) -> Self {
        Self::new(
            registry,
            PathResolver::new(config.storage.clone()),
            config.environment.clone(),
        )
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Loads `<workdir>/project.yaml` and resolves the job against it.
    pub fn resolve(&self, workdir: &Path, job: &JobContext) -> Result<ResolvedAction, JobError> {
        let project = ProjectDefinition::load(workdir, &self.registry)?;
        self.resolve_project(&project, job)
    }

    /// Resolves the job against an already loaded definition.
    ///
    /// Any failure aborts the whole resolution.
    pub fn resolve_project(
        &self,
        project: &ProjectDefinition,
        job: &JobContext,
    ) -> Result<ResolvedAction, JobError> {
        let requested = project
            .get(&job.operation)
            .ok_or_else(|| JobError::UnknownOperation {
                operation: job.operation.clone(),
            })?;

        let graph = DependencyGraph::build(project.actions())?;
        let materializer = Materializer::new(&self.registry, &self.paths, &self.environment);

        let action = materializer.materialize(requested, &job.workspace)?;

        let mut dependencies = BTreeMap::new();
        for dependency_id in graph.predecessors(&job.operation) {
            let definition =
                project
                    .get(dependency_id)
                    .ok_or_else(|| JobError::UndefinedDependency {
                        action_id: job.operation.clone(),
                        dependency: dependency_id.to_string(),
                    })?;
            let dependency = materializer.materialize(definition, &job.workspace)?;
            assert_finished(&dependency)?;
            debug!(action_id = %dependency_id, "Dependency finished");
            dependencies.insert(dependency_id.to_string(), dependency);
        }

        let action = interpolate_action(action, &dependencies)?;

        info!(
            operation = %job.operation,
            container = %action.container_name(),
            dependencies = dependencies.len(),
            "Resolved job"
        );

        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::StorageRoots;

    const PROJECT: &str = r#"
actions:
  generate_cohorts:
    run: cohortextractor:latest
    outputs:
      cohort: input.csv
  run_model:
    run: stata-mp:latest analysis/model.do ${{ needs.generate_cohorts.outputs.cohort }}
    needs: [generate_cohorts]
    outputs:
      log: model.log
  orphan:
    run: stata-mp:latest orphan.do
    needs: [never_defined]
"#;

    fn resolver(root: &Path) -> PipelineResolver {
        PipelineResolver::new(
            CommandRegistry::builtin(),
            PathResolver::new(StorageRoots::new(root.join("high"), root.join("medium"))),
            Environment::from_pairs([("FULL_DATABASE_URL", "sqlite:///test.db")]),
        )
    }

    fn job(operation: &str) -> JobContext {
        JobContext::new(
            operation,
            WorkspaceIdentity::new("https://github.com/repo", "master", "full"),
        )
    }

    fn project() -> ProjectDefinition {
        ProjectDefinition::parse(PROJECT, &CommandRegistry::builtin()).unwrap()
    }

    #[test]
    fn test_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolver(dir.path())
            .resolve_project(&project(), &job("do_the_twist"))
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownOperation { .. }));
    }

    #[test]
    fn test_undefined_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolver(dir.path())
            .resolve_project(&project(), &job("orphan"))
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::UndefinedDependency { ref dependency, .. } if dependency == "never_defined"
        ));
    }

    #[test]
    fn test_dependency_gate_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let project = project();

        let err = resolver
            .resolve_project(&project, &job("run_model"))
            .unwrap_err();
        assert!(matches!(err, JobError::DependencyNotFinished { .. }));

        let cohort_dir = dir.path().join("high").join("https-github-com-repo-master-full");
        std::fs::write(cohort_dir.join("input.csv"), "").unwrap();

        let action = resolver.resolve_project(&project, &job("run_model")).unwrap();
        assert_eq!(
            action.docker_invocation().last().unwrap(),
            &cohort_dir.join("input.csv").to_string_lossy()
        );
    }

    #[test]
    fn test_resolve_missing_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolver(dir.path())
            .resolve(&dir.path().join("checkout"), &job("run_model"))
            .unwrap_err();
        assert_eq!(err.status_code(), -1);
    }
}
