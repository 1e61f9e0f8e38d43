//! Expansion of a validated action into a concrete backend invocation.
//!
//! Materialization resolves every action-local field (paths, database URL,
//! image version) and renders the registry's argument templates. References
//! to other actions' outputs are left in place for [`interpolate`].
//!
//! [`interpolate`]: super::interpolate::interpolate

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::config::Environment;
use super::paths::{container_name_for, PathResolver, WorkspaceIdentity};
use crate::error::{BackendErrorKind, JobError};
use crate::project::{
    ActionDefinition, CommandRegistry, DeclaredOutputs, PlaceholderValues, RunCommand,
};

/// Mount flag understood by the execution backend.
pub const VOLUME_FLAG: &str = "--volume";

/// An action merged with job context, ready for the execution backend.
///
/// Values are built once by [`Materializer::materialize`] and never mutated
/// in place; interpolation produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAction {
    action_id: String,
    command: String,
    version: String,
    needs: Vec<String>,
    outputs: DeclaredOutputs,
    input_path: Option<PathBuf>,
    output_path: PathBuf,
    container_name: String,
    #[serde(skip)]
    database_url: String,
    docker_invocation: Vec<String>,
    error: BackendErrorKind,
}

impl ResolvedAction {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Run command token, e.g. `stata-mp`.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn needs(&self) -> &[String] {
        &self.needs
    }

    /// Declared outputs, in declaration order.
    pub fn outputs(&self) -> &DeclaredOutputs {
        &self.outputs
    }

    pub fn output_filename(&self, output_id: &str) -> Option<&str> {
        self.outputs.filename(output_id)
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input_path.as_deref()
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Ordered arguments: mounts, image reference, fixed args, user args.
    pub fn docker_invocation(&self) -> &[String] {
        &self.docker_invocation
    }

    /// Failure kind raised when the backend run fails.
    pub fn error_kind(&self) -> BackendErrorKind {
        self.error
    }

    /// Returns a copy with the invocation replaced.
    pub(crate) fn with_invocation(self, docker_invocation: Vec<String>) -> Self {
        Self {
            docker_invocation,
            ..self
        }
    }
}

/// Turns action definitions into [`ResolvedAction`]s for one job.
#[derive(Debug, Clone, Copy)]
pub struct Materializer<'a> {
    registry: &'a CommandRegistry,
    paths: &'a PathResolver,
    environment: &'a Environment,
}

impl<'a> Materializer<'a> {
    pub fn new(
        registry: &'a CommandRegistry,
        paths: &'a PathResolver,
        environment: &'a Environment,
    ) -> Self {
        Self {
            registry,
            paths,
            environment,
        }
    }

    /// Materializes `action` for the given workspace.
    ///
    /// Creates the output (and input) directory as a side effect; nothing
    /// else outside the returned value is touched.
    pub fn materialize(
        &self,
        action: &ActionDefinition,
        identity: &WorkspaceIdentity,
    ) -> Result<ResolvedAction, JobError> {
        let command = RunCommand::parse(&action.run)?;

        // The definition was validated against a registry at load time, but
        // not necessarily this one.
        let spec = self
            .registry
            .get(&command.token)
            .ok_or_else(|| JobError::UnsupportedRunCommand {
                command: command.token.clone(),
            })?;

        let database_url = self.environment.database_url(&identity.db)?;

        let output_path = self.paths.resolve_path(identity, spec.output_tier)?;
        let container_name = container_name_for(&output_path);
        let input_path = spec
            .input_tier
            .map(|tier| self.paths.resolve_path(identity, tier))
            .transpose()?;

        let output_str = output_path.to_string_lossy().into_owned();
        let input_str = input_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let mut invocation = vec![VOLUME_FLAG.to_string(), format!("{output_str}:{output_str}")];
        if let Some(input) = &input_str {
            invocation.push(VOLUME_FLAG.to_string());
            invocation.push(format!("{input}:{input}"));
        }
        invocation.push(format!("{}:{}", spec.image, command.version));

        let values = PlaceholderValues {
            output_path: &output_str,
            input_path: input_str.as_deref(),
            database_url: &database_url,
        };
        invocation.extend(spec.args.iter().map(|template| template.render(&values)));
        invocation.extend(command.args.iter().cloned());

        debug!(
            action_id = %action.action_id,
            container = %container_name,
            output_path = %output_str,
            "Materialized action"
        );

        Ok(ResolvedAction {
            action_id: action.action_id.clone(),
            command: command.token,
            version: command.version,
            needs: action.needs.clone(),
            outputs: action.outputs.clone(),
            input_path,
            output_path,
            container_name,
            database_url,
            docker_invocation: invocation,
            error: spec.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::StorageRoots;

    struct Fixture {
        high: tempfile::TempDir,
        medium: tempfile::TempDir,
        registry: CommandRegistry,
        paths: PathResolver,
        environment: Environment,
    }

    impl Fixture {
        fn new() -> Self {
            let high = tempfile::tempdir().unwrap();
            let medium = tempfile::tempdir().unwrap();
            let paths = PathResolver::new(StorageRoots::new(high.path(), medium.path()));
            Self {
                high,
                medium,
                registry: CommandRegistry::builtin(),
                paths,
                environment: Environment::from_pairs([("FULL_DATABASE_URL", "sqlite:///test.db")]),
            }
        }

        fn materializer(&self) -> Materializer<'_> {
            Materializer::new(&self.registry, &self.paths, &self.environment)
        }
    }

    fn action(id: &str, run: &str) -> ActionDefinition {
        ActionDefinition {
            action_id: id.to_string(),
            run: run.to_string(),
            needs: Vec::new(),
            outputs: DeclaredOutputs::default(),
        }
    }

    fn identity() -> WorkspaceIdentity {
        WorkspaceIdentity::new("repo", "master", "full")
    }

    #[test]
    fn test_materialize_without_input_tier() {
        let fx = Fixture::new();
        let resolved = fx
            .materializer()
            .materialize(&action("generate_cohorts", "cohortextractor generate_cohort"), &identity())
            .unwrap();

        let out = fx.high.path().join("repo-master-full");
        let out = out.to_string_lossy();
        assert_eq!(
            resolved.docker_invocation(),
            &[
                "--volume".to_string(),
                format!("{out}:{out}"),
                "docker.pkg.github.com/opensafely/cohort-extractor/cohort-extractor:latest"
                    .to_string(),
                "generate_cohort".to_string(),
                "--database-url=sqlite:///test.db".to_string(),
                "--output-dir=/workspace".to_string(),
                "generate_cohort".to_string(),
            ]
        );
        assert!(resolved.input_path().is_none());
        assert!(resolved.output_path().is_dir());
        assert_eq!(resolved.error_kind(), BackendErrorKind::CohortExtractor);
    }

    #[test]
    fn test_materialize_with_input_tier_and_version() {
        let fx = Fixture::new();
        let resolved = fx
            .materializer()
            .materialize(&action("run_model", "stata-mp:1.2 analysis/model.do"), &identity())
            .unwrap();

        let out = fx.medium.path().join("repo-master-full");
        let input = fx.high.path().join("repo-master-full");
        let invocation = resolved.docker_invocation();
        assert_eq!(invocation[0], "--volume");
        assert_eq!(invocation[1], format!("{0}:{0}", out.display()));
        assert_eq!(invocation[2], "--volume");
        assert_eq!(invocation[3], format!("{0}:{0}", input.display()));
        assert_eq!(
            invocation[4],
            "docker.pkg.github.com/opensafely/stata-docker/stata-mp:1.2"
        );
        assert_eq!(invocation[5], "analysis/model.do");
        assert_eq!(resolved.input_path(), Some(input.as_path()));
        assert_eq!(resolved.container_name(), container_name_for(&out));
    }

    #[test]
    fn test_user_arguments_are_not_templates() {
        let fx = Fixture::new();
        let resolved = fx
            .materializer()
            .materialize(&action("a", "stata-mp m.do {database_url}"), &identity())
            .unwrap();
        assert_eq!(resolved.docker_invocation().last().unwrap(), "{database_url}");
    }

    #[test]
    fn test_cross_action_variables_left_in_place() {
        let fx = Fixture::new();
        let resolved = fx
            .materializer()
            .materialize(
                &action("a", "stata-mp m.do ${{ needs.b.outputs.c }}"),
                &identity(),
            )
            .unwrap();
        assert_eq!(
            resolved.docker_invocation().last().unwrap(),
            "${{needs.b.outputs.c}}"
        );
    }

    #[test]
    fn test_missing_database_url() {
        let fx = Fixture::new();
        let identity = WorkspaceIdentity::new("repo", "master", "slice");
        let err = fx
            .materializer()
            .materialize(&action("a", "cohortextractor generate_cohort"), &identity)
            .unwrap_err();
        assert!(matches!(err, JobError::MissingDatabaseConfiguration { .. }));
    }

    #[test]
    fn test_unregistered_command_rejected() {
        let fx = Fixture::new();
        let err = fx
            .materializer()
            .materialize(&action("a", "python script.py"), &identity())
            .unwrap_err();
        assert!(matches!(err, JobError::UnsupportedRunCommand { .. }));
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let fx = Fixture::new();
        let definition = action("a", "stata-mp m.do");
        let first = fx.materializer().materialize(&definition, &identity()).unwrap();
        let second = fx.materializer().materialize(&definition, &identity()).unwrap();
        assert_eq!(first, second);
    }
}
