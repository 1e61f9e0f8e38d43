//! Loading and static validation of `project.yaml`.
//!
//! A project is validated as a whole before any single action is used: an
//! unsupported command anywhere in the file fails every request against it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use super::registry::CommandRegistry;
use super::run_command::{variables_in, RunCommand, VariableRef};
use crate::error::JobError;

/// Name of the pipeline definition file inside a workspace checkout.
pub const PROJECT_FILE: &str = "project.yaml";

/// One named step in a pipeline definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDefinition {
    pub action_id: String,
    pub run: String,
    pub needs: Vec<String>,
    pub outputs: DeclaredOutputs,
}

impl ActionDefinition {
    /// Filename declared for `output_id`, if it is declared as a plain string.
    pub fn output_filename(&self, output_id: &str) -> Option<&str> {
        self.outputs.filename(output_id)
    }
}

/// The `outputs` of an action, in the order the project file declares them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclaredOutputs(Vec<(String, serde_yaml::Value)>);

impl DeclaredOutputs {
    fn from_mapping(action_id: &str, mapping: serde_yaml::Mapping) -> Result<Self, JobError> {
        let mut outputs = Self::default();
        for (key, value) in mapping {
            match key {
                serde_yaml::Value::String(name) => outputs.insert(name, value),
                other => {
                    return Err(JobError::InvalidProjectFile(format!(
                        "Action {action_id}: output name {other:?} is not a string"
                    )))
                }
            }
        }
        Ok(outputs)
    }

    /// Adds an output, replacing the value of an existing one in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_yaml::Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, output_id: &str) -> Option<&serde_yaml::Value> {
        self.0
            .iter()
            .find(|(name, _)| name == output_id)
            .map(|(_, value)| value)
    }

    /// Filename declared for `output_id`, if it is declared as a plain string.
    pub fn filename(&self, output_id: &str) -> Option<&str> {
        self.get(output_id).and_then(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_yaml::Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    /// Outputs whose value is a filename, in declaration order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter()
            .filter_map(|(name, value)| value.as_str().map(|file| (name, file)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<serde_yaml::Value>> FromIterator<(K, V)> for DeclaredOutputs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut outputs = Self::default();
        for (name, value) in iter {
            outputs.insert(name, value);
        }
        outputs
    }
}

impl Serialize for DeclaredOutputs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(name, value)| (name, value)))
    }
}

#[derive(Debug, Deserialize)]
struct RawProject {
    actions: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    run: String,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default)]
    outputs: serde_yaml::Mapping,
}

/// A validated pipeline definition.
#[derive(Debug, Clone)]
pub struct ProjectDefinition {
    order: Vec<String>,
    actions: BTreeMap<String, ActionDefinition>,
}

impl ProjectDefinition {
    /// Reads and validates `<workdir>/project.yaml`.
    pub fn load(workdir: &Path, registry: &CommandRegistry) -> Result<Self, JobError> {
        let path = workdir.join(PROJECT_FILE);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::WorkspaceNotFound { path: workdir.into() })
            }
            Err(e) => return Err(JobError::filesystem(path, e)),
        };
        Self::parse(&source, registry)
    }

    /// Parses and validates a pipeline definition.
    ///
    /// Fails on the first problem found; a partially valid definition is
    /// never returned.
    pub fn parse(source: &str, registry: &CommandRegistry) -> Result<Self, JobError> {
        let raw: RawProject = serde_yaml::from_str(source)
            .map_err(|e| JobError::InvalidProjectFile(e.to_string()))?;

        let mut order = Vec::with_capacity(raw.actions.len());
        let mut actions = BTreeMap::new();
        let mut seen_runs: HashSet<(String, Vec<String>)> = HashSet::new();

        for (key, value) in raw.actions {
            let action_id = key
                .as_str()
                .ok_or_else(|| {
                    JobError::InvalidProjectFile(format!("Action name {key:?} is not a string"))
                })?
                .to_string();

            let raw_action: RawAction = serde_yaml::from_value(value).map_err(|e| {
                JobError::InvalidProjectFile(format!("Action {action_id}: {e}"))
            })?;

            let command = RunCommand::parse(&raw_action.run)?;
            if !registry.contains(&command.token) {
                return Err(JobError::UnsupportedRunCommand {
                    command: command.token,
                });
            }

            if !seen_runs.insert(command.signature()) {
                return Err(JobError::DuplicateRunCommand {
                    command: command.token,
                    args: command.args,
                });
            }

            // Syntax only: whether the referenced action and output exist is
            // checked against resolved dependencies at interpolation time.
            for variable in variables_in(&raw_action.run) {
                VariableRef::parse(variable)?;
            }

            let mut needs = Vec::with_capacity(raw_action.needs.len());
            for dependency in raw_action.needs {
                if !needs.contains(&dependency) {
                    needs.push(dependency);
                }
            }

            let outputs = DeclaredOutputs::from_mapping(&action_id, raw_action.outputs)?;

            debug!(action_id = %action_id, command = %command.token, "Validated action");

            order.push(action_id.clone());
            actions.insert(
                action_id.clone(),
                ActionDefinition {
                    action_id,
                    run: raw_action.run,
                    needs,
                    outputs,
                },
            );
        }

        Ok(Self { order, actions })
    }

    /// Looks up an action by id.
    pub fn get(&self, action_id: &str) -> Option<&ActionDefinition> {
        self.actions.get(action_id)
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.actions.contains_key(action_id)
    }

    /// Actions in declaration order.
    pub fn actions(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.order.iter().filter_map(|id| self.actions.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
actions:
  generate_cohorts:
    run: cohortextractor:latest generate_cohort
    outputs:
      cohort: input.csv
  run_model:
    run: stata-mp:latest analysis/model.do ${{ needs.generate_cohorts.outputs.cohort }}
    needs: [generate_cohorts]
    outputs:
      log: model.log
"#;

    fn parse(source: &str) -> Result<ProjectDefinition, JobError> {
        ProjectDefinition::parse(source, &CommandRegistry::builtin())
    }

    #[test]
    fn test_parse_simple_project() {
        let project = parse(SIMPLE).unwrap();
        assert_eq!(project.len(), 2);

        let ids: Vec<&str> = project.actions().map(|a| a.action_id.as_str()).collect();
        assert_eq!(ids, vec!["generate_cohorts", "run_model"]);

        let model = project.get("run_model").unwrap();
        assert_eq!(model.needs, vec!["generate_cohorts"]);
        assert_eq!(model.output_filename("log"), Some("model.log"));
    }

    #[test]
    fn test_outputs_keep_declaration_order() {
        let source = r#"
actions:
  a:
    run: cohortextractor generate_cohort
    outputs:
      zeta: z.csv
      alpha: a.csv
      tables: [t1.csv, t2.csv]
"#;
        let project = parse(source).unwrap();
        let outputs = &project.get("a").unwrap().outputs;

        assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "tables"]);
        assert_eq!(
            outputs.files().collect::<Vec<_>>(),
            vec![("zeta", "z.csv"), ("alpha", "a.csv")]
        );
        assert!(outputs.get("tables").unwrap().is_sequence());
        assert_eq!(outputs.filename("tables"), None);
    }

    #[test]
    fn test_non_string_output_name_rejected() {
        let source = r#"
actions:
  a:
    run: cohortextractor generate_cohort
    outputs:
      1: one.csv
"#;
        assert!(matches!(
            parse(source),
            Err(JobError::InvalidProjectFile(_))
        ));
    }

    #[test]
    fn test_unsupported_command_rejected_even_if_unrequested() {
        let source = r#"
actions:
  ok:
    run: cohortextractor generate_cohort
  bad:
    run: rm -rf /
"#;
        let err = parse(source).unwrap_err();
        assert!(matches!(err, JobError::UnsupportedRunCommand { ref command } if command == "rm"));
    }

    #[test]
    fn test_duplicate_run_signature() {
        let source = r#"
actions:
  run_model_1:
    run: stata-mp:1.0 analysis/model.do
  run_model_2:
    run: stata-mp:2.0 analysis/model.do
"#;
        assert!(matches!(
            parse(source),
            Err(JobError::DuplicateRunCommand { .. })
        ));
    }

    #[test]
    fn test_duplicate_detection_uses_normalized_variables() {
        let source = r#"
actions:
  a:
    run: cohortextractor generate_cohort
  b:
    run: stata-mp m.do ${{ needs.a.outputs.x }}
  c:
    run: stata-mp m.do ${{needs.a.outputs.x}}
"#;
        assert!(matches!(
            parse(source),
            Err(JobError::DuplicateRunCommand { .. })
        ));
    }

    #[test]
    fn test_invalid_variable_rejected() {
        let source = r#"
actions:
  a:
    run: stata-mp m.do ${{ secrets.password }}
"#;
        assert!(matches!(
            parse(source),
            Err(JobError::InvalidVariableReference(_))
        ));
    }

    #[test]
    fn test_variable_existence_not_checked_at_load() {
        let source = r#"
actions:
  a:
    run: stata-mp m.do ${{ needs.nowhere.outputs.nothing }}
"#;
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_missing_actions_is_invalid() {
        assert!(matches!(
            parse("version: 1\n"),
            Err(JobError::InvalidProjectFile(_))
        ));
        assert!(matches!(
            parse("actions:\n  a:\n    needs: []\n"),
            Err(JobError::InvalidProjectFile(_))
        ));
    }

    #[test]
    fn test_needs_deduplicated_in_order() {
        let source = r#"
actions:
  a:
    run: stata-mp a.do
    needs: [x, y, x]
"#;
        let project = parse(source).unwrap();
        assert_eq!(project.get("a").unwrap().needs, vec!["x", "y"]);
    }

    #[test]
    fn test_load_missing_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProjectDefinition::load(dir.path(), &CommandRegistry::builtin()).unwrap_err();
        assert!(matches!(err, JobError::WorkspaceNotFound { .. }));
        assert_eq!(err.status_code(), -1);
    }

    #[test]
    fn test_load_from_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_FILE), SIMPLE).unwrap();
        let project = ProjectDefinition::load(dir.path(), &CommandRegistry::builtin()).unwrap();
        assert!(project.contains("generate_cohorts"));
    }
}
