//! Pipeline definitions: the `project.yaml` format, the registry of
//! supported run commands, and the dependency graph between actions.
//!
//! # Example
//!
//! ```ignore
//! use jobrunner::project::{CommandRegistry, DependencyGraph, ProjectDefinition};
//!
//! let registry = CommandRegistry::builtin();
//! let project = ProjectDefinition::load(workdir, &registry)?;
//! let graph = DependencyGraph::build(project.actions())?;
//! for dependency in graph.predecessors("run_model") {
//!     println!("run_model needs {dependency}");
//! }
//! ```

pub mod definition;
pub mod graph;
pub mod registry;
pub mod run_command;

pub use definition::{ActionDefinition, DeclaredOutputs, ProjectDefinition, PROJECT_FILE};
pub use graph::DependencyGraph;
pub use registry::{
    ArgTemplate, CommandRegistry, Placeholder, PlaceholderValues, PrivacyTier, RegistryError,
    RunCommandSpec,
};
pub use run_command::{RunCommand, VariableRef, DEFAULT_VERSION};
