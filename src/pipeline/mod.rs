//! Job resolution: from a requested action to a backend invocation.
//!
//! # Flow
//!
//! 1. **Load**: `project.yaml` is read and validated as a whole
//! 2. **Graph**: direct dependencies of the requested action are found
//! 3. **Materialize**: the requested action gets paths, a container name and
//!    a rendered invocation
//! 4. **Completion**: each dependency is materialized and must have produced
//!    all of its declared outputs
//! 5. **Interpolate**: `${{ needs.X.outputs.Y }}` arguments become the
//!    dependency's output file paths
//!
//! # Example
//!
//! ```rust,ignore
//! use jobrunner::pipeline::{JobContext, PipelineResolver, RunnerConfig, WorkspaceIdentity};
//! use jobrunner::project::CommandRegistry;
//!
//! let config = RunnerConfig::from_env()?;
//! let resolver = PipelineResolver::from_config(CommandRegistry::builtin(), &config);
//!
//! let job = JobContext::new(
//!     "run_model",
//!     WorkspaceIdentity::new("https://github.com/opensafely/study", "master", "full"),
//! );
//! let action = resolver.resolve(workdir, &job)?;
//! println!("docker run {}", action.docker_invocation().join(" "));
//! ```
//!
//! # Configuration
//!
//! Storage roots and database URLs come from the environment; see
//! [`RunnerConfig::from_environment`] for the full list.

pub mod completion;
pub mod config;
pub mod interpolate;
pub mod materialize;
pub mod paths;
pub mod resolver;

pub use completion::assert_finished;
pub use config::{
    parse_env, ConfigError, Environment, RunnerConfig, StorageRoots, DEFAULT_BACKEND,
    DEFAULT_CANCEL_GRACE, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
pub use interpolate::{interpolate, interpolate_action};
pub use materialize::{Materializer, ResolvedAction, VOLUME_FLAG};
pub use paths::{container_name_for, safe_join, PathResolver, WorkspaceIdentity};
pub use resolver::{JobContext, PipelineResolver};
