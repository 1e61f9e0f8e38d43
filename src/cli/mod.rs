//! Command-line interface for jobrunner.
//!
//! Provides commands for supervising the job queue and for validating and
//! resolving pipelines locally.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
