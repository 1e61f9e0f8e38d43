//! CLI command definitions for jobrunner.
//!
//! `watch` supervises the job queue; `validate` and `resolve` exercise the
//! resolution pipeline against a local checkout without touching the queue
//! or docker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::execution::DockerJobRunner;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    parse_env, Environment, JobContext, PipelineResolver, RunnerConfig, WorkspaceIdentity,
};
use crate::project::{CommandRegistry, DependencyGraph, ProjectDefinition};
use crate::scheduler::{HttpJobQueue, JobSupervisor, SupervisorConfig};

/// Sandboxed pipeline job runner.
#[derive(Parser)]
#[command(name = "jobrunner")]
#[command(about = "Resolve and run sandboxed pipeline actions from a job queue")]
#[command(version)]
#[command(
    long_about = "jobrunner pulls pending jobs from a job server, resolves the requested action of a project.yaml pipeline into a docker invocation, runs it under a time budget and reports a safe status back.\n\nExample usage:\n  jobrunner --env-file .env watch\n  jobrunner resolve --workdir ./study --operation run_model --repo https://github.com/org/study --tag master --db full"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Dotenv-style file overlaid on the process environment.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// YAML file replacing the built-in run command registry.
    #[arg(long, global = true)]
    pub commands: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Supervise the job queue.
    Watch(WatchArgs),

    /// Load and validate a project.yaml, printing its action graph.
    Validate(ValidateArgs),

    /// Resolve one action into its docker invocation, printed as JSON.
    Resolve(ResolveArgs),
}

/// Arguments for `jobrunner watch`.
#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Run a single fetch-to-report cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `jobrunner validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Directory containing project.yaml.
    #[arg(short = 'w', long, default_value = ".")]
    pub workdir: PathBuf,
}

/// Arguments for `jobrunner resolve`.
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Directory containing project.yaml.
    #[arg(short = 'w', long, default_value = ".")]
    pub workdir: PathBuf,

    /// Action to resolve.
    #[arg(short = 'o', long)]
    pub operation: String,

    /// Repository URL the checkout came from.
    #[arg(long)]
    pub repo: String,

    /// Branch or tag of the checkout.
    #[arg(long)]
    pub tag: String,

    /// Database flavour (e.g. full, dummy).
    #[arg(long)]
    pub db: String,

    /// Workspace owner.
    #[arg(long)]
    pub owner: Option<String>,

    /// Workspace name.
    #[arg(long)]
    pub name: Option<String>,
}

/// Parse CLI arguments without executing any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let environment = load_environment(cli.env_file.as_deref())?;
    let registry = load_registry(cli.commands.as_deref())?;

    match cli.command {
        Commands::Watch(args) => run_watch_command(args, registry, environment).await,
        Commands::Validate(args) => run_validate_command(args, &registry),
        Commands::Resolve(args) => run_resolve_command(args, registry, environment),
    }
}

fn load_environment(env_file: Option<&Path>) -> anyhow::Result<Environment> {
    let environment = Environment::from_process();
    let Some(path) = env_file else {
        return Ok(environment);
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read env file {}: {}", path.display(), e))?;
    Ok(environment.overlay(parse_env(&contents)))
}

fn load_registry(commands: Option<&Path>) -> anyhow::Result<CommandRegistry> {
    match commands {
        Some(path) => {
            let registry = CommandRegistry::from_path(path).map_err(|e| {
                anyhow::anyhow!("Failed to load command registry {}: {}", path.display(), e)
            })?;
            info!(path = %path.display(), "Loaded command registry");
            Ok(registry)
        }
        None => Ok(CommandRegistry::builtin()),
    }
}

// ============================================================================
// watch
// ============================================================================

async fn run_watch_command(
    args: WatchArgs,
    registry: CommandRegistry,
    environment: Environment,
) -> anyhow::Result<()> {
    let config = RunnerConfig::from_environment(environment)?;

    let mut queue = HttpJobQueue::new(config.require_endpoint()?, config.backend.clone())?;
    if let Some((user, pass)) = &config.queue_auth {
        queue = queue.with_basic_auth(user, pass);
    }

    let shutdown = CancellationToken::new();
    let resolver = PipelineResolver::from_config(registry, &config);
    let runner = DockerJobRunner::new(resolver);
    let supervisor = JobSupervisor::new(
        Arc::new(queue),
        Arc::new(runner),
        SupervisorConfig::from_runner_config(&config),
    )
    .with_shutdown(shutdown.clone());

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    if args.once {
        match supervisor.run_once().await? {
            Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            None => info!("No job completed"),
        }
    } else {
        supervisor.watch().await;
    }

    if args.print_metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

// ============================================================================
// validate
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ValidatedAction {
    action_id: String,
    run: String,
    needs: Vec<String>,
    needed_by: Vec<String>,
    outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ValidateOutput {
    status: String,
    actions: Vec<ValidatedAction>,
}

fn run_validate_command(args: ValidateArgs, registry: &CommandRegistry) -> anyhow::Result<()> {
    let project = ProjectDefinition::load(&args.workdir, registry)?;
    let graph = DependencyGraph::build(project.actions())?;

    let actions = project
        .actions()
        .map(|action| ValidatedAction {
            action_id: action.action_id.clone(),
            run: action.run.clone(),
            needs: graph
                .predecessors(&action.action_id)
                .into_iter()
                .map(str::to_string)
                .collect(),
            needed_by: graph
                .successors(&action.action_id)
                .into_iter()
                .map(str::to_string)
                .collect(),
            outputs: action.outputs.names().map(str::to_string).collect(),
        })
        .collect();

    let output = ValidateOutput {
        status: "valid".to_string(),
        actions,
    };

    let json_output = serde_json::to_string_pretty(&output)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

// ============================================================================
// resolve
// ============================================================================

fn run_resolve_command(
    args: ResolveArgs,
    registry: CommandRegistry,
    environment: Environment,
) -> anyhow::Result<()> {
    let config = RunnerConfig::from_environment(environment)?;
    let resolver = PipelineResolver::from_config(registry, &config);

    let mut workspace = WorkspaceIdentity::new(args.repo, args.tag, args.db);
    if let Some(owner) = args.owner {
        workspace = workspace.with_owner(owner);
    }
    if let Some(name) = args.name {
        workspace = workspace.with_name(name);
    }

    let job = JobContext::new(args.operation, workspace);
    let resolved = resolver.resolve(&args.workdir, &job)?;

    let json_output = serde_json::to_string_pretty(&resolved)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_watch_command_defaults() {
        let cli = Cli::try_parse_from(["jobrunner", "watch"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(cli.env_file.is_none());
        assert!(cli.commands.is_none());
        match cli.command {
            Commands::Watch(args) => {
                assert!(!args.once);
                assert!(!args.print_metrics);
            }
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_watch_once_with_global_flags() {
        let cli = Cli::try_parse_from([
            "jobrunner",
            "watch",
            "--once",
            "--print-metrics",
            "--env-file",
            "/etc/jobrunner.env",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.env_file, Some(PathBuf::from("/etc/jobrunner.env")));
        match cli.command {
            Commands::Watch(args) => {
                assert!(args.once);
                assert!(args.print_metrics);
            }
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_resolve_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "jobrunner",
            "--commands",
            "registry.yaml",
            "resolve",
            "--workdir",
            "/tmp/study",
            "--operation",
            "run_model",
            "--repo",
            "https://github.com/org/study",
            "--tag",
            "master",
            "--db",
            "full",
            "--owner",
            "me",
            "--name",
            "ws",
        ])
        .expect("should parse");

        assert_eq!(cli.commands, Some(PathBuf::from("registry.yaml")));
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.workdir, PathBuf::from("/tmp/study"));
                assert_eq!(args.operation, "run_model");
                assert_eq!(args.db, "full");
                assert_eq!(args.owner.as_deref(), Some("me"));
                assert_eq!(args.name.as_deref(), Some("ws"));
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_resolve_requires_operation() {
        let result = Cli::try_parse_from([
            "jobrunner", "resolve", "--repo", "r", "--tag", "t", "--db", "full",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_defaults_to_current_dir() {
        let cli = Cli::try_parse_from(["jobrunner", "validate"]).expect("should parse");
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.workdir, PathBuf::from(".")),
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_load_environment_overlays_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# local\nJOBRUNNER_TEST_OVERLAY = 'from-file'\n").unwrap();

        let environment = load_environment(Some(&path)).unwrap();
        assert_eq!(environment.get("JOBRUNNER_TEST_OVERLAY"), Some("from-file"));
    }

    #[test]
    fn test_load_environment_missing_file() {
        let result = load_environment(Some(Path::new("/nonexistent/jobrunner.env")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_registry_defaults_to_builtin() {
        let registry = load_registry(None).unwrap();
        assert!(registry.contains("cohortextractor"));
        assert!(registry.contains("stata-mp"));
    }
}
