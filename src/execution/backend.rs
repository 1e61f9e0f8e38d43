//! The container runtime that actually runs resolved invocations.
//!
//! [`DockerCli`] shells out to `docker run` rather than talking to the
//! daemon API: the argument list produced by materialization (`--volume`
//! flags, `image:version`, arguments) is passed through unchanged.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised by an execution backend itself, as opposed to the
/// container it runs.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for container {container}: {source}")]
    Wait {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run of container {container} was cancelled")]
    Cancelled { container: String },
}

/// Captured result of one container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl BackendOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an invocation under a container name.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runs to completion, or until `cancel` fires. A non-zero exit is not an
    /// error at this level.
    async fn run(
        &self,
        container_name: &str,
        invocation: &[String],
        cancel: &CancellationToken,
    ) -> Result<BackendOutput, BackendError>;
}

/// Backend driving the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Uses a different client binary, e.g. `podman`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Full argument list passed to the client for a run.
    pub fn run_args(container_name: &str, invocation: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];
        args.extend(invocation.iter().cloned());
        args
    }

    /// Force-removes a container, ignoring failures.
    async fn remove(&self, container_name: &str) {
        if let Err(e) = Command::new(&self.program)
            .args(["rm", "--force", container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            debug!(container = %container_name, error = %e, "Failed to remove container (may not exist)");
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read container output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ExecutionBackend for DockerCli {
    async fn run(
        &self,
        container_name: &str,
        invocation: &[String],
        cancel: &CancellationToken,
    ) -> Result<BackendOutput, BackendError> {
        info!(container = %container_name, "Starting container");

        let mut child = Command::new(&self.program)
            .args(Self::run_args(container_name, invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| BackendError::Wait {
                container: container_name.to_string(),
                source,
            })?,
            _ = cancel.cancelled() => {
                warn!(container = %container_name, "Cancelling container run");
                if let Err(e) = child.kill().await {
                    debug!(container = %container_name, error = %e, "Client process already gone");
                }
                // Killing the client does not stop the container itself.
                self.remove(container_name).await;
                return Err(BackendError::Cancelled {
                    container: container_name.to_string(),
                });
            }
        };

        let output = BackendOutput {
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            exit_code: status.code().unwrap_or(-1),
        };

        info!(
            container = %container_name,
            exit_code = output.exit_code,
            "Container finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_prefix_invocation() {
        let invocation = vec![
            "--volume".to_string(),
            "/a:/a".to_string(),
            "image:latest".to_string(),
        ];
        assert_eq!(
            DockerCli::run_args("a", &invocation),
            vec!["run", "--rm", "--name", "a", "--volume", "/a:/a", "image:latest"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let backend = DockerCli::new().with_program("/nonexistent/docker-client");
        let err = backend
            .run("c", &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        // `echo run --rm --name c hello` stands in for the docker client.
        let backend = DockerCli::new().with_program("echo");
        let output = backend
            .run("c", &["hello".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "run --rm --name c hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_run() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-docker");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = rm ]; then exit 0; fi\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = DockerCli::new().with_program(script.to_string_lossy());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            backend.run("c", &[], &cancel),
        )
        .await
        .expect("cancelled run returns promptly");
        assert!(matches!(result, Err(BackendError::Cancelled { .. })));
    }
}
