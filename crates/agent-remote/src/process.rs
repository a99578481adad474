//! Child process plumbing for tool servers.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::RemoteSessionConfig;
use crate::error::{RemoteError, Result};

/// A running tool server. Killed when dropped.
pub(crate) struct ServerProcess {
    name: String,
    child: Child,
}

pub(crate) struct Spawned {
    pub process: ServerProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub(crate) fn spawn(config: &RemoteSessionConfig) -> Result<Spawned> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn {
        command: config.command.clone(),
        source,
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RemoteError::transport("failed to capture tool server stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RemoteError::transport("failed to capture tool server stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        forward_stderr(config.name.clone(), stderr);
    }

    Ok(Spawned {
        process: ServerProcess {
            name: config.name.clone(),
            child,
        },
        stdin,
        stdout,
    })
}

/// Drain the child's stderr into our log so it can never fill the pipe.
fn forward_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, "{line}");
        }
    });
}

impl ServerProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    /// The caller is expected to have closed stdin already.
    pub async fn terminate(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "Tool server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "Failed to wait for tool server");
                self.kill().await;
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.name,
                    grace_ms = grace.as_millis(),
                    "Tool server did not exit in time, killing it"
                );
                self.kill().await;
            }
        }
    }

    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(server = %self.name, error = %e, "Kill failed (already exited?)");
        }
    }
}
