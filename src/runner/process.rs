//! Subprocess runner built on tokio::process

use crate::core::error::{PipelineError, Result};
use crate::runner::{CommandOutput, CommandRunner, CommandStatus, Invocation};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long to wait for output pipes to drain after a kill
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs invocations as real child processes
///
/// Children are spawned with `kill_on_drop`, so dropping an in-flight
/// [`CommandRunner::run`] future (cancellation) kills the process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Applied when an invocation carries no timeout of its own
    default_timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

fn spawn_reader<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            // A read error just truncates the capture
            let _ = reader.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn spawn_writer<W>(
    program: &str,
    input: Option<String>,
    writer: Option<W>,
) -> Option<JoinHandle<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (input, mut writer) = (input?, writer?);
    let program = program.to_string();
    Some(tokio::spawn(async move {
        if let Err(e) = writer.write_all(input.as_bytes()).await {
            warn!("Failed to write stdin of {}: {}", program, e);
        }
        // Dropping the writer closes the pipe so the child sees EOF
    }))
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    match timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!("Spawning {}", invocation.display());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| PipelineError::LaunchError {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());
        // Must not block the wait below; a child may never read its stdin
        let feeder = spawn_writer(
            &invocation.program,
            invocation.stdin.clone(),
            child.stdin.take(),
        );

        let status = match invocation.timeout.or(self.default_timeout) {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(waited) => Some(waited?),
                Err(_) => {
                    warn!(
                        "{} timed out after {}s, killing",
                        invocation.program,
                        limit.as_secs()
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", invocation.program, e);
                    }
                    None
                }
            },
            None => Some(child.wait().await?),
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let status = match status {
            Some(status) => CommandStatus::Exited(status.code().unwrap_or(-1)),
            None => CommandStatus::TimedOut,
        };

        let output = CommandOutput {
            status,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        };
        debug!(
            "{} finished with {:?} ({} bytes stdout)",
            invocation.program,
            output.status,
            output.stdout.len()
        );
        Ok(output)
    }
}
