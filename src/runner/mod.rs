//! Command runner - the only way the pipeline touches external tools

pub mod mask;
pub mod process;

use crate::core::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use mask::{Masker, MASK};
pub use process::ProcessRunner;

/// A single external command: program plus structured argument list
#[derive(Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Written to the child's stdin; may carry secrets, never logged
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Secrets of the enclosing credential scope
    pub masker: Masker,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Masked, shell-quoted rendering for logs and events
    pub fn display(&self) -> String {
        let line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ");
        self.masker.mask(&line)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.display())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .field("stdin", &self.stdin.as_ref().map(|_| "****"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Quote a single argument for display
fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exit code; -1 when terminated by a signal
    Exited(i32),
    /// Killed after exceeding its timeout
    TimedOut,
}

/// Captured result of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Exited(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Exited(code) => Some(code),
            CommandStatus::TimedOut => None,
        }
    }

    fn masked(self, masker: &Masker) -> Self {
        if masker.is_empty() {
            return self;
        }
        Self {
            status: self.status,
            stdout: masker.mask(&self.stdout),
            stderr: masker.mask(&self.stderr),
        }
    }
}

/// Trait for command execution - allows for different implementations
///
/// Implementations never fail on a non-zero exit; only a failure to start
/// the program is an error (`PipelineError::LaunchError`).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run and strip the invocation's secrets from the captured output
    async fn run_masked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.run(invocation).await?;
        Ok(output.masked(&invocation.masker))
    }
}

#[async_trait]
impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        (**self).run(invocation).await
    }
}
