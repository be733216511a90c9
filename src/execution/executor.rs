//! Stage executor - runs the actions of one stage through the command runner

use crate::{
    core::{
        action::{ActionSpec, PollSpec},
        context::EnvironmentContext,
        credentials::{CredentialLease, CredentialStore},
        error::{PipelineError, Result},
        stage::Stage,
    },
    execution::{AbortHandle, EventBus, ExecutionEvent},
    runner::{CommandOutput, CommandRunner, CommandStatus, Invocation},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the actions of a stage ended
#[derive(Debug)]
pub enum StageOutcome {
    /// Every action completed
    Succeeded,
    /// An action exited non-zero, timed out or could not be launched
    Failed(String),
    /// The abort handle fired
    Aborted,
    /// Configuration or credential error; stops the whole run
    Fatal(PipelineError),
}

/// Everything a stage produced, already masked
#[derive(Debug)]
pub struct StageExecution {
    pub outcome: StageOutcome,
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the last invocation that exited
    pub exit_code: Option<i32>,
    pub artifacts: Vec<PathBuf>,
    /// Exit code of the invocation in flight, if it exited
    attempt_exit_code: Option<i32>,
}

impl StageExecution {
    fn new() -> Self {
        Self {
            outcome: StageOutcome::Succeeded,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            artifacts: Vec::new(),
            attempt_exit_code: None,
        }
    }

    fn record(&mut self, output: &CommandOutput) {
        self.stdout.push_str(&output.stdout);
        self.stderr.push_str(&output.stderr);
        self.exit_code = output.exit_code();
        self.attempt_exit_code = output.exit_code();
    }
}

/// Result of one action
#[derive(Debug, PartialEq, Eq)]
enum ActionVerdict {
    Completed,
    Failed(String),
    Aborted,
}

/// One invocation either produced output or stopped the action
enum Attempt {
    Finished(CommandOutput),
    Stopped(ActionVerdict),
}

/// Executes the actions of a single stage
pub struct StageExecutor<R> {
    runner: R,
}

impl<R: CommandRunner> StageExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the actions of `stage` in order, stopping at the first failure
    ///
    /// Each action runs inside the credential scope of the credentials it
    /// declares; the secrets are gone when the action returns.
    pub async fn execute(
        &self,
        stage: &Stage,
        ctx: &EnvironmentContext,
        credentials: &CredentialStore,
        default_timeout: Option<Duration>,
        abort: &AbortHandle,
        events: &EventBus,
    ) -> StageExecution {
        info!("Executing stage: {}", stage.name);
        let mut execution = StageExecution::new();

        for action in &stage.actions {
            if abort.is_aborted() {
                info!("Stage {} aborted before {}", stage.name, action.kind.name());
                execution.outcome = StageOutcome::Aborted;
                return execution;
            }

            let ids = action.credential_ids();
            let scoped = credentials
                .scope_many(&ids, |leases| {
                    self.run_action(
                        &stage.name,
                        action,
                        ctx,
                        leases,
                        default_timeout,
                        abort,
                        events,
                        &mut execution,
                    )
                })
                .await;

            match scoped.and_then(|verdict| verdict) {
                Ok(ActionVerdict::Completed) => {}
                Ok(ActionVerdict::Failed(reason)) => {
                    warn!("Stage {} failed in {}: {}", stage.name, action.kind.name(), reason);
                    execution.outcome = StageOutcome::Failed(reason);
                    return execution;
                }
                Ok(ActionVerdict::Aborted) => {
                    execution.outcome = StageOutcome::Aborted;
                    return execution;
                }
                Err(e) if e.is_fatal() => {
                    error!("Stage {} hit a fatal error: {}", stage.name, e);
                    execution.outcome = StageOutcome::Fatal(e);
                    return execution;
                }
                Err(e) => {
                    warn!("Stage {} failed in {}: {}", stage.name, action.kind.name(), e);
                    execution.outcome = StageOutcome::Failed(e.to_string());
                    return execution;
                }
            }
        }

        execution
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        &self,
        stage: &str,
        action: &ActionSpec,
        ctx: &EnvironmentContext,
        leases: Vec<CredentialLease>,
        default_timeout: Option<Duration>,
        abort: &AbortHandle,
        events: &EventBus,
        execution: &mut StageExecution,
    ) -> Result<ActionVerdict> {
        let plan = action.plan(ctx, &leases, default_timeout)?;
        let name = action.kind.name();

        for invocation in &plan.invocations {
            if abort.is_aborted() {
                return Ok(ActionVerdict::Aborted);
            }

            let command = invocation.display();
            info!("[{}] $ {}", stage, command);
            events.emit(ExecutionEvent::ActionStarted {
                stage: stage.to_string(),
                action: name.to_string(),
                command,
            });

            let started = Instant::now();
            execution.attempt_exit_code = None;
            let verdict = match &plan.poll {
                Some(poll) => self.poll_gate(invocation, poll, abort, execution).await?,
                None => match self.attempt(invocation, abort, execution).await? {
                    Attempt::Finished(output) => verdict_for(invocation, &output),
                    Attempt::Stopped(verdict) => verdict,
                },
            };

            events.emit(ExecutionEvent::ActionFinished {
                stage: stage.to_string(),
                action: name.to_string(),
                success: verdict == ActionVerdict::Completed,
                exit_code: execution.attempt_exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
            });

            if verdict != ActionVerdict::Completed {
                return Ok(verdict);
            }
        }

        execution.artifacts.extend(plan.outputs);
        Ok(ActionVerdict::Completed)
    }

    /// Run one invocation, racing it against the abort handle
    ///
    /// Dropping the runner future on abort kills the child process.
    async fn attempt(
        &self,
        invocation: &Invocation,
        abort: &AbortHandle,
        execution: &mut StageExecution,
    ) -> Result<Attempt> {
        let result = tokio::select! {
            result = self.runner.run_masked(invocation) => result,
            _ = abort.aborted() => {
                warn!("Aborting {}", invocation.program);
                return Ok(Attempt::Stopped(ActionVerdict::Aborted));
            }
        };

        match result {
            Ok(output) => {
                execution.record(&output);
                Ok(Attempt::Finished(output))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{}", e);
                execution.stderr.push_str(&format!("{}\n", e));
                Ok(Attempt::Stopped(ActionVerdict::Failed(e.to_string())))
            }
        }
    }

    /// Run a probe at a fixed interval until its output gives a verdict
    async fn poll_gate(
        &self,
        invocation: &Invocation,
        poll: &PollSpec,
        abort: &AbortHandle,
        execution: &mut StageExecution,
    ) -> Result<ActionVerdict> {
        let deadline = Instant::now() + poll.wait;
        let mut probes = 0;

        loop {
            probes += 1;
            let output = match self.attempt(invocation, abort, execution).await? {
                Attempt::Finished(output) => output,
                Attempt::Stopped(verdict) => return Ok(verdict),
            };

            let text = format!("{}\n{}", output.stdout, output.stderr);
            if let Some(fail) = &poll.fail {
                if fail.matches(&text) {
                    return Ok(ActionVerdict::Failed(format!(
                        "quality gate failed: output matched {}",
                        fail
                    )));
                }
            }
            if poll.pass.matches(&text) {
                info!("Quality gate passed after {} probe(s)", probes);
                return Ok(ActionVerdict::Completed);
            }

            if Instant::now() + poll.interval > deadline {
                return Ok(ActionVerdict::Failed(
                    PipelineError::Timeout {
                        what: "quality gate".to_string(),
                        secs: poll.wait.as_secs(),
                    }
                    .to_string(),
                ));
            }

            debug!("Quality gate has no verdict yet (probe {})", probes);
            tokio::select! {
                _ = tokio::time::sleep(poll.interval) => {}
                _ = abort.aborted() => return Ok(ActionVerdict::Aborted),
            }
        }
    }
}

fn verdict_for(invocation: &Invocation, output: &CommandOutput) -> ActionVerdict {
    match output.status {
        CommandStatus::Exited(0) => ActionVerdict::Completed,
        CommandStatus::Exited(code) => ActionVerdict::Failed(
            PipelineError::NonZeroExit {
                program: invocation.program.clone(),
                code,
            }
            .to_string(),
        ),
        CommandStatus::TimedOut => ActionVerdict::Failed(
            PipelineError::Timeout {
                what: invocation.program.clone(),
                secs: invocation.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }
            .to_string(),
        ),
    }
}
