//! Test doubles for scenario tests

use async_trait::async_trait;
use stageline::core::error::Result;
use stageline::core::{
    CredentialStore, EnvironmentContext, Pipeline, Run, RunStatus, StageStatus,
};
use stageline::notify::Notifier;
use stageline::runner::{CommandOutput, CommandRunner, Invocation};
use stageline::{AbortHandle, PipelineExecutor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runner with canned results per program
///
/// Unknown programs exit 0 and echo their arguments. `print-env NAME`
/// prints an injected environment variable, `hang` never returns.
#[derive(Default)]
pub struct FakeRunner {
    results: Mutex<HashMap<String, CommandOutput>>,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call of `program` ends with `output`
    pub fn on(self, program: &str, output: CommandOutput) -> Self {
        self.results
            .lock()
            .unwrap()
            .insert(program.to_string(), output);
        self
    }

    /// `program` exits with `code` and prints `stderr`
    pub fn failing(self, program: &str, code: i32, stderr: &str) -> Self {
        self.on(program, CommandOutput::exited(code, "", stderr))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.program).collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        match invocation.program.as_str() {
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CommandOutput::exited(0, "", ""))
            }
            "print-env" => {
                let name = invocation.args.first().cloned().unwrap_or_default();
                let value = invocation.env.get(&name).cloned().unwrap_or_default();
                Ok(CommandOutput::exited(0, format!("{}={}", name, value), ""))
            }
            program => {
                let canned = self.results.lock().unwrap().get(program).cloned();
                Ok(canned
                    .unwrap_or_else(|| CommandOutput::exited(0, invocation.args.join(" "), "")))
            }
        }
    }
}

/// Notifier that keeps every run it is handed
#[derive(Default)]
pub struct RecordingNotifier {
    runs: Mutex<Vec<Run>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn last(&self) -> Run {
        self.runs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("notifier was never called")
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, run: &Run) -> Result<()> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }
}

/// Build an executor around `runner` that reports to `notifier`
pub fn executor(
    runner: FakeRunner,
    notifier: &Arc<RecordingNotifier>,
) -> PipelineExecutor<FakeRunner> {
    PipelineExecutor::new(runner).with_notifier(notifier.clone())
}

/// Run with an empty credential store
pub async fn run(
    engine: &PipelineExecutor<FakeRunner>,
    pipeline: &Pipeline,
    ctx: &EnvironmentContext,
) -> Run {
    engine.execute(pipeline, ctx, &CredentialStore::new()).await
}

/// Run with an empty credential store, stopping when `abort` fires
pub async fn run_until_aborted(
    engine: &PipelineExecutor<FakeRunner>,
    pipeline: &Pipeline,
    ctx: &EnvironmentContext,
    abort: &AbortHandle,
) -> Run {
    engine
        .execute_with_abort(pipeline, ctx, &CredentialStore::new(), abort)
        .await
}

pub fn assert_statuses(run: &Run, expected: &[StageStatus]) {
    assert_eq!(
        run.statuses(),
        expected,
        "unexpected stage statuses: {:#?}",
        run.results
    );
}

pub fn assert_run_status(run: &Run, expected: RunStatus) {
    assert_eq!(run.status(), expected, "run: {:#?}", run);
}
