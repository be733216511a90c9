//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{
        context::EnvironmentContext,
        credentials::CredentialStore,
        error::PipelineError,
        stage::{FailurePolicy, Stage},
        Pipeline, Run, StageResult, StageStatus,
    },
    execution::{
        AbortHandle, EventBus, ExecutionEvent, StageExecutor, StageLogWriter, StageOutcome,
    },
    notify::Notifier,
    persistence::RunStore,
    runner::CommandRunner,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Runs pipelines stage by stage and reports every run exactly once
pub struct PipelineExecutor<R> {
    executor: StageExecutor<R>,
    events: EventBus,
    notifier: Option<Arc<dyn Notifier>>,
    store: Option<Arc<dyn RunStore>>,
    logs: Option<StageLogWriter>,
}

impl<R: CommandRunner> PipelineExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            executor: StageExecutor::new(runner),
            events: EventBus::new(),
            notifier: None,
            store: None,
            logs: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// History store; also allocates build numbers
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_log_writer(mut self, logs: StageLogWriter) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn runner(&self) -> &R {
        self.executor.runner()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Execute the entire pipeline
    ///
    /// Never fails: configuration errors and stage failures end up in the
    /// returned [`Run`]. The notifier is invoked exactly once before returning.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        ctx: &EnvironmentContext,
        credentials: &CredentialStore,
    ) -> Run {
        self.execute_with_abort(pipeline, ctx, credentials, &AbortHandle::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping early when `abort` fires
    ///
    /// The handle belongs to this run only; other runs on the same executor
    /// never see it.
    pub async fn execute_with_abort(
        &self,
        pipeline: &Pipeline,
        ctx: &EnvironmentContext,
        credentials: &CredentialStore,
        abort: &AbortHandle,
    ) -> Run {
        let mut run = self.start(pipeline).await;

        let ctx = run_context(ctx, &run);
        match pipeline.preflight(&ctx, credentials) {
            Ok(()) => {
                self.run_stages(pipeline, &ctx, credentials, abort, &mut run)
                    .await
            }
            Err(e) => self.skip_all(pipeline, &mut run, e),
        }

        self.finish(run).await
    }

    /// Record a run that could not start, e.g. because its context failed to build
    ///
    /// Every stage is SKIPPED, the run is FAILED and the notifier still runs.
    pub async fn fail_before_start(&self, pipeline: &Pipeline, error: PipelineError) -> Run {
        let mut run = self.start(pipeline).await;
        self.skip_all(pipeline, &mut run, error);
        self.finish(run).await
    }

    async fn start(&self, pipeline: &Pipeline) -> Run {
        let mut run = Run::new(&pipeline.name);
        run.build_number = self.allocate_build_number(&pipeline.name).await;

        info!(
            "Starting pipeline execution: {} ({}{})",
            pipeline.name,
            run.id,
            run.build_number.map(|n| format!(", build #{}", n)).unwrap_or_default()
        );
        self.events.emit(ExecutionEvent::PipelineStarted {
            run_id: run.id,
            pipeline: pipeline.name.clone(),
            build_number: run.build_number,
            stages: pipeline.stages.len(),
        });
        run
    }

    fn skip_all(&self, pipeline: &Pipeline, run: &mut Run, error: PipelineError) {
        error!("Pre-flight check failed: {}", error);
        run.fatal_error = Some(error.to_string());
        for stage in &pipeline.stages {
            self.skip(run, &stage.name, "pre-flight check failed");
        }
    }

    async fn run_stages(
        &self,
        pipeline: &Pipeline,
        ctx: &EnvironmentContext,
        credentials: &CredentialStore,
        abort: &AbortHandle,
        run: &mut Run,
    ) {
        // Set once the run stops; every later stage is skipped with this reason
        let mut halted: Option<String> = None;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            if let Some(reason) = &halted {
                self.skip(run, &stage.name, reason);
                continue;
            }
            if abort.is_aborted() {
                info!("Run aborted before stage {}", stage.name);
                run.aborted = true;
                halted = Some("run aborted".to_string());
                self.skip(run, &stage.name, "run aborted");
                continue;
            }

            let stage_ctx = match stage.context(ctx) {
                Ok(stage_ctx) => stage_ctx,
                Err(e) => {
                    halted = Some(self.fatal(run, stage, e));
                    continue;
                }
            };

            match stage.guard.evaluate(&stage_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!("guard {} is false", stage.guard.describe());
                    info!("Skipping stage {}: {}", stage.name, reason);
                    self.skip(run, &stage.name, &reason);
                    continue;
                }
                Err(e) => {
                    halted = Some(self.fatal(run, stage, e));
                    continue;
                }
            }

            halted = self
                .run_stage(pipeline, index, stage, &stage_ctx, credentials, abort, run)
                .await;
        }
    }

    /// Execute one stage whose guard passed; returns why the run stops, if it does
    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        index: usize,
        stage: &Stage,
        ctx: &EnvironmentContext,
        credentials: &CredentialStore,
        abort: &AbortHandle,
        run: &mut Run,
    ) -> Option<String> {
        self.events.emit(ExecutionEvent::StageStarted {
            stage: stage.name.clone(),
            index,
        });
        let started_at = Utc::now();
        let clock = Instant::now();

        let execution = self
            .executor
            .execute(
                stage,
                ctx,
                credentials,
                pipeline.default_timeout,
                abort,
                &self.events,
            )
            .await;

        let mut halted = None;
        let (status, error) = match execution.outcome {
            StageOutcome::Succeeded => (StageStatus::Succeeded, None),
            StageOutcome::Failed(reason) => match stage.on_failure {
                FailurePolicy::Abort => {
                    error!("Stage {} failed: {}", stage.name, reason);
                    halted = Some(format!("stage {} failed", stage.name));
                    (StageStatus::Failed, Some(reason))
                }
                FailurePolicy::ContinueDegraded => {
                    warn!("Stage {} is unstable: {}", stage.name, reason);
                    (StageStatus::Unstable, Some(reason))
                }
            },
            StageOutcome::Aborted => {
                warn!("Stage {} interrupted by abort", stage.name);
                run.aborted = true;
                halted = Some("run aborted".to_string());
                (StageStatus::Failed, Some("aborted".to_string()))
            }
            StageOutcome::Fatal(e) => {
                run.fatal_error = Some(e.to_string());
                halted = Some("run stopped by a fatal error".to_string());
                (StageStatus::Failed, Some(e.to_string()))
            }
        };

        let mut result = StageResult {
            stage: stage.name.clone(),
            status,
            stdout: execution.stdout,
            stderr: execution.stderr,
            exit_code: execution.exit_code,
            error,
            reason: None,
            artifacts: execution.artifacts,
            log_file: None,
            started_at: Some(started_at),
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        if let Some(logs) = &self.logs {
            match logs.write(run.id, index, &result) {
                Ok(path) => result.log_file = Some(path),
                Err(e) => warn!("Cannot write log for stage {}: {}", stage.name, e),
            }
        }

        info!("Stage {} finished: {}", stage.name, status);
        self.events.emit(ExecutionEvent::StageFinished {
            stage: stage.name.clone(),
            status,
            duration_ms: result.duration_ms,
        });
        run.results.push(result);
        halted
    }

    /// Record a configuration error hit while preparing a stage
    fn fatal(&self, run: &mut Run, stage: &Stage, e: PipelineError) -> String {
        error!("Fatal error in stage {}: {}", stage.name, e);
        run.fatal_error = Some(e.to_string());
        let result = StageResult {
            status: StageStatus::Failed,
            error: Some(e.to_string()),
            reason: None,
            started_at: Some(Utc::now()),
            ..StageResult::skipped(&stage.name, "")
        };
        self.events.emit(ExecutionEvent::StageFinished {
            stage: stage.name.clone(),
            status: StageStatus::Failed,
            duration_ms: 0,
        });
        run.results.push(result);
        "run stopped by a fatal error".to_string()
    }

    fn skip(&self, run: &mut Run, stage: &str, reason: &str) {
        self.events.emit(ExecutionEvent::StageSkipped {
            stage: stage.to_string(),
            reason: reason.to_string(),
        });
        run.results.push(StageResult::skipped(stage, reason));
    }

    async fn allocate_build_number(&self, pipeline: &str) -> Option<u64> {
        let store = self.store.as_ref()?;
        match store.allocate_build_number(pipeline).await {
            Ok(number) => Some(number),
            Err(e) => {
                warn!("Cannot allocate build number: {:#}", e);
                None
            }
        }
    }

    /// Finalize, persist and notify
    async fn finish(&self, mut run: Run) -> Run {
        run.finish();
        let status = run.status();
        info!("Pipeline execution finished: {} - {}", run.pipeline, status);
        self.events.emit(ExecutionEvent::PipelineFinished {
            run_id: run.id,
            status,
        });

        if let Some(store) = &self.store {
            if let Err(e) = store.save_run(&run).await {
                warn!("Failed to save run {}: {:#}", run.id, e);
            }
        }

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&run).await {
                warn!("{}", e);
            }
        }
        run
    }
}

/// The caller's context plus `RUN_ID` and, when allocated, `BUILD_NUMBER`
///
/// Variables the caller already defines win.
fn run_context(ctx: &EnvironmentContext, run: &Run) -> EnvironmentContext {
    let mut extra = Vec::new();
    if !ctx.contains("RUN_ID") {
        extra.push(("RUN_ID".to_string(), run.id.to_string()));
    }
    if let Some(number) = run.build_number {
        if !ctx.contains("BUILD_NUMBER") {
            extra.push(("BUILD_NUMBER".to_string(), number.to_string()));
        }
    }
    if extra.is_empty() {
        ctx.clone()
    } else {
        ctx.with_overrides(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionSpec;
    use crate::core::guard::Guard;
    use crate::core::error::Result;
    use crate::core::RunStatus;
    use crate::persistence::InMemoryRunStore;
    use crate::runner::{CommandOutput, Invocation};
    use std::sync::Mutex;

    /// Exits with the code given as the first argument of `exit-with`
    #[derive(Default)]
    struct ExitCodeRunner {
        calls: Mutex<Vec<Invocation>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for ExitCodeRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            let code = match invocation.program.as_str() {
                "exit-with" => invocation
                    .args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(0),
                _ => 0,
            };
            Ok(CommandOutput::exited(code, invocation.args.join(" "), ""))
        }
    }

    fn exits(code: i32) -> ActionSpec {
        ActionSpec::command("exit-with", [code.to_string()])
    }

    #[tokio::test]
    async fn test_execute_simple_pipeline() {
        let pipeline = Pipeline::new("app")
            .stage(Stage::new("build").action(exits(0)))
            .stage(Stage::new("test").action(exits(0)));

        let engine = PipelineExecutor::new(ExitCodeRunner::default());
        let run = engine
            .execute(&pipeline, &EnvironmentContext::default(), &CredentialStore::new())
            .await;

        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.statuses(), vec![StageStatus::Succeeded, StageStatus::Succeeded]);
        assert!(run.is_finished());
    }

    #[tokio::test]
    async fn test_guard_false_runs_nothing() {
        let ctx = EnvironmentContext::builder().set("BRANCH", "feature/x").build().unwrap();
        let pipeline = Pipeline::new("app")
            .stage(Stage::new("deploy").when(Guard::equals("BRANCH", "main")).action(exits(0)));

        let engine = PipelineExecutor::new(ExitCodeRunner::default());
        let run = engine.execute(&pipeline, &ctx, &CredentialStore::new()).await;

        assert_eq!(run.statuses(), vec![StageStatus::Skipped]);
        assert!(run.results[0].reason.as_deref().unwrap().contains("BRANCH"));
        assert!(engine.runner().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_number_from_store() {
        let store = Arc::new(InMemoryRunStore::new());
        let pipeline = Pipeline::new("app")
            .stage(Stage::new("tag").action(ActionSpec::command("echo", ["{{ BUILD_NUMBER }}"])));

        let engine = PipelineExecutor::new(ExitCodeRunner::default()).with_store(store.clone());
        let ctx = EnvironmentContext::default();
        let first = engine.execute(&pipeline, &ctx, &CredentialStore::new()).await;
        let second = engine.execute(&pipeline, &ctx, &CredentialStore::new()).await;

        assert_eq!(first.build_number, Some(1));
        assert_eq!(second.build_number, Some(2));
        assert_eq!(second.results[0].stdout, "2");
        assert_eq!(store.load_run(first.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_stage_logs_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new("app")
            .stage(Stage::new("build").action(exits(0)))
            .stage(Stage::new("deploy").when(Guard::Never).action(exits(0)));

        let engine = PipelineExecutor::new(ExitCodeRunner::default())
            .with_log_writer(StageLogWriter::new(dir.path()));
        let run = engine
            .execute(&pipeline, &EnvironmentContext::default(), &CredentialStore::new())
            .await;

        let log = run.results[0].log_file.clone().unwrap();
        assert!(log.ends_with("01-build.log"));
        assert!(std::fs::read_to_string(log).unwrap().contains("status: SUCCEEDED"));
        assert_eq!(run.results[1].log_file, None);
    }

    #[tokio::test]
    async fn test_abort_is_scoped_to_one_run() {
        let pipeline = Pipeline::new("app").stage(Stage::new("build").action(exits(0)));
        let engine = PipelineExecutor::new(ExitCodeRunner::default());
        let ctx = EnvironmentContext::default();

        let abort = AbortHandle::new();
        abort.abort();
        let aborted = engine
            .execute_with_abort(&pipeline, &ctx, &CredentialStore::new(), &abort)
            .await;
        let next = engine.execute(&pipeline, &ctx, &CredentialStore::new()).await;
        let after = engine
            .execute_with_abort(&pipeline, &ctx, &CredentialStore::new(), &AbortHandle::new())
            .await;

        assert_eq!(aborted.status(), RunStatus::Aborted);
        assert_eq!(next.status(), RunStatus::Succeeded);
        assert_eq!(next.statuses(), vec![StageStatus::Succeeded]);
        assert_eq!(after.status(), RunStatus::Succeeded);
        assert_eq!(engine.runner().calls.lock().unwrap().len(), 2);
    }
}
