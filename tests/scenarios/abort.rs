//! External abort requests

use crate::helpers::*;
use stageline::core::{ActionSpec, EnvironmentContext, Pipeline, RunStatus, Stage, StageStatus};
use stageline::AbortHandle;
use std::time::Duration;

fn pipeline() -> Pipeline {
    Pipeline::new("app")
        .stage(Stage::new("build").action(ActionSpec::command("mvn", ["package"])))
        .stage(Stage::new("integration").action(ActionSpec::command("hang", ["forever"])))
        .stage(Stage::new("deploy").action(ActionSpec::command("kubectl", ["apply"])))
}

#[tokio::test]
async fn test_abort_interrupts_running_stage() {
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);
    let abort = AbortHandle::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.abort();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_until_aborted(&engine, &pipeline(), &EnvironmentContext::default(), &abort),
    )
    .await
    .expect("abort did not stop the run");

    assert_statuses(
        &result,
        &[StageStatus::Succeeded, StageStatus::Failed, StageStatus::Skipped],
    );
    assert_run_status(&result, RunStatus::Aborted);
    assert_eq!(result.result("integration").unwrap().error.as_deref(), Some("aborted"));
    assert_eq!(result.result("deploy").unwrap().reason.as_deref(), Some("run aborted"));
    assert_eq!(engine.runner().programs(), vec!["mvn", "hang"]);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_abort_before_start_skips_everything() {
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);
    let abort = AbortHandle::new();
    abort.abort();

    let result =
        run_until_aborted(&engine, &pipeline(), &EnvironmentContext::default(), &abort).await;

    assert_statuses(
        &result,
        &[StageStatus::Skipped, StageStatus::Skipped, StageStatus::Skipped],
    );
    assert_run_status(&result, RunStatus::Aborted);
    assert!(engine.runner().calls().is_empty());
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_engine_runs_again_after_an_abort() {
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("build").action(ActionSpec::command("mvn", ["package"])));
    let abort = AbortHandle::new();
    abort.abort();

    let ctx = EnvironmentContext::default();
    let aborted = run_until_aborted(&engine, &pipeline, &ctx, &abort).await;
    let first = run(&engine, &pipeline, &ctx).await;
    let second = run(&engine, &pipeline, &ctx).await;

    assert_run_status(&aborted, RunStatus::Aborted);
    for result in [&first, &second] {
        assert_statuses(result, &[StageStatus::Succeeded]);
        assert_run_status(result, RunStatus::Succeeded);
    }
    assert_eq!(engine.runner().programs(), vec!["mvn", "mvn"]);
    assert_eq!(notifier.count(), 3);
}
