//! Failure policies: blocking stages stop the run, best-effort stages degrade it

use crate::helpers::*;
use stageline::core::{
    ActionSpec, EnvironmentContext, FailurePolicy, Pipeline, RunStatus, Stage, StageStatus,
};

fn stage(name: &str) -> Stage {
    Stage::new(name).action(ActionSpec::command(name, ["run"]))
}

#[tokio::test]
async fn test_blocking_failure_skips_remaining_stages() {
    let pipeline = Pipeline::new("app")
        .stage(stage("a"))
        .stage(stage("b"))
        .stage(stage("c"));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new().failing("b", 1, "boom"), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(
        &result,
        &[StageStatus::Succeeded, StageStatus::Failed, StageStatus::Skipped],
    );
    assert_run_status(&result, RunStatus::Failed);
    assert_eq!(engine.runner().programs(), vec!["a", "b"]);

    let failed = result.result("b").unwrap();
    assert_eq!(failed.exit_code, Some(1));
    assert_eq!(failed.stderr, "boom");
    assert!(failed.error.as_deref().unwrap().contains("code 1"));
    assert_eq!(result.result("c").unwrap().reason.as_deref(), Some("stage b failed"));
}

#[tokio::test]
async fn test_best_effort_failure_marks_run_unstable() {
    let pipeline = Pipeline::new("app")
        .stage(stage("a"))
        .stage(stage("b").on_failure(FailurePolicy::ContinueDegraded))
        .stage(stage("c"));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new().failing("b", 2, ""), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(
        &result,
        &[StageStatus::Succeeded, StageStatus::Unstable, StageStatus::Succeeded],
    );
    assert_run_status(&result, RunStatus::Unstable);
    assert_eq!(engine.runner().programs(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_failure_after_unstable_stage_fails_run() {
    let pipeline = Pipeline::new("app")
        .stage(stage("scan").on_failure(FailurePolicy::ContinueDegraded))
        .stage(stage("deploy"));
    let notifier = RecordingNotifier::new();
    let runner = FakeRunner::new()
        .failing("scan", 1, "CRITICAL: 2")
        .failing("deploy", 1, "forbidden");
    let engine = executor(runner, &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(&result, &[StageStatus::Unstable, StageStatus::Failed]);
    assert_run_status(&result, RunStatus::Failed);
}

#[tokio::test]
async fn test_actions_stop_at_first_failure() {
    let pipeline = Pipeline::new("app").stage(
        Stage::new("package")
            .action(ActionSpec::command("mvn", ["package"]))
            .action(ActionSpec::command("docker", ["build", "."]))
            .on_failure(FailurePolicy::ContinueDegraded),
    );
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new().failing("mvn", 1, "BUILD FAILURE"), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(&result, &[StageStatus::Unstable]);
    assert_eq!(engine.runner().programs(), vec!["mvn"]);
}

#[tokio::test]
async fn test_results_keep_declared_order() {
    let pipeline = Pipeline::new("app")
        .stage(stage("checkout"))
        .stage(stage("build"))
        .stage(stage("test"))
        .stage(stage("publish"));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    let names: Vec<_> = result.results.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(names, vec!["checkout", "build", "test", "publish"]);
    assert_run_status(&result, RunStatus::Succeeded);
    assert!(result.finished_at.is_some());
}
