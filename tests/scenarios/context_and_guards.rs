//! Context resolution, stage overrides and guards

use crate::helpers::*;
use stageline::core::{
    ActionSpec, EnvironmentContext, Guard, Pipeline, RunStatus, Stage, StageStatus,
};

fn ctx(pairs: &[(&str, &str)]) -> EnvironmentContext {
    pairs
        .iter()
        .fold(EnvironmentContext::builder(), |builder, (k, v)| builder.set(*k, *v))
        .build()
        .unwrap()
}

fn echo(template: &str) -> ActionSpec {
    ActionSpec::command("echo", [template])
}

#[tokio::test]
async fn test_stage_override_does_not_leak() {
    let base = ctx(&[("IMAGE_TAG", "latest")]);
    let pipeline = Pipeline::new("app")
        .stage(
            Stage::new("release")
                .with_env("IMAGE_TAG", "42")
                .action(echo("app:{{ IMAGE_TAG }}")),
        )
        .stage(Stage::new("smoke").action(echo("app:{{ IMAGE_TAG }}")));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &base).await;

    assert_run_status(&result, RunStatus::Succeeded);
    assert_eq!(result.result("release").unwrap().stdout, "app:42");
    assert_eq!(result.result("smoke").unwrap().stdout, "app:latest");
    assert_eq!(base.get("IMAGE_TAG"), Some("latest"));
}

#[tokio::test]
async fn test_stage_override_can_reference_context() {
    let base = ctx(&[("REGISTRY", "registry.example.com"), ("IMAGE_TAG", "7")]);
    let pipeline = Pipeline::new("app").stage(
        Stage::new("push")
            .with_env("IMAGE", "{{ REGISTRY }}/web:{{ IMAGE_TAG }}")
            .action(echo("{{ IMAGE }}")),
    );
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &base).await;

    assert_eq!(result.result("push").unwrap().stdout, "registry.example.com/web:7");
}

#[tokio::test]
async fn test_undefined_variable_fails_before_any_stage() {
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("build").action(echo("build")))
        .stage(Stage::new("test").action(echo("test")))
        .stage(Stage::new("deploy").action(echo("{{ UNSET_KEY }}")));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(
        &result,
        &[StageStatus::Skipped, StageStatus::Skipped, StageStatus::Skipped],
    );
    assert_run_status(&result, RunStatus::Failed);
    assert!(result.fatal_error.as_deref().unwrap().contains("UNSET_KEY"));
    assert!(engine.runner().calls().is_empty());
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_guards_evaluated_in_declared_order() {
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("build").action(ActionSpec::command("build", Vec::<String>::new())))
        .stage(
            Stage::new("deploy-prod")
                .when(Guard::equals("BRANCH", "main"))
                .action(ActionSpec::command("deploy", ["prod"])),
        )
        .stage(
            Stage::new("deploy-preview")
                .when(Guard::Not(Box::new(Guard::equals("BRANCH", "main"))))
                .action(ActionSpec::command("deploy", ["preview"])),
        );
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &ctx(&[("BRANCH", "feature/login")])).await;

    assert_statuses(
        &result,
        &[StageStatus::Succeeded, StageStatus::Skipped, StageStatus::Succeeded],
    );
    assert_eq!(
        result.result("deploy-prod").unwrap().reason.as_deref(),
        Some("guard BRANCH == main is false")
    );
    let deploys: Vec<_> = engine
        .runner()
        .calls()
        .into_iter()
        .filter(|call| call.program == "deploy")
        .map(|call| call.args.join(" "))
        .collect();
    assert_eq!(deploys, vec!["preview"]);
    assert_run_status(&result, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_guard_sees_stage_environment() {
    let pipeline = Pipeline::new("app").stage(
        Stage::new("deploy")
            .with_env("TARGET", "prod")
            .when(Guard::equals("TARGET", "prod"))
            .action(echo("{{ TARGET }}")),
    );
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(&result, &[StageStatus::Succeeded]);
}

#[tokio::test]
async fn test_guard_on_undefined_variable_stops_run() {
    let pipeline = Pipeline::new("app")
        .stage(
            Stage::new("deploy")
                .when(Guard::equals("ENVIRONMENT", "prod"))
                .action(echo("deploy")),
        )
        .stage(Stage::new("notify").action(echo("done")));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_statuses(&result, &[StageStatus::Failed, StageStatus::Skipped]);
    assert_run_status(&result, RunStatus::Failed);
    assert!(result.fatal_error.as_deref().unwrap().contains("ENVIRONMENT"));
    assert!(engine.runner().calls().is_empty());
}

#[tokio::test]
async fn test_run_id_is_available_to_templates() {
    let pipeline = Pipeline::new("app").stage(Stage::new("tag").action(echo("run-{{ RUN_ID }}")));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = run(&engine, &pipeline, &EnvironmentContext::default()).await;

    assert_eq!(result.results[0].stdout, format!("run-{}", result.id));
}
