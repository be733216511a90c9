//! Scoped credentials and secret masking

use crate::helpers::*;
use stageline::core::{
    ActionKind, ActionSpec, CredentialBinding, CredentialSource, CredentialStore,
    EnvironmentContext, Pipeline, RunStatus, SecretMaterial, Stage, StageStatus,
};
use stageline::runner::CommandOutput;
use stageline::ExecutionEvent;
use std::sync::{Arc, Mutex};

const TOKEN: &str = "s3cr3t-token";

fn store() -> CredentialStore {
    CredentialStore::new()
        .with("sonar", CredentialSource::Literal(SecretMaterial::Token(TOKEN.into())))
        .with(
            "registry",
            CredentialSource::Literal(SecretMaterial::UsernamePassword {
                username: "ci-bot".into(),
                password: "hunter2".into(),
            }),
        )
}

fn token_binding(env: &str) -> CredentialBinding {
    CredentialBinding {
        id: "sonar".into(),
        env: Some(env.into()),
        username_env: None,
    }
}

#[tokio::test]
async fn test_secret_never_reaches_results_or_events() {
    let pipeline = Pipeline::new("app").stage(
        Stage::new("analyze")
            .action(
                ActionSpec::command("print-env", ["SONAR_TOKEN"])
                    .with_credential(token_binding("SONAR_TOKEN")),
            )
            .action(
                ActionSpec::command("leaky", ["--verbose"])
                    .with_credential(token_binding("SONAR_TOKEN")),
            ),
    );
    let runner = FakeRunner::new().on(
        "leaky",
        CommandOutput::exited(1, format!("auth {}", TOKEN), format!("rejected {}", TOKEN)),
    );
    let notifier = RecordingNotifier::new();
    let engine = executor(runner, &notifier);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.add_event_handler(move |event| sink.lock().unwrap().push(format!("{:?}", event)));

    let result = engine.execute(&pipeline, &EnvironmentContext::default(), &store()).await;

    let stage = result.result("analyze").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.stdout, "SONAR_TOKEN=****auth ****");
    assert_eq!(stage.stderr, "rejected ****");
    assert!(!format!("{:?}", result).contains(TOKEN));
    assert!(!format!("{:?}", notifier.last()).contains(TOKEN));
    assert!(events.lock().unwrap().iter().all(|event| !event.contains(TOKEN)));

    // The runner itself did receive the secret
    let calls = engine.runner().calls();
    assert_eq!(calls[0].env.get("SONAR_TOKEN").map(String::as_str), Some(TOKEN));
}

#[tokio::test]
async fn test_registry_login_uses_stdin() {
    let pipeline = Pipeline::new("app").stage(Stage::new("publish").action(ActionSpec::new(
        ActionKind::Push {
            image: "registry.example.com/web:{{ IMAGE_TAG }}".into(),
            registry: Some("registry.example.com".into()),
            credential: Some("registry".into()),
        },
    )));
    let ctx = EnvironmentContext::builder().set("IMAGE_TAG", "42").build().unwrap();
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);
    let commands = Arc::new(Mutex::new(Vec::new()));
    let sink = commands.clone();
    engine.add_event_handler(move |event| {
        if let ExecutionEvent::ActionStarted { command, .. } = event {
            sink.lock().unwrap().push(command);
        }
    });

    let result = engine.execute(&pipeline, &ctx, &store()).await;

    assert_run_status(&result, RunStatus::Succeeded);
    let calls = engine.runner().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].args,
        vec!["login", "--username", "ci-bot", "--password-stdin", "registry.example.com"]
    );
    assert_eq!(calls[0].stdin.as_deref(), Some("hunter2"));
    assert_eq!(calls[1].args, vec!["push", "registry.example.com/web:42"]);
    assert!(commands.lock().unwrap().iter().all(|c| !c.contains("hunter2")));
}

#[tokio::test]
async fn test_token_credential_cannot_log_in_to_registry() {
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("publish").action(ActionSpec::new(ActionKind::Push {
            image: "web:1".into(),
            registry: None,
            credential: Some("sonar".into()),
        })))
        .stage(Stage::new("deploy").action(ActionSpec::command("kubectl", ["apply"])));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = engine.execute(&pipeline, &EnvironmentContext::default(), &store()).await;

    assert_statuses(&result, &[StageStatus::Failed, StageStatus::Skipped]);
    assert_run_status(&result, RunStatus::Failed);
    assert!(result.fatal_error.is_some());
    assert!(engine.runner().calls().is_empty());
}

#[tokio::test]
async fn test_unavailable_credential_is_fatal() {
    let store = CredentialStore::new().with(
        "deploy-token",
        CredentialSource::TokenEnv("STAGELINE_SCENARIO_UNSET_TOKEN".into()),
    );
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("build").action(ActionSpec::command("mvn", ["package"])))
        .stage(
            Stage::new("deploy").action(
                ActionSpec::command("deploy", ["--prod"]).with_credential(CredentialBinding {
                    id: "deploy-token".into(),
                    env: Some("DEPLOY_TOKEN".into()),
                    username_env: None,
                }),
            ),
        )
        .stage(Stage::new("announce").action(ActionSpec::command("echo", ["done"])));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = engine.execute(&pipeline, &EnvironmentContext::default(), &store).await;

    assert_statuses(
        &result,
        &[StageStatus::Succeeded, StageStatus::Failed, StageStatus::Skipped],
    );
    assert_run_status(&result, RunStatus::Failed);
    assert!(result
        .fatal_error
        .as_deref()
        .unwrap()
        .contains("STAGELINE_SCENARIO_UNSET_TOKEN"));
    assert_eq!(engine.runner().programs(), vec!["mvn"]);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_unknown_credential_fails_preflight() {
    let pipeline = Pipeline::new("app")
        .stage(Stage::new("build").action(ActionSpec::command("mvn", ["package"])))
        .stage(Stage::new("deploy").action(
            ActionSpec::command("deploy", Vec::<String>::new()).with_credential(CredentialBinding {
                id: "missing".into(),
                env: Some("TOKEN".into()),
                username_env: None,
            }),
        ));
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = engine.execute(&pipeline, &EnvironmentContext::default(), &store()).await;

    assert_statuses(&result, &[StageStatus::Skipped, StageStatus::Skipped]);
    assert_run_status(&result, RunStatus::Failed);
    assert!(engine.runner().calls().is_empty());
}
