//! Every run is reported exactly once, whatever its outcome

use crate::helpers::*;
use async_trait::async_trait;
use stageline::core::error::Result;
use stageline::core::{ActionSpec, EnvironmentContext, Pipeline, RunStatus, Stage};
use stageline::notify::{Message, ReportNotifier, Transport};
use stageline::persistence::InMemoryRunStore;
use stageline::{ExecutionEvent, PipelineError, PipelineExecutor};
use std::sync::{Arc, Mutex};

fn pipeline() -> Pipeline {
    Pipeline::new("web-service")
        .stage(Stage::new("build").action(ActionSpec::command("build", ["all"])))
        .stage(Stage::new("test").action(ActionSpec::command("test", ["all"])))
        .stage(Stage::new("deploy").action(ActionSpec::command("deploy", ["prod"])))
}

async fn notified_once(runner: FakeRunner, expected: RunStatus) {
    let notifier = RecordingNotifier::new();
    let engine = executor(runner, &notifier);

    let result = run(&engine, &pipeline(), &EnvironmentContext::default()).await;

    assert_run_status(&result, expected);
    assert_eq!(notifier.count(), 1);
    assert_eq!(notifier.last(), result);
}

#[tokio::test]
async fn test_notified_once_on_success() {
    notified_once(FakeRunner::new(), RunStatus::Succeeded).await;
}

#[tokio::test]
async fn test_notified_once_when_first_stage_fails() {
    notified_once(FakeRunner::new().failing("build", 1, ""), RunStatus::Failed).await;
}

#[tokio::test]
async fn test_notified_once_when_last_stage_fails() {
    notified_once(FakeRunner::new().failing("deploy", 1, ""), RunStatus::Failed).await;
}

#[tokio::test]
async fn test_notified_once_when_run_cannot_start() {
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new(), &notifier);

    let result = engine
        .fail_before_start(&pipeline(), PipelineError::UndefinedVariable("BRANCH".into()))
        .await;

    assert_run_status(&result, RunStatus::Failed);
    assert_eq!(result.results.len(), 3);
    assert_eq!(notifier.count(), 1);
    assert_eq!(notifier.last().fatal_error.as_deref(), Some("undefined variable: BRANCH"));
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let notifier = RecordingNotifier::new();
    let engine = executor(FakeRunner::new().failing("test", 1, ""), &notifier);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

    let result = run(&engine, &pipeline(), &EnvironmentContext::default()).await;

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(ExecutionEvent::PipelineStarted { stages: 3, .. })));
    assert_eq!(
        events.last(),
        Some(&ExecutionEvent::PipelineFinished {
            run_id: result.id,
            status: RunStatus::Failed,
        })
    );
    assert!(events.contains(&ExecutionEvent::StageSkipped {
        stage: "deploy".into(),
        reason: "stage test failed".into(),
    }));
}

/// Keeps the rendered messages
#[derive(Clone, Default)]
struct Outbox {
    messages: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl Transport for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct Unreachable;

#[async_trait]
impl Transport for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn send(&self, _message: &Message) -> Result<()> {
        Err(PipelineError::NotificationDeliveryError("connection refused".into()))
    }
}

#[tokio::test]
async fn test_report_carries_build_number_and_breakdown() {
    let outbox = Outbox::default();
    let notifier = ReportNotifier::new()
        .with_transport(Unreachable)
        .with_transport(outbox.clone())
        .with_recipients(["team@example.com".to_string()])
        .with_log_url("https://ci.example.com/{{ BUILD_NUMBER }}");
    let engine = PipelineExecutor::new(FakeRunner::new().failing("deploy", 1, "forbidden"))
        .with_notifier(Arc::new(notifier))
        .with_store(Arc::new(InMemoryRunStore::new()));

    let result = engine
        .execute(&pipeline(), &EnvironmentContext::default(), &Default::default())
        .await;

    // A failing transport neither hides the report from the others nor changes the run
    assert_run_status(&result, RunStatus::Failed);
    let messages = outbox.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.subject, "[web-service] build #1: FAILED");
    assert_eq!(message.recipients, vec!["team@example.com"]);
    assert!(message.body.contains("deploy"));
    assert!(message.body.contains("deploy exited with code 1"));
    assert!(message.body.contains("https://ci.example.com/1"));
}
