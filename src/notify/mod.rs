//! Run notifications
//!
//! The pipeline executor hands every finished run to a [`Notifier`] exactly
//! once. [`ReportNotifier`] turns the run into a [`StatusReport`] and delivers
//! it through each configured [`Transport`].

pub mod report;
pub mod sendmail;
pub mod webhook;

pub use report::{StageLine, StatusReport};
pub use sendmail::SendmailTransport;
pub use webhook::WebhookTransport;

use crate::core::{
    config::NotifyConfig,
    error::{PipelineError, Result},
    Run,
};
use crate::runner::CommandRunner;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives the finished run
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run: &Run) -> Result<()>;
}

/// File attached to a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Read a file; the content type is guessed from the extension
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let content_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some("txt") | Some("log") => "text/plain",
            Some("json") | Some("sarif") => "application/json",
            Some("html") => "text/html",
            Some("xml") => "application/xml",
            _ => "application/octet-stream",
        };
        Ok(Self {
            filename,
            content_type: content_type.to_string(),
            data,
        })
    }
}

/// A rendered notification
#[derive(Debug, Clone)]
pub struct Message {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub report: StatusReport,
}

/// Delivery channel for notifications
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<()>;
}

/// Writes the report to the log
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        info!(
            pipeline = %message.report.pipeline,
            run_id = %message.report.run_id,
            status = %message.report.status,
            "{}",
            message.subject
        );
        debug!("{}", message.body);
        Ok(())
    }
}

/// Builds a status report and sends it through every transport
pub struct ReportNotifier {
    transports: Vec<Box<dyn Transport>>,
    recipients: Vec<String>,
    log_url: Option<String>,
    attachments: Vec<PathBuf>,
}

impl ReportNotifier {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            recipients: Vec::new(),
            log_url: None,
            attachments: Vec::new(),
        }
    }

    /// Notifier for a pipeline file's `notify` section
    ///
    /// The log transport is always present; webhook and email are added when
    /// configured.
    pub fn from_config(config: &NotifyConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mut notifier = Self::new()
            .with_transport(LogTransport)
            .with_recipients(config.recipients.iter().cloned())
            .with_attachments(config.attach.iter().cloned());
        if let Some(url) = &config.log_url {
            notifier = notifier.with_log_url(url.clone());
        }
        if let Some(url) = &config.webhook {
            notifier = notifier.with_transport(WebhookTransport::new(url.clone())?);
        }
        if let Some(sendmail) = &config.sendmail {
            if config.recipients.is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "sendmail notification needs at least one recipient".to_string(),
                ));
            }
            let mut transport =
                SendmailTransport::new(runner).with_program(sendmail.program.clone());
            if let Some(from) = &sendmail.from {
                transport = transport.with_from(from.clone());
            }
            notifier = notifier.with_transport(transport);
        }
        Ok(notifier)
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    pub fn with_recipients<I: IntoIterator<Item = String>>(mut self, recipients: I) -> Self {
        self.recipients.extend(recipients);
        self
    }

    pub fn with_log_url(mut self, template: impl Into<String>) -> Self {
        self.log_url = Some(template.into());
        self
    }

    pub fn with_attachments<I: IntoIterator<Item = PathBuf>>(mut self, paths: I) -> Self {
        self.attachments.extend(paths);
        self
    }

    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Render the message for a run; unreadable attachments are left out
    pub fn message(&self, run: &Run) -> Message {
        let report = StatusReport::from_run(run, self.log_url.as_deref());
        let attachments = self
            .attachments
            .iter()
            .filter_map(|path| match Attachment::from_path(path) {
                Ok(attachment) => Some(attachment),
                Err(e) => {
                    warn!("Skipping attachment {}: {}", path.display(), e);
                    None
                }
            })
            .collect();

        Message {
            recipients: self.recipients.clone(),
            subject: report.subject(),
            body: report.body(),
            attachments,
            report,
        }
    }
}

impl Default for ReportNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ReportNotifier {
    /// Every transport is tried; failures are collected into one error
    async fn notify(&self, run: &Run) -> Result<()> {
        let message = self.message(run);
        let mut failures = Vec::new();

        for transport in &self.transports {
            match transport.send(&message).await {
                Ok(()) => debug!("Notification sent via {}", transport.name()),
                Err(e) => {
                    warn!("Notification via {} failed: {}", transport.name(), e);
                    failures.push(format!("{}: {}", transport.name(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::NotificationDeliveryError(failures.join("; ")))
        }
    }
}
