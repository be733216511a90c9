//! HTTP webhook transport

use crate::core::error::{PipelineError, Result};
use crate::notify::{Message, StatusReport, Transport};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// JSON body posted to the webhook
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    text: &'a str,
    recipients: &'a [String],
    attachments: Vec<&'a str>,
    report: &'a StatusReport,
}

/// POSTs the status report as JSON
pub struct WebhookTransport {
    url: String,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let payload = WebhookPayload {
            subject: &message.subject,
            text: &message.body,
            recipients: &message.recipients,
            attachments: message.attachments.iter().map(|a| a.filename.as_str()).collect(),
            report: &message.report,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                PipelineError::NotificationDeliveryError(format!("POST {}: {}", self.url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::NotificationDeliveryError(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }
        Ok(())
    }
}
