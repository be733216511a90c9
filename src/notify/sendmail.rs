//! Email transport through a sendmail-compatible binary

use crate::core::error::{PipelineError, Result};
use crate::notify::{Attachment, Message, Transport};
use crate::runner::{CommandRunner, Invocation};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pipes a MIME message to `sendmail -t -oi` through the command runner
pub struct SendmailTransport {
    runner: Arc<dyn CommandRunner>,
    program: String,
    from: Option<String>,
    timeout: Duration,
}

impl SendmailTransport {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "sendmail".to_string(),
            from: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Render a message as RFC 2045 MIME text
pub fn render_mime(message: &Message, from: Option<&str>) -> String {
    let mut mime = String::new();
    if let Some(from) = from {
        let _ = write!(mime, "From: {}\r\n", from);
    }
    let _ = write!(mime, "To: {}\r\n", message.recipients.join(", "));
    let _ = write!(mime, "Subject: {}\r\n", message.subject);
    mime.push_str("MIME-Version: 1.0\r\n");

    if message.attachments.is_empty() {
        mime.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        mime.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        mime.push_str(&crlf(&message.body));
        return mime;
    }

    let boundary = format!("stageline-{}", Uuid::new_v4().simple());
    let _ = write!(
        mime,
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    );
    let _ = write!(mime, "--{}\r\n", boundary);
    mime.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    mime.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    mime.push_str(&crlf(&message.body));
    mime.push_str("\r\n");

    for attachment in &message.attachments {
        let _ = write!(mime, "--{}\r\n", boundary);
        write_attachment(&mut mime, attachment);
    }
    let _ = write!(mime, "--{}--\r\n", boundary);
    mime
}

fn write_attachment(mime: &mut String, attachment: &Attachment) {
    let name = attachment.filename.replace('"', "");
    let _ = write!(mime, "Content-Type: {}; name=\"{}\"\r\n", attachment.content_type, name);
    let _ = write!(mime, "Content-Disposition: attachment; filename=\"{}\"\r\n", name);
    mime.push_str("Content-Transfer-Encoding: base64\r\n\r\n");

    let encoded = BASE64.encode(&attachment.data);
    for chunk in encoded.as_bytes().chunks(76) {
        // base64 output is ASCII
        mime.push_str(&String::from_utf8_lossy(chunk));
        mime.push_str("\r\n");
    }
}

fn crlf(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n").replace('\n', "\r\n");
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

#[async_trait]
impl Transport for SendmailTransport {
    fn name(&self) -> &str {
        "sendmail"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let invocation = Invocation::new(&self.program)
            .args(["-t", "-oi"])
            .stdin(render_mime(message, self.from.as_deref()))
            .timeout(Some(self.timeout));

        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| PipelineError::NotificationDeliveryError(e.to_string()))?;

        if !output.success() {
            return Err(PipelineError::NotificationDeliveryError(format!(
                "{} failed ({:?}): {}",
                self.program,
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}
