use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::{AdapterError, DeliveryReceipt, EmailMessage, Mailer};

/// Mail delivery that drops RFC 5322 messages into a local outbox directory
/// for a relay (or a human) to pick up.
#[derive(Debug, Clone)]
pub struct OutboxMailer {
    outbox_dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
        }
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }
}

fn render_eml(message: &EmailMessage, message_id: &str, boundary: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("Message-ID: <{message_id}>\r\n"));
    out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    out.push_str(&format!("From: {}\r\n", message.from));
    out.push_str(&format!("To: {}\r\n", message.to));
    out.push_str(&format!("Subject: {}\r\n", message.subject.replace(['\r', '\n'], " ")));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
    ));
    for (content_type, body) in [
        ("text/plain", &message.text_body),
        ("text/html", &message.html_body),
    ] {
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str(&format!("Content-Type: {content_type}; charset=utf-8\r\n"));
        out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        out.push_str(body);
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn deliver(&self, message: &EmailMessage) -> Result<DeliveryReceipt, AdapterError> {
        if message.to.trim().is_empty() {
            return Err(AdapterError::Message("email has no recipient".into()));
        }
        let id = Uuid::new_v4();
        let message_id = format!("{id}@pulse.local");
        let boundary = format!("pulse-{}", id.simple());
        let eml = render_eml(message, &message_id, &boundary);

        fs::create_dir_all(&self.outbox_dir)
            .await
            .with_context(|| format!("creating {}", self.outbox_dir.display()))?;
        let path = self.outbox_dir.join(format!("{id}.eml"));
        fs::write(&path, eml.as_bytes())
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!(to = %message.to, path = %path.display(), "email queued in outbox");
        Ok(DeliveryReceipt {
            message_id,
            location: Some(path.display().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn message(to: &str) -> EmailMessage {
        EmailMessage {
            from: "pulse@example.com".into(),
            to: to.into(),
            subject: "Weekly pulse\n2026-W07".into(),
            html_body: "<p>Health 72</p>".into(),
            text_body: "Health 72".into(),
        }
    }

    #[tokio::test]
    async fn delivered_messages_land_in_the_outbox() {
        let dir = tempdir().expect("tempdir");
        let mailer = OutboxMailer::new(dir.path().join("outbox"));

        let receipt = mailer.deliver(&message("pm@example.com")).await.expect("deliver");

        let path = PathBuf::from(receipt.location.expect("location"));
        let eml = std::fs::read_to_string(&path).unwrap();
        assert!(eml.contains("To: pm@example.com\r\n"));
        assert!(eml.contains("Subject: Weekly pulse 2026-W07\r\n"));
        assert!(eml.contains("Content-Type: text/html; charset=utf-8"));
        assert!(eml.contains(&format!("Message-ID: <{}>", receipt.message_id)));
    }

    #[tokio::test]
    async fn blank_recipient_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let mailer = OutboxMailer::new(dir.path());
        assert!(matches!(
            mailer.deliver(&message("  ")).await,
            Err(AdapterError::Message(_))
        ));
    }
}
