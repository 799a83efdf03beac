//! Slack notification support via Incoming Webhooks.

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::wizard::WizardReport;

/// Structured Slack message for Block Kit rendering.
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

impl SlackMessage {
    /// Build the "upgrade completed" notification from a wizard report.
    pub fn upgrade_completed(report: &WizardReport) -> Self {
        let watched = if report.steps_watched.is_empty() {
            "none (all steps had already passed)".to_string()
        } else {
            report.steps_watched.join(" → ")
        };

        Self {
            header: "Platform Upgrade Completed".to_string(),
            fields: vec![
                ("Steps Watched".to_string(), watched),
                (
                    "Duration".to_string(),
                    format_duration(report.started_at, report.completed_at),
                ),
            ],
            context: format!("Sent by puw v{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Build the "upgrade failed" notification.
    pub fn upgrade_failed(error: &str) -> Self {
        Self {
            header: "Platform Upgrade Failed".to_string(),
            fields: vec![("Error".to_string(), error.to_string())],
            context: format!("Sent by puw v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

fn format_duration(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> String {
    let secs = (end - start).num_seconds().unsigned_abs();
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Slack webhook client.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Create a new Slack notifier with the given webhook URL.
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a Block Kit message to Slack. Errors are logged but not
    /// propagated; a lost notification must never fail the upgrade watch.
    pub async fn send(&self, message: &SlackMessage) {
        let payload = build_blocks_payload(message);
        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to send Slack notification");
            }
            Ok(_) => {
                info!(header = message.header.as_str(), "Slack notification sent");
            }
        }
    }
}

/// Build a Slack Block Kit payload from a [`SlackMessage`].
fn build_blocks_payload(message: &SlackMessage) -> Value {
    let mut blocks: Vec<Value> = Vec::new();

    blocks.push(json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": message.header,
            "emoji": true
        }
    }));

    if !message.fields.is_empty() {
        let fields: Vec<Value> = message
            .fields
            .iter()
            .map(|(label, value)| {
                json!({
                    "type": "mrkdwn",
                    "text": format!("*{label}*\n{value}")
                })
            })
            .collect();

        // Slack allows max 10 fields per section; split if needed
        for chunk in fields.chunks(10) {
            blocks.push(json!({
                "type": "section",
                "fields": chunk
            }));
        }
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": message.context
        }]
    }));

    // Fallback text for clients that don't support blocks
    let fallback = format!("{}\n{}", message.header, message.context);

    json!({
        "text": fallback,
        "blocks": blocks
    })
}
