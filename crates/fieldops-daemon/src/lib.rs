//! Daemon wiring for the coordination engine: event feed parsing and the
//! webhook notification sink.

use std::io::BufRead;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_coordination::notify::NotifyResult;
use fieldops_coordination::{Event, NotificationSink, NotifyError, Severity};
use serde::Serialize;
use tracing::{debug, warn};

/// Body POSTed for each notification
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub target: &'a str,
    pub message: &'a str,
    pub severity: Severity,
    pub sent_at: DateTime<Utc>,
}

/// Delivers notifications as JSON POSTs to a single endpoint
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, target: &str, message: &str, severity: Severity) -> NotifyResult<()> {
        let payload = WebhookPayload {
            target,
            message,
            severity,
            sent_at: Utc::now(),
        };
        let failed = |reason: String| NotifyError::DeliveryFailed {
            target: target.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("webhook returned {}", status)));
        }
        debug!(target_name = target, %severity, "Webhook notification delivered");
        Ok(())
    }
}

/// Parse one JSON Lines record. Blank lines and `#` comments yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<Event>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Malformed event record")?;
    Ok(Some(event))
}

/// Read every event from a JSON Lines source, skipping malformed records.
pub fn read_events(reader: impl BufRead) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        match parse_event_line(&line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => warn!(line = index + 1, error = %format!("{:#}", e), "Skipping event record"),
        }
    }
    Ok(events)
}
