//! Normalized inbound events
//!
//! Upstream ingestion (chat listeners, mail pollers, CRM webhooks) turns
//! whatever arrived into an [`Event`] before it reaches the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a staff member or conversation thread
pub type SubjectId = String;

/// Identifier of a single inbound event
pub type EventId = String;

/// Opaque attachment descriptor carried alongside an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A normalized inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (generated when absent in the feed)
    #[serde(default = "new_event_id")]
    pub id: EventId,
    /// Who the event is about
    pub subject_id: SubjectId,
    /// Channel the event arrived on (chat room, mailbox, webhook source)
    #[serde(default)]
    pub channel_id: String,
    /// Message body
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// When the event was produced upstream
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn new_event_id() -> EventId {
    uuid::Uuid::new_v4().to_string()
}

impl Event {
    /// Create an event stamped with the current time and a fresh id
    pub fn new(subject_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            subject_id: subject_id.into(),
            channel_id: String::new(),
            content: content.into(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the channel
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a file descriptor
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Content lowercased with runs of whitespace collapsed to one space.
    pub fn normalized_content(&self) -> String {
        normalize_content(&self.content)
    }

    /// Short preview for log lines
    pub fn preview(&self) -> String {
        if self.content.chars().count() > 80 {
            let head: String = self.content.chars().take(80).collect();
            format!("{}...", head)
        } else {
            self.content.clone()
        }
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
