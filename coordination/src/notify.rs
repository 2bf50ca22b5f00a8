//! Outbound notification capability
//!
//! The coordinator and the escalation scheduler only ever talk to a
//! [`NotificationSink`]; concrete messaging platforms live behind it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How loud a notification is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Alert,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Alert => write!(f, "alert"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "alert" => Ok(Self::Alert),
            "critical" | "escalate" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Error type for notification delivery
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Delivery to {target} failed: {reason}")]
    DeliveryFailed { target: String, reason: String },
}

/// Result type for notification delivery
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Abstract `notify(target, message, severity)` capability
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, target: &str, message: &str, severity: Severity) -> NotifyResult<()>;
}

/// Shared reference to a sink
pub type SharedSink = Arc<dyn NotificationSink>;

/// Sink that only writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, target: &str, message: &str, severity: Severity) -> NotifyResult<()> {
        match severity {
            Severity::Info | Severity::Warn => {
                info!(target_name = target, %severity, "{}", message)
            }
            Severity::Alert | Severity::Critical => {
                warn!(target_name = target, %severity, "{}", message)
            }
        }
        Ok(())
    }
}

/// A notification captured by [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentNotification {
    pub target: String,
    pub message: String,
    pub severity: Severity,
    pub sent_at: DateTime<Utc>,
}

/// Sink that records every notification in memory (dry runs and tests)
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<SentNotification>>,
    failing_targets: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an `Arc`
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Make deliveries to `target` fail from now on
    pub fn fail_target(&self, target: &str) {
        if let Ok(mut failing) = self.failing_targets.lock() {
            failing.push(target.to_string());
        }
    }

    /// Everything delivered so far, in delivery order
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Severities delivered so far, in delivery order
    pub fn severities(&self) -> Vec<Severity> {
        self.sent().into_iter().map(|n| n.severity).collect()
    }

    /// Messages delivered to one target
    pub fn messages_for(&self, target: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|n| n.target == target)
            .map(|n| n.message)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, target: &str, message: &str, severity: Severity) -> NotifyResult<()> {
        let failing = self
            .failing_targets
            .lock()
            .map(|f| f.iter().any(|t| t == target))
            .unwrap_or(false);
        if failing {
            return Err(NotifyError::DeliveryFailed {
                target: target.to_string(),
                reason: "target marked as failing".to_string(),
            });
        }

        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                target: target.to_string(),
                message: message.to_string(),
                severity,
                sent_at: Utc::now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!("WARN".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("escalate".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("loud".parse::<Severity>().is_err());
        assert!(Severity::Info < Severity::Critical);
    }

    #[tokio::test]
    async fn test_memory_sink_records_and_fails() {
        let sink = MemorySink::new();
        sink.notify("ops", "hello", Severity::Info).await.unwrap();
        sink.fail_target("broken");
        assert!(sink.notify("broken", "x", Severity::Alert).await.is_err());

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.messages_for("ops"), vec!["hello".to_string()]);
    }
}
