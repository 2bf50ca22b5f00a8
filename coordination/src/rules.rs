//! Declarative handlers configured from the `handlers` rule table
//!
//! ```toml
//! [[handlers]]
//! id = "punctuality"
//! priority = 50
//! keywords = ["late", "delayed", "traffic"]
//! confidence = 0.9
//! action = "late_arrival"
//! notify = { message = "{subject} reported a delay: {content}", severity = "warn", targets = ["ops"] }
//! strike = "punctuality"
//! escalation = "late_arrival"
//! until = "arriv|on site"
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::handler::{
    compile_pattern, EscalationRequest, EventHandler, HandlerContext, HandlerDescriptor,
    HandlerOutcome, Interest, NotificationRequest,
};
use crate::notify::Severity;
use crate::strikes::StrikeCategory;

/// Error type for rule compilation
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule '{rule}': invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule '{rule}': confidence {value} outside [0, 1]")]
    InvalidConfidence { rule: String, value: f64 },

    #[error("rule '{rule}': unknown escalation plan '{plan}'")]
    UnknownPlan { rule: String, plan: String },

    #[error("rule has an empty id")]
    MissingId,
}

/// Notification part of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleNotification {
    /// Template; `{subject}`, `{content}` and `{channel}` are substituted
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub targets: Vec<String>,
}

fn default_severity() -> Severity {
    Severity::Info
}

fn default_confidence() -> f64 {
    0.5
}

/// One entry of the `handlers` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRule {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    /// Case-insensitive substrings; any one matches
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regexes over normalized content; any one matches
    #[serde(default)]
    pub patterns: Vec<String>,
    /// When set, the event must also arrive on one of these channels
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Defaults to the rule id
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub notify: Option<RuleNotification>,
    #[serde(default)]
    pub strike: Option<StrikeCategory>,
    /// Name of an entry in `escalation_plans`
    #[serde(default)]
    pub escalation: Option<String>,
    #[serde(default)]
    pub escalation_targets: Vec<String>,
    /// Only later events matching this regex cancel the escalation
    #[serde(default)]
    pub until: Option<String>,
}

impl HandlerRule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            keywords: Vec::new(),
            patterns: Vec::new(),
            channels: Vec::new(),
            fallback: false,
            confidence: default_confidence(),
            action: None,
            summary: None,
            notify: None,
            strike: None,
            escalation: None,
            escalation_targets: Vec::new(),
            until: None,
        }
    }

    /// Check everything that does not depend on other config sections.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::MissingId);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(RuleError::InvalidConfidence {
                rule: self.id.clone(),
                value: self.confidence,
            });
        }
        self.compile_patterns()?;
        if let Some(until) = &self.until {
            self.compile(until)?;
        }
        Ok(())
    }

    fn compile(&self, pattern: &str) -> Result<Regex, RuleError> {
        compile_pattern(pattern).map_err(|source| RuleError::InvalidPattern {
            rule: self.id.clone(),
            pattern: pattern.to_string(),
            source,
        })
    }

    fn compile_patterns(&self) -> Result<Vec<Regex>, RuleError> {
        self.patterns.iter().map(|p| self.compile(p)).collect()
    }

    /// Interest built from keywords, patterns and channels.
    ///
    /// No keywords, patterns or channels means catch-all.
    pub fn interest(&self) -> Result<Interest, RuleError> {
        let mut content = Vec::new();
        if !self.keywords.is_empty() {
            content.push(Interest::keywords(self.keywords.iter().cloned()));
        }
        content.extend(self.compile_patterns()?.into_iter().map(Interest::Pattern));

        let content = match content.len() {
            0 => None,
            1 => content.pop(),
            _ => Some(Interest::AnyOf(content)),
        };
        let channels = match self.channels.len() {
            0 => None,
            1 => Some(Interest::channel(self.channels[0].clone())),
            _ => Some(Interest::AnyOf(
                self.channels.iter().cloned().map(Interest::channel).collect(),
            )),
        };

        Ok(match (content, channels) {
            (None, None) => Interest::Any,
            (Some(c), None) => c,
            (None, Some(ch)) => ch,
            (Some(c), Some(ch)) => Interest::AllOf(vec![ch, c]),
        })
    }

    /// Compile into a registrable descriptor
    pub fn into_descriptor(self) -> Result<HandlerDescriptor, RuleError> {
        self.validate()?;
        let interest = self.interest()?;
        let priority = self.priority;
        let fallback = self.fallback;
        let handler = Arc::new(RuleHandler { rule: self });
        let descriptor = HandlerDescriptor::new(handler, priority, interest);
        Ok(if fallback {
            descriptor.as_fallback()
        } else {
            descriptor
        })
    }
}

fn render(template: &str, event: &Event) -> String {
    template
        .replace("{subject}", &event.subject_id)
        .replace("{content}", &event.preview())
        .replace("{channel}", &event.channel_id)
}

/// Handler driven entirely by a [`HandlerRule`]
#[derive(Debug, Clone)]
pub struct RuleHandler {
    rule: HandlerRule,
}

impl RuleHandler {
    pub fn new(rule: HandlerRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> &HandlerRule {
        &self.rule
    }
}

#[async_trait]
impl EventHandler for RuleHandler {
    fn id(&self) -> &str {
        &self.rule.id
    }

    async fn handle(&self, event: &Event, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        let rule = &self.rule;
        let action = rule.action.clone().unwrap_or_else(|| rule.id.clone());
        let mut outcome = HandlerOutcome::new(action, rule.confidence);

        if let Some(summary) = &rule.summary {
            outcome = outcome.with_summary(render(summary, event));
        }
        if let Some(notify) = &rule.notify {
            outcome = outcome.notify(
                NotificationRequest::new(render(&notify.message, event), notify.severity)
                    .to_targets(notify.targets.iter().cloned()),
            );
        }
        if let Some(category) = rule.strike {
            outcome = outcome.strike(category, format!("{}: {}", rule.id, event.preview()));
        }
        if let Some(plan) = &rule.escalation {
            let mut request = EscalationRequest::named(plan.clone())
                .to_targets(rule.escalation_targets.iter().cloned());
            if let Some(until) = &rule.until {
                request = request.until(until.clone());
            }
            outcome = outcome.escalate(request);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn late_rule() -> HandlerRule {
        HandlerRule {
            keywords: vec!["late".into(), "delayed".into()],
            priority: 50,
            confidence: 0.9,
            notify: Some(RuleNotification {
                message: "{subject} reported: {content}".into(),
                severity: Severity::Warn,
                targets: vec!["ops".into()],
            }),
            strike: Some(StrikeCategory::Punctuality),
            escalation: Some("late_arrival".into()),
            until: Some("arriv".into()),
            ..HandlerRule::new("punctuality")
        }
    }

    #[test]
    fn test_rule_parses_from_toml() {
        let rule: HandlerRule = toml::from_str(
            r#"
            id = "quality"
            patterns = ['photo\s+missing']
            strike = "quality"
            notify = { message = "check {subject}", severity = "alert" }
            "#,
        )
        .unwrap();
        assert_eq!(rule.strike, Some(StrikeCategory::Quality));
        assert_eq!(rule.confidence, 0.5);
        assert_eq!(rule.notify.unwrap().severity, Severity::Alert);
    }

    #[test]
    fn test_interest_from_rule() {
        let rule = HandlerRule {
            channels: vec!["field".into()],
            ..late_rule()
        };
        let interest = rule.interest().unwrap();
        assert!(interest.matches(&Event::new("u1", "Running late").with_channel("field")));
        assert!(!interest.matches(&Event::new("u1", "Running late").with_channel("office")));
        assert!(HandlerRule::new("any").interest().unwrap().is_catch_all());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let bad_pattern = HandlerRule {
            patterns: vec!["(".into()],
            ..HandlerRule::new("broken")
        };
        assert!(matches!(
            bad_pattern.validate(),
            Err(RuleError::InvalidPattern { .. })
        ));

        let bad_confidence = HandlerRule {
            confidence: 1.5,
            ..HandlerRule::new("loud")
        };
        assert!(matches!(
            bad_confidence.validate(),
            Err(RuleError::InvalidConfidence { .. })
        ));
        assert!(matches!(
            HandlerRule::new(" ").validate(),
            Err(RuleError::MissingId)
        ));
    }

    #[tokio::test]
    async fn test_rule_handler_builds_outcome() {
        let handler = RuleHandler::new(late_rule());
        let event = Event::new("u1", "running 20 min late");
        let outcome = handler
            .handle(&event, &HandlerContext::new(0.8))
            .await
            .unwrap();

        assert_eq!(outcome.action, "punctuality");
        assert_eq!(outcome.confidence, 0.9);
        let notification = outcome.notification.unwrap();
        assert_eq!(notification.message, "u1 reported: running 20 min late");
        assert_eq!(notification.targets, vec!["ops"]);
        assert_eq!(outcome.strike.unwrap().category, StrikeCategory::Punctuality);
        let escalation = outcome.escalation.unwrap();
        assert_eq!(escalation.until.as_deref(), Some("arriv"));
    }

    #[test]
    fn test_into_descriptor_keeps_fallback_and_priority() {
        let descriptor = HandlerRule {
            fallback: true,
            priority: -5,
            ..HandlerRule::new("general")
        }
        .into_descriptor()
        .unwrap();
        assert!(descriptor.fallback);
        assert_eq!(descriptor.priority, -5);
        assert_eq!(descriptor.id, "general");
    }
}
