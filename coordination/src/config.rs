//! Engine configuration
//!
//! Loaded from a TOML file, then overridden by `FIELDOPS_*` environment
//! variables, then validated. Every field has a default so an empty file is
//! a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dedup::{DEFAULT_DEDUP_WINDOW_MINUTES, MAX_DEDUP_WINDOW_MINUTES};
use crate::escalation::{Checkpoint, EscalationPlan, SUBJECT_TARGET};
use crate::handler::DEFAULT_HIGH_CONFIDENCE_THRESHOLD;
use crate::metrics::DEFAULT_METRICS_CAPACITY;
use crate::notify::Severity;
use crate::resilience::RetryPolicy;
use crate::rules::{HandlerRule, RuleError};
use crate::strikes::{StrikeCategory, DEFAULT_STRIKE_WINDOW_DAYS, MAX_STRIKE_WINDOW_DAYS};

/// Name of the built-in escalation plan
pub const LATE_ARRIVAL_PLAN: &str = "late_arrival";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Built-in plans, merged under any plans the config file defines
pub fn default_escalation_plans() -> BTreeMap<String, EscalationPlan> {
    let mut plans = BTreeMap::new();
    let late_arrival = EscalationPlan::new(vec![
        Checkpoint::new(5, Severity::Warn).to_targets([SUBJECT_TARGET]),
        Checkpoint::new(10, Severity::Alert).to_targets([SUBJECT_TARGET, "ops"]),
        Checkpoint::new(15, Severity::Critical)
            .to_targets([SUBJECT_TARGET, "ops", "management"])
            .recording(StrikeCategory::Punctuality),
    ]);
    if let Ok(plan) = late_arrival {
        plans.insert(LATE_ARRIVAL_PLAN.to_string(), plan);
    }
    plans
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub dedup_window_minutes: i64,
    pub high_confidence_threshold: f64,
    pub strike_window_days: i64,
    /// Divides every escalation wait; 60.0 turns minutes into seconds
    pub simulation_time_scale: f64,
    pub handler_timeout_secs: u64,
    pub concurrent_handlers: bool,
    pub metrics_capacity: usize,
    pub retry: RetryPolicy,
    pub escalation_plans: BTreeMap<String, EscalationPlan>,
    pub handlers: Vec<HandlerRule>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            dedup_window_minutes: DEFAULT_DEDUP_WINDOW_MINUTES,
            high_confidence_threshold: DEFAULT_HIGH_CONFIDENCE_THRESHOLD,
            strike_window_days: DEFAULT_STRIKE_WINDOW_DAYS,
            simulation_time_scale: 1.0,
            handler_timeout_secs: 30,
            concurrent_handlers: false,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            retry: RetryPolicy::default(),
            escalation_plans: default_escalation_plans(),
            handlers: Vec::new(),
        }
    }
}

fn i64_from_env(var: &str, default: i64) -> i64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn u64_from_env(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn f64_from_env(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn bool_from_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

impl CoordinationConfig {
    /// Parse TOML; built-in plans are kept unless the file redefines them.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let mut config: Self = toml::from_str(raw)?;
        for (name, plan) in default_escalation_plans() {
            config.escalation_plans.entry(name).or_insert(plan);
        }
        Ok(config)
    }

    /// Read a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(
            path = %path.display(),
            handlers = config.handlers.len(),
            plans = config.escalation_plans.len(),
            "Loaded coordination config"
        );
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.dedup_window_minutes =
            i64_from_env("FIELDOPS_DEDUP_WINDOW_MINUTES", self.dedup_window_minutes);
        self.high_confidence_threshold = f64_from_env(
            "FIELDOPS_HIGH_CONFIDENCE_THRESHOLD",
            self.high_confidence_threshold,
        );
        self.strike_window_days =
            i64_from_env("FIELDOPS_STRIKE_WINDOW_DAYS", self.strike_window_days);
        self.simulation_time_scale = f64_from_env("FIELDOPS_TIME_SCALE", self.simulation_time_scale);
        self.handler_timeout_secs =
            u64_from_env("FIELDOPS_HANDLER_TIMEOUT_SECS", self.handler_timeout_secs);
        self.concurrent_handlers =
            bool_from_env("FIELDOPS_CONCURRENT_HANDLERS", self.concurrent_handlers);
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_DEDUP_WINDOW_MINUTES).contains(&self.dedup_window_minutes) {
            return Err(ConfigError::Invalid(format!(
                "dedup_window_minutes must be in 1..={}, got {}",
                MAX_DEDUP_WINDOW_MINUTES, self.dedup_window_minutes
            )));
        }
        if !(0.0..=1.0).contains(&self.high_confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "high_confidence_threshold {} outside [0, 1]",
                self.high_confidence_threshold
            )));
        }
        if !(1..=MAX_STRIKE_WINDOW_DAYS).contains(&self.strike_window_days) {
            return Err(ConfigError::Invalid(format!(
                "strike_window_days must be in 1..={}, got {}",
                MAX_STRIKE_WINDOW_DAYS, self.strike_window_days
            )));
        }
        if !self.simulation_time_scale.is_finite() || self.simulation_time_scale <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "simulation_time_scale must be positive, got {}",
                self.simulation_time_scale
            )));
        }
        if self.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handler_timeout_secs must be positive".to_string(),
            ));
        }
        if self.metrics_capacity == 0 {
            return Err(ConfigError::Invalid(
                "metrics_capacity must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.handlers {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate handler id '{}'",
                    rule.id
                )));
            }
            if let Some(plan) = &rule.escalation {
                if !self.escalation_plans.contains_key(plan) {
                    return Err(RuleError::UnknownPlan {
                        rule: rule.id.clone(),
                        plan: plan.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn plan(&self, name: &str) -> Option<&EscalationPlan> {
        self.escalation_plans.get(name)
    }
}
