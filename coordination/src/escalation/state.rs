//! Escalation state: checkpoints, plans, and the persisted task record

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::SubjectId;
use crate::notify::Severity;
use crate::strikes::StrikeCategory;

/// Identifier of an escalation task
pub type EscalationId = String;

/// Target placeholder that resolves to the task's subject id at fire time
pub const SUBJECT_TARGET: &str = "@subject";

/// Lifecycle of an escalation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    /// Waiting on the next checkpoint.
    Scheduled,
    /// Stopped before the last checkpoint fired.
    Cancelled,
    /// Every checkpoint fired.
    Exhausted,
}

impl EscalationState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Exhausted)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(self) -> &'static [EscalationState] {
        match self {
            Self::Scheduled => &[Self::Scheduled, Self::Cancelled, Self::Exhausted],
            Self::Cancelled | Self::Exhausted => &[],
        }
    }
}

impl std::fmt::Display for EscalationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Why a task was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The liveness predicate reported the expected action happened.
    LivenessSatisfied,
    /// The holder of the handle asked for it.
    Requested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LivenessSatisfied => write!(f, "liveness_satisfied"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// One escalation action at a fixed offset from the anchor time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Minutes after the anchor time.
    pub offset_minutes: u32,
    pub severity: Severity,
    /// Empty means "use the task's default targets".
    #[serde(default)]
    pub targets: Vec<String>,
    /// Strike category to append when this checkpoint fires.
    #[serde(default)]
    pub record: Option<StrikeCategory>,
    /// Message template; `{subject}`, `{offset}` and `{severity}` are substituted.
    #[serde(default)]
    pub message: Option<String>,
}

impl Checkpoint {
    pub fn new(offset_minutes: u32, severity: Severity) -> Self {
        Self {
            offset_minutes,
            severity,
            targets: Vec::new(),
            record: None,
            message: None,
        }
    }

    pub fn to_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn recording(mut self, category: StrikeCategory) -> Self {
        self.record = Some(category);
        self
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message = Some(template.into());
        self
    }

    pub fn offset(&self) -> Duration {
        Duration::minutes(i64::from(self.offset_minutes))
    }
}

/// Errors building an escalation plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("escalation plan has no checkpoints")]
    Empty,

    #[error("checkpoint offsets must strictly increase: {previous}m then {next}m")]
    NonIncreasing { previous: u32, next: u32 },
}

/// Validated, strictly increasing list of checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Checkpoint>", into = "Vec<Checkpoint>")]
pub struct EscalationPlan {
    checkpoints: Vec<Checkpoint>,
}

impl EscalationPlan {
    pub fn new(checkpoints: Vec<Checkpoint>) -> Result<Self, PlanError> {
        if checkpoints.is_empty() {
            return Err(PlanError::Empty);
        }
        for pair in checkpoints.windows(2) {
            if pair[1].offset_minutes <= pair[0].offset_minutes {
                return Err(PlanError::NonIncreasing {
                    previous: pair[0].offset_minutes,
                    next: pair[1].offset_minutes,
                });
            }
        }
        Ok(Self { checkpoints })
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl TryFrom<Vec<Checkpoint>> for EscalationPlan {
    type Error = PlanError;

    fn try_from(checkpoints: Vec<Checkpoint>) -> Result<Self, Self::Error> {
        Self::new(checkpoints)
    }
}

impl From<EscalationPlan> for Vec<Checkpoint> {
    fn from(plan: EscalationPlan) -> Self {
        plan.checkpoints
    }
}

/// Record of a checkpoint that fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredCheckpoint {
    pub index: usize,
    pub severity: Severity,
    pub fired_at: DateTime<Utc>,
    pub delivered: usize,
    pub failed_targets: Vec<String>,
    pub strike_recorded: bool,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: EscalationState,
    pub to: EscalationState,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// Persisted escalation task.
///
/// `next_checkpoint` is advanced after every fire so a restarted process
/// resumes where the previous one stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTask {
    pub id: EscalationId,
    pub subject_id: SubjectId,
    pub anchor_time: DateTime<Utc>,
    pub checkpoints: Vec<Checkpoint>,
    pub default_targets: Vec<String>,
    pub state: EscalationState,
    pub next_checkpoint: usize,
    pub fired: Vec<FiredCheckpoint>,
    pub cancel_reason: Option<CancelReason>,
    /// Plan name or other caller-supplied label.
    pub label: Option<String>,
    /// Only activity matching this pattern satisfies liveness; restored on recovery.
    #[serde(default)]
    pub until: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscalationTask {
    pub fn new(
        subject_id: impl Into<String>,
        anchor_time: DateTime<Utc>,
        plan: EscalationPlan,
        default_targets: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            anchor_time,
            checkpoints: plan.into(),
            default_targets,
            state: EscalationState::Scheduled,
            next_checkpoint: 0,
            fired: Vec::new(),
            cancel_reason: None,
            label: None,
            until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_until(mut self, pattern: impl Into<String>) -> Self {
        self.until = Some(pattern.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock time at which checkpoint `index` is due.
    pub fn fire_time(&self, index: usize) -> Option<DateTime<Utc>> {
        self.checkpoints
            .get(index)
            .map(|cp| self.anchor_time + cp.offset())
    }

    /// The checkpoint that fires next, if any.
    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        if self.is_terminal() {
            return None;
        }
        self.checkpoints.get(self.next_checkpoint)
    }

    /// Targets for a checkpoint with defaults and `@subject` resolved.
    pub fn resolve_targets(&self, checkpoint: &Checkpoint) -> Vec<String> {
        let raw = if checkpoint.targets.is_empty() {
            &self.default_targets
        } else {
            &checkpoint.targets
        };
        let mut resolved: Vec<String> = Vec::with_capacity(raw.len());
        for target in raw {
            let target = if target == SUBJECT_TARGET {
                self.subject_id.clone()
            } else {
                target.clone()
            };
            if !resolved.contains(&target) {
                resolved.push(target);
            }
        }
        resolved
    }

    /// Render the outbound message for a checkpoint.
    pub fn render_message(&self, index: usize) -> String {
        let Some(checkpoint) = self.checkpoints.get(index) else {
            return String::new();
        };
        match &checkpoint.message {
            Some(template) => template
                .replace("{subject}", &self.subject_id)
                .replace("{offset}", &checkpoint.offset_minutes.to_string())
                .replace("{severity}", &checkpoint.severity.to_string()),
            None => format!(
                "[{}] {}: no expected activity {}m after {} (checkpoint {}/{})",
                checkpoint.severity,
                self.subject_id,
                checkpoint.offset_minutes,
                self.anchor_time.format("%Y-%m-%d %H:%M UTC"),
                index + 1,
                self.checkpoints.len()
            ),
        }
    }

    fn transition(&mut self, to: EscalationState) -> Result<(), TransitionError> {
        if !self.state.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.state,
                to,
                reason: "task already finished".to_string(),
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record that the pending checkpoint fired; moves to Exhausted after the last one.
    pub fn record_fire(&mut self, fired: FiredCheckpoint) -> Result<(), TransitionError> {
        if fired.index != self.next_checkpoint {
            return Err(TransitionError {
                from: self.state,
                to: self.state,
                reason: format!(
                    "checkpoint {} fired out of order (expected {})",
                    fired.index, self.next_checkpoint
                ),
            });
        }
        let next = if fired.index + 1 >= self.checkpoints.len() {
            EscalationState::Exhausted
        } else {
            EscalationState::Scheduled
        };
        self.transition(next)?;
        self.fired.push(fired);
        self.next_checkpoint += 1;
        Ok(())
    }

    /// Move to Cancelled. Returns `false` when the task had already finished.
    pub fn cancel(&mut self, reason: CancelReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = EscalationState::Cancelled;
        self.cancel_reason = Some(reason);
        self.updated_at = Utc::now();
        true
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} fired {}/{} subject={}",
            self.state,
            self.id,
            self.fired.len(),
            self.checkpoints.len(),
            self.subject_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step_plan() -> EscalationPlan {
        EscalationPlan::new(vec![
            Checkpoint::new(5, Severity::Warn).to_targets([SUBJECT_TARGET]),
            Checkpoint::new(10, Severity::Alert).to_targets(["ops"]),
            Checkpoint::new(15, Severity::Critical).recording(StrikeCategory::Punctuality),
        ])
        .unwrap()
    }

    fn fired(index: usize) -> FiredCheckpoint {
        FiredCheckpoint {
            index,
            severity: Severity::Warn,
            fired_at: Utc::now(),
            delivered: 1,
            failed_targets: Vec::new(),
            strike_recorded: false,
        }
    }

    #[test]
    fn test_plan_rejects_empty_and_non_increasing() {
        assert_eq!(EscalationPlan::new(vec![]).unwrap_err(), PlanError::Empty);
        let err = EscalationPlan::new(vec![
            Checkpoint::new(10, Severity::Warn),
            Checkpoint::new(10, Severity::Alert),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::NonIncreasing {
                previous: 10,
                next: 10
            }
        );
    }

    #[test]
    fn test_plan_deserialize_validates() {
        let bad = r#"[{"offset_minutes":5,"severity":"warn"},{"offset_minutes":1,"severity":"alert"}]"#;
        assert!(serde_json::from_str::<EscalationPlan>(bad).is_err());

        let good = r#"[{"offset_minutes":0,"severity":"warn"},{"offset_minutes":5,"severity":"alert"}]"#;
        let plan: EscalationPlan = serde_json::from_str(good).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_until_pattern_persists_and_defaults_to_none() {
        let task = EscalationTask::new("u1", Utc::now(), three_step_plan(), vec!["ops".into()])
            .with_until("arrived|on site");
        let stored = serde_json::to_value(&task).unwrap();
        let restored: EscalationTask = serde_json::from_value(stored.clone()).unwrap();
        assert_eq!(restored.until.as_deref(), Some("arrived|on site"));

        let mut older = stored;
        older.as_object_mut().unwrap().remove("until");
        let restored: EscalationTask = serde_json::from_value(older).unwrap();
        assert!(restored.until.is_none());
        assert!(restored.status_line().starts_with("[scheduled]"));
    }

    #[test]
    fn test_fire_in_order_until_exhausted() {
        let mut task =
            EscalationTask::new("u1", Utc::now(), three_step_plan(), vec!["dispatch".into()]);
        assert_eq!(task.state, EscalationState::Scheduled);

        task.record_fire(fired(0)).unwrap();
        task.record_fire(fired(1)).unwrap();
        assert_eq!(task.state, EscalationState::Scheduled);
        task.record_fire(fired(2)).unwrap();
        assert_eq!(task.state, EscalationState::Exhausted);
        assert_eq!(task.next_checkpoint, 3);
        assert!(task.pending_checkpoint().is_none());
    }

    #[test]
    fn test_out_of_order_fire_rejected() {
        let mut task = EscalationTask::new("u1", Utc::now(), three_step_plan(), vec![]);
        let err = task.record_fire(fired(1)).unwrap_err();
        assert!(err.reason.contains("out of order"));
        assert_eq!(task.next_checkpoint, 0);
    }

    #[test]
    fn test_cancel_is_idempotent_and_terminal() {
        let mut task = EscalationTask::new("u1", Utc::now(), three_step_plan(), vec![]);
        task.record_fire(fired(0)).unwrap();
        assert!(task.cancel(CancelReason::LivenessSatisfied));
        assert!(!task.cancel(CancelReason::Requested));
        assert_eq!(task.cancel_reason, Some(CancelReason::LivenessSatisfied));
        assert!(task.record_fire(fired(1)).is_err());
    }

    #[test]
    fn test_resolve_targets() {
        let task = EscalationTask::new(
            "tech-7",
            Utc::now(),
            three_step_plan(),
            vec!["dispatch".into(), SUBJECT_TARGET.into()],
        );
        assert_eq!(task.resolve_targets(&task.checkpoints[0]), vec!["tech-7"]);
        assert_eq!(task.resolve_targets(&task.checkpoints[1]), vec!["ops"]);
        assert_eq!(
            task.resolve_targets(&task.checkpoints[2]),
            vec!["dispatch", "tech-7"]
        );
    }

    #[test]
    fn test_fire_time_and_message() {
        let anchor = Utc::now();
        let mut plan = three_step_plan().checkpoints().to_vec();
        plan[1].message = Some("{subject} still missing after {offset}m".into());
        let task = EscalationTask::new("u1", anchor, EscalationPlan::new(plan).unwrap(), vec![]);

        assert_eq!(task.fire_time(2), Some(anchor + Duration::minutes(15)));
        assert_eq!(task.fire_time(3), None);
        assert_eq!(task.render_message(1), "u1 still missing after 10m");
        assert!(task.render_message(0).starts_with("[warn] u1"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EscalationState::Scheduled.to_string(), "scheduled");
        assert_eq!(EscalationState::Cancelled.to_string(), "cancelled");
        assert_eq!(EscalationState::Exhausted.to_string(), "exhausted");
        assert!(EscalationState::Exhausted.is_terminal());
        assert!(!EscalationState::Scheduled.is_terminal());
    }
}
