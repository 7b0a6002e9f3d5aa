use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Summary condition type, always sorted first
pub static READY_CONDITION: &str = "Ready";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a non-True condition is
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum ConditionSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    #[must_use]
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        severity: Option<ConditionSeverity>,
        reason: Option<&str>,
        message: Option<&str>,
    ) -> Condition {
        Condition {
            type_: type_.to_string(),
            status,
            severity,
            reason: reason.map(str::to_string),
            message: message.filter(|m| !m.is_empty()).map(str::to_string),
            last_transition_time: Utc::now(),
        }
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

fn order(a: &Condition, b: &Condition) -> std::cmp::Ordering {
    let ready = |c: &Condition| c.type_ != READY_CONDITION;
    ready(a).cmp(&ready(b)).then_with(|| a.type_.cmp(&b.type_))
}

/// Condition bookkeeping shared by every status carrying a condition list.
///
/// Each type appears at most once. Setting a condition whose observable state
/// did not change keeps the previous transition time.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    fn set_condition(&mut self, mut condition: Condition) {
        let conditions = self.conditions_mut();
        if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.same_state(&condition) {
                return;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            conditions.push(condition);
        }
        conditions.sort_by(order);
    }

    fn mark_true(&mut self, type_: &str) {
        self.set_condition(Condition::new(type_, ConditionStatus::True, None, None, None));
    }

    fn mark_false(&mut self, type_: &str, reason: &str, severity: ConditionSeverity, message: &str) {
        self.set_condition(Condition::new(
            type_,
            ConditionStatus::False,
            Some(severity),
            Some(reason),
            Some(message),
        ));
    }

    fn mark_unknown(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(Condition::new(
            type_,
            ConditionStatus::Unknown,
            None,
            Some(reason),
            Some(message),
        ));
    }
}
