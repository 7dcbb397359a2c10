//! Status conditions (`Ready`, `Stalled`, `config.injection.*`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const STALLED: &str = "Stalled";
pub const APPLIED: &str = "Applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(v: bool) -> Self {
        if v { Self::True } else { Self::False }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: if message.is_empty() { None } else { Some(message) },
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

pub fn find_condition<'a>(conds: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conds.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conds: &[Condition], type_: &str) -> bool {
    find_condition(conds, type_).map(Condition::is_true).unwrap_or(false)
}

/// Upsert a condition, stamping the transition time only when the status flips.
/// Returns true when anything changed.
pub fn set_condition(conds: &mut Vec<Condition>, mut cond: Condition) -> bool {
    match conds.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.same_state(&cond) {
                return false;
            }
            cond.last_transition_time = if existing.status == cond.status {
                existing.last_transition_time
            } else {
                Some(Utc::now())
            };
            *existing = cond;
            true
        }
        None => {
            cond.last_transition_time.get_or_insert_with(Utc::now);
            conds.push(cond);
            true
        }
    }
}
