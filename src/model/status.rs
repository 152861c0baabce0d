//! Entity status machine.
//!
//! `PENDING` is the absence of a status. The planner is pure: it names the
//! outcome of a proposed transition and leaves logging and counter updates
//! to the caller, so the table is testable without a store or a logger.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn from_value(v: Option<&Value>) -> Option<Self> {
        v.and_then(Value::as_str).and_then(Self::from_str)
    }

    pub fn value(self) -> Value {
        Value::String(self.as_str().to_string())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats an optional status for log output.
pub fn status_label(s: Option<Status>) -> &'static str {
    s.map_or("PENDING", Status::as_str)
}

/// Outcome of a proposed status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First observation: pending -> RUNNING.
    Start,
    /// Retry: FAILED -> RUNNING. Callers reverse the earlier failure
    /// counters.
    Retry,
    /// Normal completion: RUNNING -> SUCCEEDED or FAILED.
    Finish(Status),
    /// A later attempt succeeded after the entity was marked FAILED.
    LateSuccess,
    /// SUCCEEDED is terminal; the proposed transition is refused.
    AlreadySucceeded,
    /// Everything else is outside the machine.
    Unexpected { prev: Option<Status> },
}

/// Plans the transition from `prev` to `next`.
pub fn plan(prev: Option<Status>, next: Status) -> Outcome {
    use Status::*;
    match (prev, next) {
        (Some(Succeeded), _) => Outcome::AlreadySucceeded,
        (None, Running) => Outcome::Start,
        (Some(Failed), Running) => Outcome::Retry,
        (Some(Running), Succeeded) => Outcome::Finish(Succeeded),
        (Some(Running), Failed) => Outcome::Finish(Failed),
        (Some(Failed), Succeeded) => Outcome::LateSuccess,
        (prev, _) => Outcome::Unexpected { prev },
    }
}
