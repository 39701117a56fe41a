//! Call state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a call report.
///
/// State transitions:
/// - Waiting -> Running -> Finished | Error | Canceled
/// - Waiting -> Canceled (canceled before dispatch)
/// - Waiting -> Skipped (a prerequisite ended in a state the call did not allow)
///
/// A report never leaves a complete state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Waiting,
    Running,
    Finished,
    Error,
    Canceled,
    Skipped,
}

impl CallState {
    /// States a report can never leave.
    pub const COMPLETE: [CallState; 4] = [
        CallState::Finished,
        CallState::Error,
        CallState::Canceled,
        CallState::Skipped,
    ];

    pub fn is_complete(self) -> bool {
        matches!(
            self,
            CallState::Finished | CallState::Error | CallState::Canceled | CallState::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Waiting => "waiting",
            CallState::Running => "running",
            CallState::Finished => "finished",
            CallState::Error => "error",
            CallState::Canceled => "canceled",
            CallState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
