//! Outcome model: what a handler hands back and what a report stores.
//!
//! Errors raised inside dispatched work never propagate to the dispatcher.
//! They are normalized into [`ExecutionError`] and stored on the call report.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;

/// Stable error codes stored on reports.
pub mod codes {
    /// A handler returned a failure.
    pub const EXECUTION_FAILED: &str = "execution_failed";
    /// No handler was registered for the call name.
    pub const HANDLER_MISSING: &str = "handler_missing";
    /// The handler panicked or its task was aborted.
    pub const HANDLER_PANICKED: &str = "handler_panicked";
    /// The release step found the call still running.
    pub const EXITED_IMMEDIATELY: &str = "exited_immediately";
    /// The worker running the call disappeared.
    pub const WORKER_LOST: &str = "worker_lost";
    /// A failure reported for an asynchronous call.
    pub const ASYNC_FAILURE: &str = "async_failure";
}

/// Generic execution error carrying the wrapped cause plus secondary failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExecutionError>,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            data: None,
            children: Vec::new(),
        }
    }

    /// Wrap an arbitrary error raised by a handler.
    pub fn wrap(err: &dyn std::error::Error) -> Self {
        let mut wrapped = Self::new(codes::EXECUTION_FAILED, err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            wrapped
                .children
                .push(Self::new(codes::EXECUTION_FAILED, cause.to_string()));
            source = cause.source();
        }
        wrapped
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_child(mut self, child: ExecutionError) -> Self {
        self.children.push(child);
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.description)?;
        if !self.children.is_empty() {
            write!(f, " ({} secondary failure(s))", self.children.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}

/// Structured result of a successful handler run.
///
/// A successful run may still carry a secondary error (partial failure) and
/// the ids of calls it spawned. Both are folded into the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawned_tasks: Vec<TaskId>,
}

impl TaskResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_spawned(mut self, task_id: TaskId) -> Self {
        self.spawned_tasks.push(task_id);
        self
    }
}
