//! CallReport: the durable, queryable record of a call's progress and outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::call_name::CallName;
use super::envelope::TaskEnvelope;
use super::ids::{GroupId, TaskId};
use super::operation::{ResourceOperation, Response};
use super::outcome::ExecutionError;
use super::request::CallRequest;
use super::state::CallState;

/// A held resource operation that blocked or rejected a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reason {
    pub resource_type: String,
    pub resource_id: String,
    pub operation: ResourceOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub task_id: TaskId,
    pub task_group_id: Option<GroupId>,
    pub call_name: CallName,
    pub state: CallState,
    pub response: Option<Response>,

    #[serde(default)]
    pub reasons: Vec<Reason>,

    #[serde(default)]
    pub result: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<ExecutionError>,

    #[serde(default)]
    pub spawned_tasks: Vec<TaskId>,

    #[serde(default)]
    pub progress: Option<serde_json::Value>,

    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub worker_name: Option<String>,
    pub queue: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Prerequisite id -> the state it ended in, for prerequisites that did
    /// not end in a state this call allowed.
    #[serde(default)]
    pub dependency_failures: BTreeMap<TaskId, CallState>,
}

impl CallReport {
    /// Fresh waiting report for a submitted request.
    pub fn waiting(request: &CallRequest) -> Self {
        Self {
            task_id: request.id,
            task_group_id: request.group_id,
            call_name: request.call_name,
            state: CallState::Waiting,
            response: None,
            reasons: Vec::new(),
            result: None,
            error: None,
            spawned_tasks: Vec::new(),
            progress: None,
            start_time: None,
            finish_time: None,
            worker_name: None,
            queue: None,
            tags: request.tags.clone(),
            dependency_failures: BTreeMap::new(),
        }
    }

    /// Waiting report for work dispatched without going through a request.
    pub fn for_envelope(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.task_id,
            task_group_id: envelope.group_id,
            call_name: envelope.call_name,
            state: CallState::Waiting,
            response: Some(Response::Accepted),
            reasons: Vec::new(),
            result: None,
            error: None,
            spawned_tasks: Vec::new(),
            progress: None,
            start_time: None,
            finish_time: None,
            worker_name: None,
            queue: None,
            tags: envelope.tags.clone(),
            dependency_failures: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }
}

/// Partial update of a report. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub state: Option<CallState>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    pub spawned_tasks: Option<Vec<TaskId>>,
    pub progress: Option<serde_json::Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub worker_name: Option<String>,
    pub queue: Option<String>,
    pub dependency_failures: Option<BTreeMap<TaskId, CallState>>,
}

impl StatusUpdate {
    pub fn state(state: CallState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finish_time = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = result;
        self
    }

    pub fn on_worker(mut self, worker_name: impl Into<String>, queue: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self.queue = Some(queue.into());
        self
    }

    pub fn apply_to(self, report: &mut CallReport) {
        if let Some(state) = self.state {
            report.state = state;
        }
        if let Some(result) = self.result {
            report.result = Some(result);
        }
        if let Some(error) = self.error {
            report.error = Some(error);
        }
        if let Some(spawned) = self.spawned_tasks {
            report.spawned_tasks = spawned;
        }
        if let Some(progress) = self.progress {
            report.progress = Some(progress);
        }
        if let Some(at) = self.start_time {
            report.start_time = Some(at);
        }
        if let Some(at) = self.finish_time {
            report.finish_time = Some(at);
        }
        if let Some(worker) = self.worker_name {
            report.worker_name = Some(worker);
        }
        if let Some(queue) = self.queue {
            report.queue = Some(queue);
        }
        if let Some(failures) = self.dependency_failures {
            report.dependency_failures = failures;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn update_only_touches_given_fields() {
        let request = CallRequest::new(TaskId::from_ulid(Ulid::new()), CallName::RepoSync)
            .with_tag("repository:repo-1");
        let mut report = CallReport::waiting(&request);
        report.response = Some(Response::Accepted);

        StatusUpdate::state(CallState::Running)
            .on_worker("worker-1", "worker-1.dq")
            .apply_to(&mut report);

        assert_eq!(report.state, CallState::Running);
        assert_eq!(report.worker_name.as_deref(), Some("worker-1"));
        assert_eq!(report.response, Some(Response::Accepted));
        assert_eq!(report.tags, vec!["repository:repo-1".to_string()]);
        assert!(report.result.is_none());
    }
}
