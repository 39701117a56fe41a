//! Task: a submitted request plus the coordinator's bookkeeping about it.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{CallRequest, CallState, GroupId, ResourceOperation, TaskEnvelope, TaskId};

/// How the caller expects to observe completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Completion is recorded by the worker when the handler returns.
    Synchronous,
    /// Completion is reported back later through the coordinator.
    Asynchronous,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub request: CallRequest,
    /// Live tasks this one must wait for (resource conflicts and declared
    /// dependencies alike).
    pub blocking: BTreeSet<TaskId>,
    /// Prerequisites that ended in a state this task does not allow.
    pub dependency_failures: BTreeMap<TaskId, CallState>,
}

impl Task {
    pub fn new(request: CallRequest) -> Self {
        Self {
            request,
            blocking: BTreeSet::new(),
            dependency_failures: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.request.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.request.group_id
    }

    pub fn kind(&self) -> TaskKind {
        if self.request.asynchronous {
            TaskKind::Asynchronous
        } else {
            TaskKind::Synchronous
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocking.is_empty()
    }

    /// Exit states `prerequisite` may end in for this task to still run.
    pub fn allowed_states(&self, prerequisite: TaskId) -> Option<&[CallState]> {
        self.request
            .dependencies
            .get(&prerequisite)
            .map(Vec::as_slice)
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope::from_request(&self.request)
    }

    /// Resource the task is pinned to when dispatched: the first declared
    /// `(resource_type, resource_id)` in sorted order.
    pub fn reservation_target(&self) -> Option<(&str, &str, ResourceOperation)> {
        self.request.resource_entries().into_iter().next()
    }
}
