//! Bookkeeping records: who holds what, and which worker serves which resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::ids::{GroupId, TaskId};
use super::operation::ResourceOperation;
use super::request::CallRequest;

/// One resource operation held by a queued or running call.
///
/// Inserted with the enqueue of its call, removed exactly once when the call
/// leaves the live queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskResource {
    pub task_id: TaskId,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: ResourceOperation,
}

impl TaskResource {
    pub fn key(&self) -> (&str, &str) {
        (&self.resource_type, &self.resource_id)
    }
}

/// Compound key used for worker reservations: `resource_type:resource_id`.
pub fn reservation_key(resource_type: &str, resource_id: &str) -> String {
    format!("{resource_type}:{resource_id}")
}

/// Binding of a resource to the single worker currently serving it.
///
/// One row per reservation key. `task_ids` lists the dispatched calls still
/// using the binding; the row disappears with the last of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedResource {
    pub resource_id: String,
    pub worker_name: String,
    pub task_ids: BTreeSet<TaskId>,
}

/// A live worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub queue_name: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// A submitted request persisted until it leaves the live queue.
///
/// This is what recovery replays after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCall {
    pub task_id: TaskId,
    pub group_id: Option<GroupId>,
    pub timestamp: DateTime<Utc>,
    pub request: CallRequest,
}

impl QueuedCall {
    pub fn new(request: &CallRequest, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id: request.id,
            group_id: request.group_id,
            timestamp,
            request: request.clone(),
        }
    }
}
