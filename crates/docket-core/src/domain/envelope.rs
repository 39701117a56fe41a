use serde::{Deserialize, Serialize};

use super::call_name::CallName;
use super::ids::{GroupId, TaskId};
use super::request::CallRequest;

/// CallName + 引数 (+ TaskId) の“運搬用”データ。
///
/// Broker を流れるのはこれだけで、状態は store 側が正本です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub call_name: CallName,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,
    pub group_id: Option<GroupId>,
    pub asynchronous: bool,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, call_name: CallName) -> Self {
        Self {
            task_id,
            call_name,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            tags: Vec::new(),
            group_id: None,
            asynchronous: false,
        }
    }

    pub fn from_request(request: &CallRequest) -> Self {
        Self {
            task_id: request.id,
            call_name: request.call_name,
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            tags: request.tags.clone(),
            group_id: request.group_id,
            asynchronous: request.asynchronous,
        }
    }
}

/// Messages carried by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Run the call on whichever worker consumes it.
    Execute(TaskEnvelope),

    /// Ask the resource manager to bind a worker to `resource_key` and route
    /// the call there.
    Reserve {
        resource_key: String,
        envelope: TaskEnvelope,
    },

    /// Drop the worker binding held for `task_id`. Always follows the
    /// matching `Execute` on the same worker queue.
    Release {
        resource_key: String,
        task_id: TaskId,
        asynchronous: bool,
    },
}

impl BrokerMessage {
    /// Call the message is about.
    pub fn task_id(&self) -> TaskId {
        match self {
            BrokerMessage::Execute(envelope) => envelope.task_id,
            BrokerMessage::Reserve { envelope, .. } => envelope.task_id,
            BrokerMessage::Release { task_id, .. } => *task_id,
        }
    }
}
