//! Broker port - worker へのメッセージ配送
//!
//! # 要件
//! - worker ごとの名前付きキュー（dedicated queue）
//! - task id による revoke / terminate
//! - worker の join / leave を観測できること（WorkerLifecycleManager が使う）

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::{BrokerMessage, TaskId};

/// Queue every worker consumes besides its own.
pub const DEFAULT_QUEUE: &str = "docket.default";

/// Queue consumed by the resource manager only.
pub const RESOURCE_MANAGER_QUEUE: &str = "docket.resource_manager";

/// Name of the queue only `worker_name` consumes.
pub fn dedicated_queue(worker_name: &str) -> String {
    format!("{worker_name}.dq")
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected the request: {0}")]
    Rejected(String),
}

/// A revoke request broadcast to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub task_id: TaskId,
    /// Abort the call if it is already running.
    pub terminate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Joined { name: String, queue_name: String },
    Left { name: String },
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Take the next message from the first non-empty queue in `queues`,
    /// waiting up to `timeout`. Returns the queue name with the message.
    async fn consume(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, BrokerMessage)>, BrokerError>;

    /// Drop a queue and everything still in it. Returns the dropped count.
    async fn delete_queue(&self, queue: &str) -> Result<usize, BrokerError>;

    async fn revoke(&self, task_id: TaskId, terminate: bool) -> Result<(), BrokerError>;

    async fn is_revoked(&self, task_id: TaskId) -> bool;

    fn subscribe_revocations(&self) -> broadcast::Receiver<Revocation>;

    async fn announce(&self, event: WorkerEvent) -> Result<(), BrokerError>;

    fn subscribe_membership(&self) -> broadcast::Receiver<WorkerEvent>;
}
