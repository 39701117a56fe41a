//! InMemoryBroker - 開発用のメッセージブローカー
//!
//! # 実装詳細
//! - `HashMap<String, VecDeque<BrokerMessage>>` でキューごとに FIFO を管理
//! - `tokio::sync::Notify` で publish 時に consumer を起こす
//! - revoke と worker の join/leave は `broadcast` で全員に配る
//! - revoked 集合は上限付き。古い id から忘れる（revoke は consume より十分前に来る前提）

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

use crate::domain::{BrokerMessage, TaskId};
use crate::ports::broker::{Broker, BrokerError, Revocation, WorkerEvent};

const REVOCATION_CAPACITY: usize = 256;
const MEMBERSHIP_CAPACITY: usize = 64;
const REVOKED_LIMIT: usize = 10_000;

/// Revoked ids, oldest first; at most `limit` of them.
struct RevokedSet {
    order: VecDeque<TaskId>,
    members: HashSet<TaskId>,
    limit: usize,
}

impl RevokedSet {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            limit: limit.max(1),
        }
    }

    fn insert(&mut self, task_id: TaskId) {
        if !self.members.insert(task_id) {
            return;
        }
        self.order.push_back(task_id);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, task_id: &TaskId) -> bool {
        self.members.contains(task_id)
    }
}

pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<BrokerMessage>>>,
    notify: Notify,
    revoked: Mutex<RevokedSet>,
    revocations: broadcast::Sender<Revocation>,
    membership: broadcast::Sender<WorkerEvent>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_revoked_limit(REVOKED_LIMIT)
    }

    /// Broker remembering at most `limit` revoked ids.
    pub fn with_revoked_limit(limit: usize) -> Self {
        let (revocations, _) = broadcast::channel(REVOCATION_CAPACITY);
        let (membership, _) = broadcast::channel(MEMBERSHIP_CAPACITY);
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            revoked: Mutex::new(RevokedSet::new(limit)),
            revocations,
            membership,
        }
    }

    /// Messages currently waiting in `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        {
            let mut queues = self.queues.lock().await;
            queues.entry(queue.to_string()).or_default().push_back(message);
        }
        // consumer ごとに見ているキューが違うので全員起こす
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, BrokerMessage)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            // チェックより先に登録しておかないと、その間の publish を取りこぼす
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.queues.lock().await;
                for name in queues {
                    if let Some(message) = guard.get_mut(name).and_then(VecDeque::pop_front) {
                        return Ok(Some((name.clone(), message)));
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.queues.lock().await;
        Ok(queues.remove(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn revoke(&self, task_id: TaskId, terminate: bool) -> Result<(), BrokerError> {
        self.revoked.lock().await.insert(task_id);
        // 受信者がいなくても revoked 集合には残るので send エラーは無視してよい
        let _ = self.revocations.send(Revocation { task_id, terminate });
        Ok(())
    }

    async fn is_revoked(&self, task_id: TaskId) -> bool {
        self.revoked.lock().await.contains(&task_id)
    }

    fn subscribe_revocations(&self) -> broadcast::Receiver<Revocation> {
        self.revocations.subscribe()
    }

    async fn announce(&self, event: WorkerEvent) -> Result<(), BrokerError> {
        let _ = self.membership.send(event);
        Ok(())
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<WorkerEvent> {
        self.membership.subscribe()
    }
}
