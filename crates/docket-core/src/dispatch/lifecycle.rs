//! WorkerLifecycleManager - worker の生存管理と後始末
//!
//! worker が消えた（leave を announce した / heartbeat が途絶えた）とき:
//! 1. その worker に束縛されていた予約を全部消す
//! 2. その worker 上の未完了 call を cancel する
//! 3. Worker レコードを消す
//! 4. 専用キューに残ったメッセージを捨てる
//!
//! 予約を先に消すので、後続の call は別の worker に振り直される。

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::domain::{TaskId, WorkerRecord};
use crate::error::DispatchError;
use crate::ports::{Broker, Clock, StatusFilter, Store, WorkerEvent, dedicated_queue};

use super::wrapper::{Dispatch, DispatchTask};

/// What the cleanup of one lost worker did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCleanup {
    pub worker_name: String,
    pub released_reservations: Vec<String>,
    pub canceled_tasks: Vec<TaskId>,
    pub dropped_messages: usize,
}

pub struct WorkerLifecycleManager {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    dispatch: Arc<DispatchTask>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

impl WorkerLifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        dispatch: Arc<DispatchTask>,
        clock: Arc<dyn Clock>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            dispatch,
            clock,
            heartbeat_timeout,
        }
    }

    pub async fn worker_joined(&self, name: &str, queue_name: &str) -> Result<(), DispatchError> {
        self.store
            .upsert_worker(WorkerRecord {
                name: name.to_string(),
                queue_name: queue_name.to_string(),
                last_heartbeat: self.clock.now(),
            })
            .await?;
        debug!(worker = name, "worker record refreshed on join");
        Ok(())
    }

    pub async fn worker_lost(&self, name: &str) -> Result<WorkerCleanup, DispatchError> {
        let released = self.store.release_worker(name).await?;
        let released_reservations: Vec<String> =
            released.into_iter().map(|row| row.resource_id).collect();

        let orphaned = self
            .store
            .find_statuses(&StatusFilter::incomplete_on_worker(name))
            .await?;
        let mut canceled_tasks = Vec::with_capacity(orphaned.len());
        for report in orphaned {
            match self.dispatch.cancel(report.task_id).await {
                Ok(_) => canceled_tasks.push(report.task_id),
                Err(e) => warn!(task_id = %report.task_id, worker = name, error = %e, "cancel of orphaned call failed"),
            }
        }

        self.store.remove_worker(name).await?;
        let dropped_messages = self.broker.delete_queue(&dedicated_queue(name)).await?;

        info!(
            worker = name,
            reservations = released_reservations.len(),
            canceled = canceled_tasks.len(),
            dropped = dropped_messages,
            "worker lost; cleaned up"
        );
        Ok(WorkerCleanup {
            worker_name: name.to_string(),
            released_reservations,
            canceled_tasks,
            dropped_messages,
        })
    }

    /// Clean up every worker whose heartbeat is older than the timeout.
    pub async fn sweep(&self) -> Result<Vec<WorkerCleanup>, DispatchError> {
        let timeout = ChronoDuration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::days(36_500));
        let cutoff = self.clock.now() - timeout;

        let mut cleanups = Vec::new();
        for worker in self.store.workers().await? {
            if worker.last_heartbeat < cutoff {
                warn!(worker = %worker.name, last_heartbeat = %worker.last_heartbeat, "worker heartbeat expired");
                cleanups.push(self.worker_lost(&worker.name).await?);
            }
        }
        Ok(cleanups)
    }

    /// Follow membership events and sweep stale workers until shutdown.
    pub async fn run(self, sweep_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut membership = self.broker.subscribe_membership();
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = membership.recv() => match event {
                    Ok(WorkerEvent::Joined { name, queue_name }) => {
                        if let Err(e) = self.worker_joined(&name, &queue_name).await {
                            error!(worker = %name, error = %e, "join handling failed");
                        }
                    }
                    Ok(WorkerEvent::Left { name }) => {
                        if let Err(e) = self.worker_lost(&name).await {
                            error!(worker = %name, error = %e, "leave handling failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // 取りこぼした leave は heartbeat の sweep で拾う
                        warn!(missed, "membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "worker sweep failed");
                    }
                }
            }
        }
        debug!("worker lifecycle manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::OperationRegistry;
    use crate::domain::{BrokerMessage, CallName, CallState, TaskEnvelope};
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::{FixedClock, ReservationStore, StatusStore, WorkerStore};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        clock: FixedClock,
        dispatch: Arc<DispatchTask>,
        manager: WorkerLifecycleManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let dispatch = Arc::new(DispatchTask::new(
            store.clone(),
            broker.clone(),
            Arc::new(clock.clone()),
            Arc::new(OperationRegistry::new()),
        ));
        let manager = WorkerLifecycleManager::new(
            store.clone(),
            broker.clone(),
            dispatch.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(30),
        );
        Fixture {
            store,
            broker,
            clock,
            dispatch,
            manager,
        }
    }

    async fn running_on(f: &Fixture, worker: &str) -> TaskId {
        let call = TaskEnvelope::new(TaskId::from_ulid(Ulid::new()), CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call.clone()).await.unwrap();
        f.dispatch
            .begin(&call, worker, &dedicated_queue(worker))
            .await
            .unwrap();
        task_id
    }

    #[tokio::test]
    async fn lost_worker_is_cleaned_up() {
        let f = fixture();
        f.manager.worker_joined("worker-a", "worker-a.dq").await.unwrap();
        let task_id = running_on(&f, "worker-a").await;
        f.store.reserve("repository:repo-1", "worker-a", task_id).await.unwrap();
        f.broker
            .publish(
                "worker-a.dq",
                BrokerMessage::Execute(TaskEnvelope::new(
                    TaskId::from_ulid(Ulid::new()),
                    CallName::RepoSync,
                )),
            )
            .await
            .unwrap();

        let cleanup = f.manager.worker_lost("worker-a").await.unwrap();

        assert_eq!(cleanup.released_reservations, vec!["repository:repo-1".to_string()]);
        assert_eq!(cleanup.canceled_tasks, vec![task_id]);
        assert_eq!(cleanup.dropped_messages, 1);
        assert!(f.store.workers().await.unwrap().is_empty());
        assert!(f.store.reservations().await.unwrap().is_empty());
        let status = f.store.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Canceled);
    }

    #[tokio::test]
    async fn other_workers_are_left_alone() {
        let f = fixture();
        f.manager.worker_joined("worker-a", "worker-a.dq").await.unwrap();
        f.manager.worker_joined("worker-b", "worker-b.dq").await.unwrap();
        let survivor = running_on(&f, "worker-b").await;

        f.manager.worker_lost("worker-a").await.unwrap();

        let workers = f.store.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "worker-b");
        let status = f.store.get_status(survivor).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Running);
    }

    #[tokio::test]
    async fn sweep_only_removes_stale_workers() {
        let f = fixture();
        f.manager.worker_joined("worker-stale", "worker-stale.dq").await.unwrap();
        f.clock.advance(Duration::from_secs(20));
        f.manager.worker_joined("worker-fresh", "worker-fresh.dq").await.unwrap();
        f.clock.advance(Duration::from_secs(15));

        let cleanups = f.manager.sweep().await.unwrap();

        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].worker_name, "worker-stale");
        let workers = f.store.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "worker-fresh");
    }

    #[tokio::test]
    async fn leave_event_triggers_cleanup() {
        let f = fixture();
        f.manager.worker_joined("worker-a", "worker-a.dq").await.unwrap();
        let task_id = running_on(&f, "worker-a").await;
        let store = f.store.clone();
        let broker = f.broker.clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.manager.run(Duration::from_secs(60), rx));
        // run が購読を始めるまで待つ
        tokio::time::sleep(Duration::from_millis(50)).await;

        broker
            .announce(WorkerEvent::Left {
                name: "worker-a".to_string(),
            })
            .await
            .unwrap();

        let mut canceled = false;
        for _ in 0..100 {
            let status = store.get_status(task_id).await.unwrap().unwrap();
            if status.state == CallState::Canceled {
                canceled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(canceled);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
