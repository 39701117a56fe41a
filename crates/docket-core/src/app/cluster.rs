//! Cluster - 起動済みのアプリケーション
//!
//! # 起動順
//! 1. worker lifecycle manager（join / leave / heartbeat 切れを監視）
//! 2. coordinator のリカバリ（`Coordinator::start`）
//! 3. dispatcher ループ、resource manager、worker 群
//!
//! 停止は一つの watch channel で全ループに伝える。worker は先に止めて、
//! 実行中の handler が終わるのを待つ。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::coordinator::{Coordinator, CoordinatorParts, RecoverySummary, TaskQueue};
use crate::dispatch::{
    DispatchTask, ResourceManager, WorkerGroup, WorkerLifecycleManager, WorkerProcess,
    WorkerTimings,
};
use crate::error::DispatchError;
use crate::ports::{Broker, Clock, Store, UlidGenerator};

use super::builder::App;

impl App {
    /// Recover queued work and start every loop.
    pub async fn start(self) -> Result<Cluster, DispatchError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatch = Arc::new(DispatchTask::new(
            self.store.clone(),
            self.broker.clone(),
            self.clock.clone(),
            self.registry.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(
            self.store.clone(),
            dispatch.clone(),
            self.clock.clone(),
            self.config.completed_task_cache_life(),
        ));
        let coordinator = Arc::new(Coordinator::new(CoordinatorParts {
            store: self.store.clone(),
            dispatch: dispatch.clone(),
            queue: queue.clone(),
            matrix: self.matrix.clone(),
            lock: self.lock.clone(),
            ids: Arc::new(UlidGenerator::new(self.clock.clone())),
            clock: self.clock.clone(),
            permissions: self.permissions.clone(),
            task_state_poll_interval: self.config.task_state_poll_interval(),
            shutdown: shutdown_rx.clone(),
        }));

        let mut loops = Vec::new();
        let lifecycle = WorkerLifecycleManager::new(
            self.store.clone(),
            self.broker.clone(),
            dispatch.clone(),
            self.clock.clone(),
            self.config.heartbeat_timeout(),
        );
        loops.push(tokio::spawn(
            lifecycle.run(self.config.heartbeat_interval(), shutdown_rx.clone()),
        ));

        let recovery = coordinator.start().await?;

        loops.push(tokio::spawn(
            queue.run(self.config.dispatch_interval(), shutdown_rx.clone()),
        ));
        let resource_manager = ResourceManager::new(
            self.store.clone(),
            self.broker.clone(),
            self.config.worker_poll_interval(),
            self.config.consume_timeout(),
        );
        loops.push(tokio::spawn(resource_manager.run(shutdown_rx)));

        let mut cluster = Cluster {
            coordinator,
            recovery,
            store: self.store,
            broker: self.broker,
            clock: self.clock,
            dispatch,
            timings: WorkerTimings {
                heartbeat_interval: self.config.heartbeat_interval(),
                consume_timeout: self.config.consume_timeout(),
            },
            workers: WorkerGroup::new(),
            next_worker: 0,
            shutdown_tx,
            loops,
        };
        for _ in 0..self.config.workers.count {
            cluster.add_worker();
        }
        info!(
            workers = self.config.workers.count,
            resubmitted = cluster.recovery.resubmitted.len(),
            "cluster started"
        );
        Ok(cluster)
    }
}

pub struct Cluster {
    coordinator: Arc<Coordinator>,
    recovery: RecoverySummary,
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    dispatch: Arc<DispatchTask>,
    timings: WorkerTimings,
    workers: WorkerGroup,
    next_worker: usize,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// What the startup recovery replayed.
    pub fn recovery(&self) -> &RecoverySummary {
        &self.recovery
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Spawn one more worker and return its name.
    pub fn add_worker(&mut self) -> String {
        let name = format!("worker-{}", self.next_worker);
        self.next_worker += 1;
        self.workers.add(WorkerProcess::new(
            name.clone(),
            self.store.clone(),
            self.broker.clone(),
            self.clock.clone(),
            self.dispatch.clone(),
            self.timings,
        ));
        name
    }

    /// Abort a worker the way a crash would: no deregistration, no leave
    /// event. The lifecycle manager notices through the heartbeat.
    pub fn kill_worker(&mut self, name: &str) -> bool {
        self.workers.kill(name)
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.names()
    }

    pub async fn shutdown_and_join(self) {
        self.workers.shutdown_and_join().await;
        // ignore send error: every loop may already be gone
        let _ = self.shutdown_tx.send(true);
        for join in self.loops {
            let _ = join.await;
        }
        info!("cluster stopped");
    }
}
