//! Worker process: consumes its dedicated queue plus the default queue.
//!
//! # フロー
//! 1. 起動時に Worker レコードを upsert し、join を announce
//! 2. `Execute` → begin（canceled / revoked ならスキップ）→ handler 実行
//!    - handler 実行中に terminate 付き revoke が来たら abort
//!    - 非同期 call は handler が返っても running のまま（完了は外部から報告）
//! 3. `Release` → 予約の解放（同期 call が running のままなら error にする）
//! 4. heartbeat は同じ task 内で並行に回す（abort すれば heartbeat も止まる）
//! 5. 正常終了時は Worker レコードを消して leave を announce

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::outcome::codes;
use crate::domain::{BrokerMessage, ExecutionError, TaskEnvelope, WorkerRecord};
use crate::error::DispatchError;
use crate::ports::{Broker, Clock, DEFAULT_QUEUE, Store, WorkerEvent, dedicated_queue};

use super::wrapper::{Dispatch, DispatchTask};

#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    pub heartbeat_interval: Duration,
    pub consume_timeout: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            consume_timeout: Duration::from_millis(200),
        }
    }
}

pub struct WorkerProcess {
    name: String,
    queue: String,
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    dispatch: Arc<DispatchTask>,
    timings: WorkerTimings,
}

impl WorkerProcess {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        dispatch: Arc<DispatchTask>,
        timings: WorkerTimings,
    ) -> Self {
        let name = name.into();
        let queue = dedicated_queue(&name);
        Self {
            name,
            queue,
            store,
            broker,
            clock,
            dispatch,
            timings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn record(&self) -> WorkerRecord {
        WorkerRecord {
            name: self.name.clone(),
            queue_name: self.queue.clone(),
            last_heartbeat: self.clock.now(),
        }
    }

    pub async fn register(&self) -> Result<(), DispatchError> {
        self.store.upsert_worker(self.record()).await?;
        self.broker
            .announce(WorkerEvent::Joined {
                name: self.name.clone(),
                queue_name: self.queue.clone(),
            })
            .await?;
        info!(worker = %self.name, queue = %self.queue, "worker joined");
        Ok(())
    }

    pub async fn deregister(&self) -> Result<(), DispatchError> {
        self.store.remove_worker(&self.name).await?;
        self.broker
            .announce(WorkerEvent::Left {
                name: self.name.clone(),
            })
            .await?;
        info!(worker = %self.name, "worker left");
        Ok(())
    }

    /// Run until shutdown is requested (or the task is aborted).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.register().await {
            error!(worker = %self.name, error = %e, "worker registration failed");
            return;
        }

        // heartbeat は consume_loop が抜けるまで回り続ける（実行中の handler を途中で捨てない）
        tokio::select! {
            _ = self.heartbeat_loop() => {}
            _ = self.consume_loop(&mut shutdown) => {}
        }

        if let Err(e) = self.deregister().await {
            warn!(worker = %self.name, error = %e, "worker deregistration failed");
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.timings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.store.touch_worker(&self.name, self.clock.now()).await {
                Ok(true) => {}
                // lifecycle manager に消されていたら登録し直す
                Ok(false) => {
                    if let Err(e) = self.register().await {
                        warn!(worker = %self.name, error = %e, "worker re-registration failed");
                    }
                }
                Err(e) => warn!(worker = %self.name, error = %e, "heartbeat failed"),
            }
        }
    }

    async fn consume_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        // 専用キューを優先
        let queues = vec![self.queue.clone(), DEFAULT_QUEUE.to_string()];
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.broker.consume(&queues, self.timings.consume_timeout) => next,
            };

            let (queue, message) = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "consume failed");
                    tokio::time::sleep(self.timings.consume_timeout).await;
                    continue;
                }
            };

            if let Err(e) = self.handle_message(&queue, message).await {
                error!(worker = %self.name, error = %e, "message handling failed");
            }
        }
    }

    pub async fn handle_message(
        &self,
        queue: &str,
        message: BrokerMessage,
    ) -> Result<(), DispatchError> {
        match message {
            BrokerMessage::Execute(envelope) => self.execute(envelope, queue).await,
            BrokerMessage::Release {
                resource_key,
                task_id,
                asynchronous,
            } => {
                self.dispatch
                    .release_resource(&resource_key, task_id, asynchronous)
                    .await
            }
            BrokerMessage::Reserve { envelope, .. } => {
                warn!(worker = %self.name, task_id = %envelope.task_id, "reserve message on a worker queue; ignoring");
                Ok(())
            }
        }
    }

    async fn execute(&self, envelope: TaskEnvelope, queue: &str) -> Result<(), DispatchError> {
        let task_id = envelope.task_id;
        // begin より先に購読しておかないと、その間の revoke を取りこぼす
        let mut revocations = self.broker.subscribe_revocations();
        if !self.dispatch.begin(&envelope, &self.name, queue).await? {
            return Ok(());
        }

        let registry = Arc::clone(self.dispatch.registry());
        let call = envelope.clone();
        let mut handle = tokio::spawn(async move { registry.execute(&call).await });

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break Some(joined),
                revoked = revocations.recv() => match revoked {
                    Ok(r) if r.task_id == task_id && r.terminate => {
                        handle.abort();
                        break None;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.broker.is_revoked(task_id).await {
                            handle.abort();
                            break None;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break Some((&mut handle).await),
                },
            }
        };

        match joined {
            None => {
                info!(task_id = %task_id, worker = %self.name, "call terminated");
            }
            Some(Ok(Ok(_))) if envelope.asynchronous => {
                debug!(task_id = %task_id, "asynchronous call awaiting completion report");
            }
            Some(Ok(Ok(result))) => {
                self.dispatch.on_success(task_id, result).await?;
            }
            Some(Ok(Err(error))) => {
                self.dispatch.on_failure(task_id, error).await?;
            }
            Some(Err(join_error)) => {
                let error = ExecutionError::new(
                    codes::HANDLER_PANICKED,
                    format!("handler for {} did not complete", envelope.call_name),
                )
                .with_child(ExecutionError::wrap(&join_error));
                self.dispatch.on_failure(task_id, error).await?;
            }
        }
        Ok(())
    }
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーに停止を伝える
/// - `kill()` はクラッシュ相当（レコードも leave も残さない）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: HashMap<String, JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: HashMap::new(),
        }
    }

    /// Spawn every worker in `workers`.
    pub fn spawn(workers: impl IntoIterator<Item = WorkerProcess>) -> Self {
        let mut group = Self::new();
        for worker in workers {
            group.add(worker);
        }
        group
    }

    pub fn add(&mut self, worker: WorkerProcess) {
        let name = worker.name().to_string();
        let worker = Arc::new(worker);
        let rx = self.shutdown_tx.subscribe();
        let join = tokio::spawn(worker.run(rx));
        if let Some(previous) = self.joins.insert(name.clone(), join) {
            warn!(worker = %name, "replacing a worker with the same name");
            previous.abort();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.joins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Abort a worker without letting it deregister.
    pub fn kill(&mut self, name: &str) -> bool {
        match self.joins.remove(name) {
            Some(join) => {
                join.abort();
                warn!(worker = name, "worker killed");
                true
            }
            None => false,
        }
    }

    /// Request shutdown for all workers.
    /// 実行中の handler は止めない。新しいメッセージを取らなくなるだけ
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for (_, join) in self.joins {
            let _ = join.await;
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}
