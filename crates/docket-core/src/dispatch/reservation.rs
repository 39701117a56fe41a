//! Resource manager: binds reserved calls to workers.
//!
//! For every `Reserve` message the manager looks for the worker already
//! bound to the key; failing that, any worker serving no reservation;
//! failing that, it sleeps and looks again. Once a worker is found the
//! binding is recorded, the call goes to that worker's dedicated queue, and
//! a `Release` always follows it on the same queue.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::{BrokerMessage, StatusUpdate, TaskEnvelope};
use crate::error::DispatchError;
use crate::ports::{Broker, RESOURCE_MANAGER_QUEUE, Store, dedicated_queue};

pub struct ResourceManager {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    worker_poll_interval: Duration,
    consume_timeout: Duration,
}

impl ResourceManager {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        worker_poll_interval: Duration,
        consume_timeout: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            worker_poll_interval,
            consume_timeout,
        }
    }

    /// Consume the resource manager queue until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queues = vec![RESOURCE_MANAGER_QUEUE.to_string()];
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
                next = self.broker.consume(&queues, self.consume_timeout) => next,
            };

            match next {
                Ok(Some((_, BrokerMessage::Reserve { resource_key, envelope }))) => {
                    match self.queue_reserved_task(&resource_key, envelope, &mut shutdown).await {
                        Ok(_) => {}
                        Err(DispatchError::ShuttingDown) => break,
                        Err(e) => error!(resource = %resource_key, error = %e, "reservation failed"),
                    }
                }
                Ok(Some((_, other))) => {
                    warn!(task_id = %other.task_id(), "resource manager ignoring unexpected message");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "resource manager consume failed");
                    tokio::time::sleep(self.worker_poll_interval).await;
                }
            }
        }
        debug!("resource manager stopped");
    }

    /// Worker to route `resource_key` to right now, if any.
    pub async fn pick_worker(&self, resource_key: &str) -> Result<Option<String>, DispatchError> {
        if let Some(bound) = self.store.find_reservation(resource_key).await? {
            return Ok(Some(bound.worker_name));
        }
        let free = self.store.unreserved_workers().await?;
        Ok(free
            .choose(&mut rand::thread_rng())
            .map(|worker| worker.name.clone()))
    }

    /// Bind a worker to `resource_key` and route the call to it.
    ///
    /// Waits, polling, until some worker can take the key. Returns the name
    /// of the worker the call was routed to, or `None` when the call
    /// completed (was canceled) while waiting.
    pub async fn queue_reserved_task(
        &self,
        resource_key: &str,
        envelope: TaskEnvelope,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<String>, DispatchError> {
        let task_id = envelope.task_id;
        let candidate = loop {
            let complete = self
                .store
                .get_status(task_id)
                .await?
                .is_some_and(|r| r.is_complete());
            if complete {
                debug!(task_id = %task_id, resource = resource_key, "call completed before a worker was bound");
                return Ok(None);
            }
            if let Some(name) = self.pick_worker(resource_key).await? {
                break name;
            }
            debug!(resource = resource_key, "no worker available; retrying");
            tokio::select! {
                _ = tokio::time::sleep(self.worker_poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(DispatchError::ShuttingDown);
                    }
                }
            }
        };

        // 競合していれば既存の束縛が返ってくるので、そちらに従う
        let bound = self.store.reserve(resource_key, &candidate, task_id).await?;
        let worker = bound.worker_name;
        let queue = dedicated_queue(&worker);
        self.store
            .update_status(task_id, StatusUpdate::default().on_worker(&worker, &queue))
            .await?;
        info!(task_id = %task_id, resource = resource_key, worker = %worker, "reservation bound");

        let asynchronous = envelope.asynchronous;
        let dispatched = self
            .broker
            .publish(&queue, BrokerMessage::Execute(envelope))
            .await;
        let released = self
            .broker
            .publish(
                &queue,
                BrokerMessage::Release {
                    resource_key: resource_key.to_string(),
                    task_id,
                    asynchronous,
                },
            )
            .await;
        dispatched?;
        released?;
        Ok(Some(worker))
    }
}
