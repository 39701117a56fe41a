//! DispatchTask - 任意の処理を「配送可能な単位」として包む
//!
//! # 配送モード
//! - **apply**: その場で実行（inline）。running への遷移は書かない
//! - **apply_async**: waiting を insert-if-absent してから DEFAULT_QUEUE へ
//! - **apply_async_with_reservation**: `type:id` の予約キーを付けて resource manager へ
//!
//! # 状態遷移の保護
//! - waiting の書き込みは insert-if-absent。worker が先に running を書いても潰さない
//! - 成功時は complete でない場合だけ finished にする（cancel 済みを生き返らせない）
//! - 失敗時も complete でない場合だけ error にする（error の中身は常に正規化して組み立てる）
//! - cancel は revoke した上で「complete でなければ canceled」の条件付き更新

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::outcome::codes;
use crate::domain::{
    BrokerMessage, CallReport, CallState, ExecutionError, StatusUpdate, TaskEnvelope, TaskId,
    TaskResult, reservation_key,
};
use crate::error::DispatchError;
use crate::ports::{Broker, Clock, DEFAULT_QUEUE, RESOURCE_MANAGER_QUEUE, Store};

use super::handler::OperationRegistry;

/// Common interface of a dispatchable unit of work.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Run inline and return the final report.
    async fn apply(&self, envelope: TaskEnvelope) -> Result<CallReport, DispatchError>;

    async fn apply_async(&self, envelope: TaskEnvelope) -> Result<(), DispatchError>;

    /// Dispatch so that every call on `resource_type:resource_id` runs on the
    /// one worker bound to that key.
    async fn apply_async_with_reservation(
        &self,
        resource_type: &str,
        resource_id: &str,
        envelope: TaskEnvelope,
    ) -> Result<(), DispatchError>;

    async fn on_success(
        &self,
        task_id: TaskId,
        result: TaskResult,
    ) -> Result<Option<CallReport>, DispatchError>;

    async fn on_failure(
        &self,
        task_id: TaskId,
        error: ExecutionError,
    ) -> Result<Option<CallReport>, DispatchError>;

    /// Cancel a call. `Ok(true)` also covers an already complete call.
    async fn cancel(&self, task_id: TaskId) -> Result<bool, DispatchError>;
}

pub struct DispatchTask {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    registry: Arc<OperationRegistry>,
}

impl DispatchTask {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Worker-side start of an invocation.
    ///
    /// Returns `false` when the call must not run: it was canceled (or
    /// otherwise completed) before reaching the worker, or revoked.
    pub async fn begin(
        &self,
        envelope: &TaskEnvelope,
        worker_name: &str,
        queue: &str,
    ) -> Result<bool, DispatchError> {
        let task_id = envelope.task_id;
        self.store
            .insert_status_if_absent(CallReport::for_envelope(envelope))
            .await?;

        if self.broker.is_revoked(task_id).await {
            debug!(task_id = %task_id, "skipping revoked call");
            return Ok(false);
        }

        let update = StatusUpdate::state(CallState::Running)
            .started_at(self.clock.now())
            .on_worker(worker_name, queue);
        let started = self
            .store
            .update_status_unless(task_id, &CallState::COMPLETE, update)
            .await?;
        if started.is_none() {
            debug!(task_id = %task_id, "skipping call that completed before it started");
            return Ok(false);
        }
        info!(task_id = %task_id, call_name = %envelope.call_name, worker = worker_name, "call running");
        Ok(true)
    }

    /// Drop the worker binding of `task_id` after its work ran.
    ///
    /// A synchronous call still marked running at this point never recorded
    /// an outcome; it is failed before the binding goes away.
    pub async fn release_resource(
        &self,
        resource_key: &str,
        task_id: TaskId,
        asynchronous: bool,
    ) -> Result<(), DispatchError> {
        if !asynchronous {
            let still_running = self
                .store
                .get_status(task_id)
                .await?
                .is_some_and(|status| status.state == CallState::Running);
            if still_running {
                let error = ExecutionError::new(
                    codes::EXITED_IMMEDIATELY,
                    format!("{task_id} exited before recording an outcome"),
                );
                warn!(task_id = %task_id, "call still running at release; marking error");
                self.store
                    .update_status_unless(
                        task_id,
                        &CallState::COMPLETE,
                        StatusUpdate::state(CallState::Error)
                            .finished_at(self.clock.now())
                            .with_error(error),
                    )
                    .await?;
            }
        }

        let deleted = self.store.release(resource_key, task_id).await?;
        debug!(task_id = %task_id, resource = resource_key, deleted, "reservation released");
        Ok(())
    }
}

#[async_trait]
impl Dispatch for DispatchTask {
    async fn apply(&self, envelope: TaskEnvelope) -> Result<CallReport, DispatchError> {
        let task_id = envelope.task_id;
        self.store
            .insert_status_if_absent(CallReport::for_envelope(&envelope))
            .await?;

        let current = self
            .store
            .get_status(task_id)
            .await?
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))?;
        if current.state == CallState::Canceled {
            return Ok(current);
        }

        let outcome = self.registry.execute(&envelope).await;
        let report = match outcome {
            Ok(result) => self.on_success(task_id, result).await?,
            Err(error) => self.on_failure(task_id, error).await?,
        };
        match report {
            Some(report) => Ok(report),
            None => self
                .store
                .get_status(task_id)
                .await?
                .ok_or_else(|| DispatchError::MissingResource(task_id.to_string())),
        }
    }

    async fn apply_async(&self, envelope: TaskEnvelope) -> Result<(), DispatchError> {
        let task_id = envelope.task_id;
        self.store
            .insert_status_if_absent(CallReport::for_envelope(&envelope))
            .await?;
        self.broker
            .publish(DEFAULT_QUEUE, BrokerMessage::Execute(envelope))
            .await?;
        debug!(task_id = %task_id, queue = DEFAULT_QUEUE, "call dispatched");
        Ok(())
    }

    async fn apply_async_with_reservation(
        &self,
        resource_type: &str,
        resource_id: &str,
        envelope: TaskEnvelope,
    ) -> Result<(), DispatchError> {
        let task_id = envelope.task_id;
        let resource_key = reservation_key(resource_type, resource_id);
        self.store
            .insert_status_if_absent(CallReport::for_envelope(&envelope))
            .await?;
        self.broker
            .publish(
                RESOURCE_MANAGER_QUEUE,
                BrokerMessage::Reserve {
                    resource_key: resource_key.clone(),
                    envelope,
                },
            )
            .await?;
        debug!(task_id = %task_id, resource = %resource_key, "call handed to resource manager");
        Ok(())
    }

    async fn on_success(
        &self,
        task_id: TaskId,
        result: TaskResult,
    ) -> Result<Option<CallReport>, DispatchError> {
        let mut update = StatusUpdate::state(CallState::Finished)
            .finished_at(self.clock.now())
            .with_result(result.result);
        if let Some(secondary) = result.error {
            update = update.with_error(secondary);
        }
        if !result.spawned_tasks.is_empty() {
            update.spawned_tasks = Some(result.spawned_tasks);
        }

        let report = self
            .store
            .update_status_unless(task_id, &CallState::COMPLETE, update)
            .await?;
        match &report {
            Some(_) => info!(task_id = %task_id, "call finished"),
            None => debug!(task_id = %task_id, "success arrived after the call completed"),
        }
        Ok(report)
    }

    async fn on_failure(
        &self,
        task_id: TaskId,
        error: ExecutionError,
    ) -> Result<Option<CallReport>, DispatchError> {
        let update = StatusUpdate::state(CallState::Error)
            .finished_at(self.clock.now())
            .with_error(error.clone());
        // canceled / skipped を error で上書きしない
        let report = self
            .store
            .update_status_unless(task_id, &CallState::COMPLETE, update)
            .await?;
        match &report {
            Some(_) => warn!(task_id = %task_id, error = %error, "call failed"),
            None => debug!(task_id = %task_id, error = %error, "failure arrived after the call completed"),
        }
        Ok(report)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<bool, DispatchError> {
        let status = self
            .store
            .get_status(task_id)
            .await?
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))?;
        if status.is_complete() {
            debug!(task_id = %task_id, state = %status.state, "cancel of a complete call is a no-op");
            return Ok(true);
        }

        self.broker.revoke(task_id, true).await?;
        let canceled = self
            .store
            .update_status_unless(
                task_id,
                &CallState::COMPLETE,
                StatusUpdate::state(CallState::Canceled).finished_at(self.clock.now()),
            )
            .await?;
        if canceled.is_some() {
            info!(task_id = %task_id, "call canceled");
        } else {
            debug!(task_id = %task_id, "call completed while being canceled");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::handler_fn;
    use crate::domain::CallName;
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::{ReservationStore, StatusStore, SystemClock};
    use std::time::Duration;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        dispatch: DispatchTask,
    }

    fn fixture() -> Fixture {
        let mut registry = OperationRegistry::new();
        registry
            .register(
                CallName::RepoSync,
                handler_fn(|_call: TaskEnvelope| async {
                    Ok(TaskResult::value(serde_json::json!("synced")))
                }),
            )
            .unwrap();
        registry
            .register(
                CallName::RepoDelete,
                handler_fn(|_call: TaskEnvelope| async {
                    Err(ExecutionError::new("repo_busy", "repository is locked"))
                }),
            )
            .unwrap();

        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let dispatch = DispatchTask::new(
            store.clone(),
            broker.clone(),
            Arc::new(SystemClock),
            Arc::new(registry),
        );
        Fixture {
            store,
            broker,
            dispatch,
        }
    }

    fn envelope(call_name: CallName) -> TaskEnvelope {
        TaskEnvelope::new(TaskId::from_ulid(Ulid::new()), call_name)
    }

    #[tokio::test]
    async fn apply_runs_inline_and_records_the_result() {
        let f = fixture();
        let report = f.dispatch.apply(envelope(CallName::RepoSync)).await.unwrap();

        assert_eq!(report.state, CallState::Finished);
        assert_eq!(report.result, Some(serde_json::json!("synced")));
        assert!(report.finish_time.is_some());
        // inline 実行は running を経由しない
        assert!(report.start_time.is_none());
    }

    #[tokio::test]
    async fn apply_records_handler_failures() {
        let f = fixture();
        let report = f.dispatch.apply(envelope(CallName::RepoDelete)).await.unwrap();

        assert_eq!(report.state, CallState::Error);
        assert_eq!(report.error.unwrap().code, "repo_busy");
    }

    #[tokio::test]
    async fn apply_async_writes_waiting_and_publishes() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call).await.unwrap();

        let status = f.store.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Waiting);
        assert_eq!(f.broker.depth(DEFAULT_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn reservation_dispatch_goes_to_the_resource_manager() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch
            .apply_async_with_reservation("repository", "repo-1", call)
            .await
            .unwrap();

        let (queue, message) = f
            .broker
            .consume(&[RESOURCE_MANAGER_QUEUE.to_string()], Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue, RESOURCE_MANAGER_QUEUE);
        match message {
            BrokerMessage::Reserve {
                resource_key,
                envelope,
            } => {
                assert_eq!(resource_key, "repository:repo-1");
                assert_eq!(envelope.task_id, task_id);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_success_does_not_resurrect_a_canceled_call() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call.clone()).await.unwrap();
        assert!(f.dispatch.begin(&call, "worker-1", DEFAULT_QUEUE).await.unwrap());

        assert!(f.dispatch.cancel(task_id).await.unwrap());
        let late = f
            .dispatch
            .on_success(task_id, TaskResult::value(serde_json::json!(1)))
            .await
            .unwrap();

        assert!(late.is_none());
        let status = f.store.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Canceled);
        assert!(f.broker.is_revoked(task_id).await);
    }

    #[tokio::test]
    async fn late_failure_does_not_overwrite_a_canceled_call() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call.clone()).await.unwrap();
        assert!(f.dispatch.begin(&call, "worker-1", DEFAULT_QUEUE).await.unwrap());

        assert!(f.dispatch.cancel(task_id).await.unwrap());
        let late = f
            .dispatch
            .on_failure(task_id, ExecutionError::new("late", "handler failed after revoke"))
            .await
            .unwrap();

        assert!(late.is_none());
        let status = f.store.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Canceled);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_after_completion() {
        let f = fixture();
        let report = f.dispatch.apply(envelope(CallName::RepoSync)).await.unwrap();

        assert!(f.dispatch.cancel(report.task_id).await.unwrap());
        assert!(f.dispatch.cancel(report.task_id).await.unwrap());

        let status = f.store.get_status(report.task_id).await.unwrap().unwrap();
        assert_eq!(status, report);
        assert!(!f.broker.is_revoked(report.task_id).await);
    }

    #[tokio::test]
    async fn cancel_of_unknown_call_is_missing_resource() {
        let f = fixture();
        let err = f
            .dispatch
            .cancel(TaskId::from_ulid(Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingResource(_)));
    }

    #[tokio::test]
    async fn begin_skips_canceled_calls() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        f.dispatch.apply_async(call.clone()).await.unwrap();
        f.dispatch.cancel(call.task_id).await.unwrap();

        assert!(!f.dispatch.begin(&call, "worker-1", DEFAULT_QUEUE).await.unwrap());
    }

    #[tokio::test]
    async fn success_folds_secondary_errors_and_spawned_calls() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call.clone()).await.unwrap();
        f.dispatch.begin(&call, "worker-1", DEFAULT_QUEUE).await.unwrap();

        let spawned = TaskId::from_ulid(Ulid::new());
        let result = TaskResult::value(serde_json::json!({ "units": 3 }))
            .with_error(ExecutionError::new("partial", "one unit failed"))
            .with_spawned(spawned);
        let report = f.dispatch.on_success(task_id, result).await.unwrap().unwrap();

        assert_eq!(report.state, CallState::Finished);
        assert_eq!(report.error.unwrap().code, "partial");
        assert_eq!(report.spawned_tasks, vec![spawned]);
    }

    #[tokio::test]
    async fn release_fails_a_call_that_never_recorded_an_outcome() {
        let f = fixture();
        let call = envelope(CallName::RepoSync);
        let task_id = call.task_id;
        f.dispatch.apply_async(call.clone()).await.unwrap();
        f.store.reserve("repository:repo-1", "worker-1", task_id).await.unwrap();
        f.dispatch.begin(&call, "worker-1", "worker-1.dq").await.unwrap();

        f.dispatch
            .release_resource("repository:repo-1", task_id, false)
            .await
            .unwrap();

        let status = f.store.get_status(task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Error);
        assert_eq!(status.error.unwrap().code, codes::EXITED_IMMEDIATELY);
        assert!(f.store.find_reservation("repository:repo-1").await.unwrap().is_none());
    }
}
