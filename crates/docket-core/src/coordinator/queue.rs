//! TaskQueue - coordinator 側の live task 集合
//!
//! # 状態
//! - waiting: 受理済みだがまだ dispatch していない（blocking が残っている）
//! - running: dispatch 済み。store 上の report が complete になったら dequeue
//! - completed: dequeue 済みの task を一定時間だけ保持（検索 API 用のキャッシュ）
//!
//! # 不変条件
//! - waiting / running に載っている task だけが「live」
//! - enqueue 時に QueuedCall を保存し、dequeue 時に消す（リカバリの入力）
//! - on_enqueue / on_dequeue callback は state のロックを外してから呼ぶ

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::outcome::codes;
use crate::domain::{
    CallReport, CallRequest, CallState, ExecutionError, GroupId, QueuedCall, StatusUpdate, TaskId,
};
use crate::error::DispatchError;
use crate::ports::{Clock, LifeCycleCallback, Store};

use crate::dispatch::{Dispatch, DispatchTask};

use super::task::Task;

/// What one dispatcher pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: Vec<TaskId>,
    pub dequeued: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<Task>,
    running: Vec<Task>,
    completed: VecDeque<(Instant, Task, CallReport)>,
}

impl QueueState {
    fn is_live(&self, task_id: TaskId) -> bool {
        self.waiting.iter().chain(self.running.iter()).any(|t| t.id() == task_id)
    }

    fn take(&mut self, task_id: TaskId) -> Option<Task> {
        if let Some(pos) = self.waiting.iter().position(|t| t.id() == task_id) {
            return Some(self.waiting.remove(pos));
        }
        if let Some(pos) = self.running.iter().position(|t| t.id() == task_id) {
            return Some(self.running.remove(pos));
        }
        None
    }
}

pub struct TaskQueue {
    store: Arc<dyn Store>,
    dispatch: Arc<DispatchTask>,
    clock: Arc<dyn Clock>,
    completed_task_cache_life: Duration,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn Store>,
        dispatch: Arc<DispatchTask>,
        clock: Arc<dyn Clock>,
        completed_task_cache_life: Duration,
    ) -> Self {
        Self {
            store,
            dispatch,
            clock,
            completed_task_cache_life,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Add an admitted task to the waiting set.
    ///
    /// Blocking ids that are no longer live are dropped. A dropped id the
    /// task declared as a dependency is checked against the state it ended
    /// in, and a disallowed state is recorded as a dependency failure.
    pub async fn enqueue(&self, mut task: Task) -> Result<(), DispatchError> {
        let task_id = task.id();
        {
            let mut state = self.state.lock().await;
            let blocking = std::mem::take(&mut task.blocking);
            for blocker in blocking {
                if state.is_live(blocker) {
                    task.blocking.insert(blocker);
                    continue;
                }
                let Some(allowed) = task.allowed_states(blocker).map(<[CallState]>::to_vec) else {
                    continue;
                };
                let ended = match state.completed.iter().find(|(_, t, _)| t.id() == blocker) {
                    Some((_, _, report)) => Some(report.state),
                    None => self
                        .store
                        .get_status(blocker)
                        .await?
                        .filter(CallReport::is_complete)
                        .map(|report| report.state),
                };
                if let Some(ended) = ended
                    && !allowed.contains(&ended)
                {
                    task.dependency_failures.insert(blocker, ended);
                }
            }

            self.store
                .save_queued_call(QueuedCall::new(&task.request, self.clock.now()))
                .await?;
            debug!(
                task_id = %task_id,
                blocking = task.blocking.len(),
                "task enqueued"
            );
            state.waiting.push(task.clone());
        }

        run_hooks(&task.request, &task.request.hooks.on_enqueue, "enqueue").await;
        Ok(())
    }

    /// Remove a task from the live set.
    ///
    /// Dependents waiting on it are unblocked; a dependent that required a
    /// different exit state gets a dependency failure instead. Returns the
    /// removed task, `None` when it was not live.
    pub async fn dequeue(&self, task_id: TaskId) -> Result<Option<Task>, DispatchError> {
        let report = self.store.get_status(task_id).await?;
        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.take(task_id) else {
                return Ok(None);
            };

            // 完了していない（timeout で外された等）なら依存側は単に unblock
            let ended = report.as_ref().map(|r| r.state).filter(|s| s.is_complete());
            for dependent in state.waiting.iter_mut() {
                if !dependent.blocking.remove(&task_id) {
                    continue;
                }
                let Some(ended) = ended else {
                    continue;
                };
                let disallowed = dependent
                    .allowed_states(task_id)
                    .is_some_and(|allowed| !allowed.contains(&ended));
                if disallowed {
                    dependent.dependency_failures.insert(task_id, ended);
                }
            }

            if let Some(report) = report {
                state.completed.push_back((Instant::now(), task.clone(), report));
            }
            task
        };

        self.store.remove_queued_call(task_id).await?;
        run_hooks(&task.request, &task.request.hooks.on_dequeue, "dequeue").await;
        debug!(task_id = %task_id, "task dequeued");
        Ok(Some(task))
    }

    /// One dispatcher pass.
    pub async fn tick(&self) -> Result<TickSummary, DispatchError> {
        let mut summary = TickSummary::default();

        // 1. complete になったもの（running / waiting 両方）を外す
        let live: Vec<TaskId> = {
            let state = self.state.lock().await;
            state
                .running
                .iter()
                .chain(state.waiting.iter())
                .map(Task::id)
                .collect()
        };
        for report in self.store.get_statuses(&live).await? {
            if report.is_complete() && self.dequeue(report.task_id).await?.is_some() {
                summary.dequeued.push(report.task_id);
            }
        }

        // 2. 前提条件を満たせなかったものを skip
        let failed: Vec<(TaskId, BTreeMap<TaskId, CallState>)> = {
            let state = self.state.lock().await;
            state
                .waiting
                .iter()
                .filter(|t| !t.dependency_failures.is_empty())
                .map(|t| (t.id(), t.dependency_failures.clone()))
                .collect()
        };
        for (task_id, failures) in failed {
            let mut update = StatusUpdate::state(CallState::Skipped).finished_at(self.clock.now());
            update.dependency_failures = Some(failures);
            self.store
                .update_status_unless(task_id, &CallState::COMPLETE, update)
                .await?;
            info!(task_id = %task_id, "task skipped: prerequisite ended in a disallowed state");
            if self.dequeue(task_id).await?.is_some() {
                summary.skipped.push(task_id);
            }
        }

        // 3. blocking が空になったものを dispatch
        let ready: Vec<Task> = {
            let mut state = self.state.lock().await;
            let (ready, still_waiting): (Vec<Task>, Vec<Task>) = std::mem::take(&mut state.waiting)
                .into_iter()
                .partition(|t| !t.is_blocked() && t.dependency_failures.is_empty());
            state.waiting = still_waiting;
            state.running.extend(ready.iter().cloned());
            ready
        };
        for task in ready {
            let task_id = task.id();
            match self.dispatch_task(&task).await {
                Ok(()) => summary.dispatched.push(task_id),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "dispatch failed");
                    let failure = ExecutionError::new(codes::EXECUTION_FAILED, e.to_string());
                    self.dispatch.on_failure(task_id, failure).await?;
                }
            }
        }

        self.purge_completed().await;
        Ok(summary)
    }

    async fn dispatch_task(&self, task: &Task) -> Result<(), DispatchError> {
        let envelope = task.envelope();
        match task.reservation_target() {
            Some((resource_type, resource_id, _)) => {
                info!(task_id = %task.id(), resource_type, resource_id, "dispatching with reservation");
                self.dispatch
                    .apply_async_with_reservation(resource_type, resource_id, envelope)
                    .await
            }
            None => {
                info!(task_id = %task.id(), "dispatching");
                self.dispatch.apply_async(envelope).await
            }
        }
    }

    /// Drop completed tasks older than the cache life.
    pub async fn purge_completed(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.completed.len();
        let life = self.completed_task_cache_life;
        state.completed.retain(|(at, _, _)| at.elapsed() < life);
        before - state.completed.len()
    }

    /// Call `tick` every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
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
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "dispatcher pass failed");
                    }
                }
            }
        }
        debug!("dispatcher loop stopped");
    }

    pub async fn get(&self, task_id: TaskId) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.running.iter())
            .find(|t| t.id() == task_id)
            .cloned()
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.state.lock().await.is_live(task_id)
    }

    /// Waiting tasks first, then running ones.
    pub async fn live_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.running.iter())
            .cloned()
            .collect()
    }

    pub async fn group_tasks(&self, group_id: GroupId) -> Vec<Task> {
        self.live_tasks()
            .await
            .into_iter()
            .filter(|t| t.group_id() == Some(group_id))
            .collect()
    }

    /// Recently completed tasks still in the cache, oldest first.
    pub async fn completed_tasks(&self) -> Vec<(Task, CallReport)> {
        let state = self.state.lock().await;
        state
            .completed
            .iter()
            .map(|(_, task, report)| (task.clone(), report.clone()))
            .collect()
    }
}

async fn run_hooks(request: &CallRequest, hooks: &[Arc<dyn LifeCycleCallback>], phase: &str) {
    for hook in hooks {
        if let Err(e) = hook.call(request).await {
            warn!(task_id = %request.id, hook = hook.name(), phase, error = %e, "life-cycle callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OperationRegistry;
    use crate::domain::{CallName, CallRequest, TaskEnvelope};
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::{
        DEFAULT_QUEUE, HookError, QueuedCallStore, RESOURCE_MANAGER_QUEUE, StatusStore, SystemClock,
    };
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        queue: TaskQueue,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let dispatch = Arc::new(DispatchTask::new(
            store.clone(),
            broker.clone(),
            Arc::new(SystemClock),
            Arc::new(OperationRegistry::new()),
        ));
        let queue = TaskQueue::new(
            store.clone(),
            dispatch,
            Arc::new(SystemClock),
            Duration::from_secs(20),
        );
        Fixture {
            store,
            broker,
            queue,
        }
    }

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    async fn submit(f: &Fixture, request: CallRequest, blocking: &[TaskId]) -> TaskId {
        let task_id = request.id;
        f.store
            .insert_status_if_absent(CallReport::waiting(&request))
            .await
            .unwrap();
        let mut task = Task::new(request);
        task.blocking = blocking.iter().copied().collect();
        f.queue.enqueue(task).await.unwrap();
        task_id
    }

    async fn finish(f: &Fixture, task_id: TaskId, state: CallState) {
        f.store
            .update_status(task_id, StatusUpdate::state(state))
            .await
            .unwrap();
    }

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LifeCycleCallback for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn call(&self, _request: &CallRequest) -> Result<(), HookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HookError::new("counting", "callbacks may fail without stopping the queue"))
        }
    }

    #[tokio::test]
    async fn unblocked_tasks_are_dispatched() {
        let f = fixture();
        let plain = submit(&f, CallRequest::new(id(), CallName::RepoCreate), &[]).await;
        let pinned = submit(
            &f,
            CallRequest::new(id(), CallName::RepoSync).syncs_resource("repository", "repo-1"),
            &[],
        )
        .await;

        let summary = f.queue.tick().await.unwrap();

        assert_eq!(summary.dispatched, vec![plain, pinned]);
        assert_eq!(f.broker.depth(DEFAULT_QUEUE).await, 1);
        assert_eq!(f.broker.depth(RESOURCE_MANAGER_QUEUE).await, 1);
        assert!(f.queue.contains(plain).await);
    }

    #[tokio::test]
    async fn blocked_task_waits_for_its_blocker() {
        let f = fixture();
        let first = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;
        let second = submit(&f, CallRequest::new(id(), CallName::RepoPublish), &[first]).await;

        let summary = f.queue.tick().await.unwrap();
        assert_eq!(summary.dispatched, vec![first]);

        finish(&f, first, CallState::Finished).await;
        let summary = f.queue.tick().await.unwrap();
        assert_eq!(summary.dequeued, vec![first]);
        assert_eq!(summary.dispatched, vec![second]);
    }

    #[tokio::test]
    async fn stale_blockers_are_dropped_on_enqueue() {
        let f = fixture();
        let gone = id();
        let task_id = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[gone]).await;

        let task = f.queue.get(task_id).await.unwrap();
        assert!(task.blocking.is_empty());
    }

    #[tokio::test]
    async fn disallowed_exit_state_skips_the_dependent() {
        let f = fixture();
        let first = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;
        let request = CallRequest::new(id(), CallName::RepoPublish)
            .depends_on_states(first, vec![CallState::Finished]);
        let second = submit(&f, request, &[first]).await;
        f.queue.tick().await.unwrap();

        finish(&f, first, CallState::Error).await;
        let summary = f.queue.tick().await.unwrap();

        assert_eq!(summary.skipped, vec![second]);
        assert!(summary.dispatched.is_empty());
        let report = f.store.get_status(second).await.unwrap().unwrap();
        assert_eq!(report.state, CallState::Skipped);
        assert_eq!(report.dependency_failures[&first], CallState::Error);
        assert!(!f.queue.contains(second).await);
    }

    #[tokio::test]
    async fn dependency_on_an_already_completed_call_is_checked() {
        let f = fixture();
        let first = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;
        finish(&f, first, CallState::Canceled).await;
        f.queue.tick().await.unwrap();

        let request = CallRequest::new(id(), CallName::RepoPublish)
            .depends_on_states(first, vec![CallState::Finished]);
        let second = submit(&f, request, &[first]).await;

        let task = f.queue.get(second).await.unwrap();
        assert_eq!(task.dependency_failures[&first], CallState::Canceled);
    }

    #[tokio::test]
    async fn canceled_waiting_tasks_are_dequeued() {
        let f = fixture();
        let blocker = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;
        let waiting = submit(&f, CallRequest::new(id(), CallName::RepoDelete), &[blocker]).await;
        finish(&f, waiting, CallState::Canceled).await;

        let summary = f.queue.tick().await.unwrap();

        assert_eq!(summary.dequeued, vec![waiting]);
        let completed: Vec<TaskId> = f
            .queue
            .completed_tasks()
            .await
            .into_iter()
            .map(|(t, _)| t.id())
            .collect();
        assert_eq!(completed, vec![waiting]);
    }

    #[tokio::test]
    async fn queued_calls_follow_the_live_set() {
        let f = fixture();
        let task_id = submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;
        assert_eq!(f.store.queued_calls().await.unwrap().len(), 1);

        f.queue.dequeue(task_id).await.unwrap();
        assert!(f.store.queued_calls().await.unwrap().is_empty());
        assert!(f.queue.dequeue(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hooks_run_on_enqueue_and_dequeue_even_when_failing() {
        let f = fixture();
        let hook = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let request = CallRequest::new(id(), CallName::RepoSync)
            .on_enqueue(hook.clone())
            .on_dequeue(hook.clone());
        let task_id = submit(&f, request, &[]).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        f.queue.dequeue(task_id).await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completed_cache_expires() {
        let store = Arc::new(InMemoryStore::new());
        let dispatch = Arc::new(DispatchTask::new(
            store.clone(),
            Arc::new(InMemoryBroker::new()),
            Arc::new(SystemClock),
            Arc::new(OperationRegistry::new()),
        ));
        let queue = TaskQueue::new(store.clone(), dispatch, Arc::new(SystemClock), Duration::ZERO);
        let request = CallRequest::new(id(), CallName::RepoSync);
        store
            .insert_status_if_absent(CallReport::waiting(&request))
            .await
            .unwrap();
        let task_id = request.id;
        queue.enqueue(Task::new(request)).await.unwrap();
        queue.dequeue(task_id).await.unwrap();

        assert_eq!(queue.purge_completed().await, 1);
        assert!(queue.completed_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn group_tasks_filters_by_group() {
        let f = fixture();
        let group = GroupId::from_ulid(Ulid::new());
        let mut grouped = CallRequest::new(id(), CallName::RepoSync);
        grouped.group_id = Some(group);
        let member = submit(&f, grouped, &[]).await;
        submit(&f, CallRequest::new(id(), CallName::RepoSync), &[]).await;

        let members: BTreeSet<TaskId> = f.queue.group_tasks(group).await.iter().map(Task::id).collect();
        assert_eq!(members, BTreeSet::from([member]));
    }

    #[tokio::test]
    async fn envelope_carries_the_request_payload() {
        let request = CallRequest::new(id(), CallName::ContentUpload)
            .with_arg(serde_json::json!("unit.rpm"))
            .with_kwarg("repo", serde_json::json!("repo-1"))
            .asynchronous();
        let task = Task::new(request.clone());
        let envelope: TaskEnvelope = task.envelope();

        assert_eq!(envelope.args, request.args);
        assert_eq!(envelope.kwargs, request.kwargs);
        assert!(envelope.asynchronous);
    }
}
