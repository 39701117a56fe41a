//! Coordinator - 呼び出しの受付・衝突判定・キュー投入・問い合わせ
//!
//! # 受付フロー
//! 1. AdmissionLock を取る
//! 2. ConflictResolver で accepted / postponed / rejected を決める
//! 3. rejected ならレポートだけ返す（store には書かない）
//! 4. それ以外は report / TaskResource / hooks を確定して TaskQueue に enqueue
//! 5. ロックを外してから、必要なら完了を待つ
//!
//! 2 と 4 をロックの内側で行うことで、同時に来た二つの呼び出しが両方とも
//! 「衝突なし」と判定することはない。

pub mod callbacks;
pub mod criteria;
pub mod dependency;
pub mod queue;
pub mod task;
pub mod wait;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::conflict::{ConflictResolver, OperationMatrix, Resolution};
use crate::dispatch::{Dispatch, DispatchTask};
use crate::domain::{
    CallName, CallReport, CallRequest, CallState, ExecutionError, GroupId, Response, StatusUpdate,
    TaskId, TaskResource, TaskResult,
};
use crate::error::DispatchError;
use crate::ports::{AdmissionLock, Clock, IdGenerator, PermissionManager, Store};

pub use self::callbacks::{GrantPermissions, ReleaseTaskResources, RevokePermissions};
pub use self::criteria::{RECOGNIZED_KEYS, SearchCriteria};
pub use self::dependency::{DependencyGraph, resolve_dependencies};
pub use self::queue::{TaskQueue, TickSummary};
pub use self::task::{Task, TaskKind};
pub use self::wait::wait_for_task;

/// Everything a coordinator is wired with.
pub struct CoordinatorParts {
    pub store: Arc<dyn Store>,
    pub dispatch: Arc<DispatchTask>,
    pub queue: Arc<TaskQueue>,
    pub matrix: OperationMatrix,
    pub lock: Arc<dyn AdmissionLock>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub permissions: Arc<dyn PermissionManager>,
    pub task_state_poll_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

/// What `start()` did with the durably queued calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub cleared_task_resources: usize,
    /// Resubmitted calls, in the order they were replayed.
    pub resubmitted: Vec<TaskId>,
    /// Calls that had already completed and were dropped.
    pub already_complete: Vec<TaskId>,
    /// Groups that could not be replayed (cycles, store errors).
    pub failed_groups: Vec<GroupId>,
}

/// When the caller waits for the call to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Never,
    WhenAccepted,
    UnlessRejected,
}

impl Wait {
    fn applies_to(self, response: Option<Response>) -> bool {
        match self {
            Wait::Never => false,
            Wait::WhenAccepted => response == Some(Response::Accepted),
            Wait::UnlessRejected => response != Some(Response::Rejected),
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    dispatch: Arc<DispatchTask>,
    queue: Arc<TaskQueue>,
    resolver: ConflictResolver,
    lock: Arc<dyn AdmissionLock>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    permissions: Arc<dyn PermissionManager>,
    task_state_poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let resolver = ConflictResolver::new(parts.matrix, parts.store.clone());
        Self {
            store: parts.store,
            dispatch: parts.dispatch,
            queue: parts.queue,
            resolver,
            lock: parts.lock,
            ids: parts.ids,
            clock: parts.clock,
            permissions: parts.permissions,
            task_state_poll_interval: parts.task_state_poll_interval,
            shutdown: parts.shutdown,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn matrix(&self) -> &OperationMatrix {
        self.resolver.matrix()
    }

    /// New request with a freshly generated id.
    pub fn call_request(&self, call_name: CallName) -> CallRequest {
        CallRequest::new(self.ids.generate_task_id(), call_name)
    }

    // ------------------------------------------------------------------
    // 実行
    // ------------------------------------------------------------------

    /// Run one call. Synchronous calls that were accepted outright are
    /// waited for; everything else returns as soon as it is queued.
    pub async fn execute_call(&self, request: CallRequest) -> Result<CallReport, DispatchError> {
        let task = Task::new(request);
        let wait = match task.kind() {
            TaskKind::Synchronous => Wait::WhenAccepted,
            TaskKind::Asynchronous => Wait::Never,
        };
        self.run_task(task, wait, None).await
    }

    /// Queue the call and wait for it to complete unless it was rejected.
    ///
    /// On timeout the task is taken off the live queue before the error is
    /// returned.
    pub async fn execute_call_synchronously(
        &self,
        request: CallRequest,
        timeout: Option<Duration>,
    ) -> Result<CallReport, DispatchError> {
        if request.asynchronous {
            return Err(DispatchError::AsynchronousExecution(request.id));
        }
        self.run_task(Task::new(request), Wait::UnlessRejected, timeout)
            .await
    }

    pub async fn execute_call_asynchronously(
        &self,
        request: CallRequest,
    ) -> Result<CallReport, DispatchError> {
        self.run_task(Task::new(request), Wait::Never, None).await
    }

    /// Submit a batch under one new group id.
    ///
    /// Calls are queued in dependency order. A cycle fails the whole batch
    /// before anything is stored, and so does a rejection of any member:
    /// every report then comes back rejected.
    pub async fn execute_multiple_calls(
        &self,
        requests: Vec<CallRequest>,
    ) -> Result<Vec<CallReport>, DispatchError> {
        let group_id = self.ids.generate_group_id();
        self.submit_group(group_id, requests).await
    }

    async fn submit_group(
        &self,
        group_id: GroupId,
        requests: Vec<CallRequest>,
    ) -> Result<Vec<CallReport>, DispatchError> {
        let tasks: Vec<Task> = requests
            .into_iter()
            .map(|mut request| {
                request.group_id = Some(group_id);
                Task::new(request)
            })
            .collect();
        let ordered = resolve_dependencies(tasks)?;
        info!(group_id = %group_id, calls = ordered.len(), "submitting call group");
        self.admit(ordered).await
    }

    async fn run_task(
        &self,
        task: Task,
        wait: Wait,
        timeout: Option<Duration>,
    ) -> Result<CallReport, DispatchError> {
        let task_id = task.id();
        let report = self
            .admit(vec![task])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))?;

        if !wait.applies_to(report.response) {
            return Ok(report);
        }

        let waited = wait_for_task(
            &self.store,
            task_id,
            &CallState::COMPLETE,
            self.task_state_poll_interval,
            timeout,
            self.shutdown.clone(),
        )
        .await;
        match waited {
            Err(DispatchError::OperationTimedOut { task_id, waited }) => {
                warn!(task_id = %task_id, waited_ms = waited.as_millis() as u64, "gave up waiting for call");
                self.queue.dequeue(task_id).await?;
                Err(DispatchError::OperationTimedOut { task_id, waited })
            }
            other => other,
        }
    }

    /// Conflict check and commit for a batch, atomically with respect to
    /// every other admission.
    async fn admit(&self, tasks: Vec<Task>) -> Result<Vec<CallReport>, DispatchError> {
        let _permit = self.lock.acquire().await;

        // 1. 判定（まだ何も書かない）。同じバッチの先行分も保持中として扱う
        let mut pending: Vec<TaskResource> = Vec::new();
        let mut decided: Vec<(Task, Resolution)> = Vec::with_capacity(tasks.len());
        for task in tasks {
            let resolution = self
                .resolver
                .find_conflicts_with(task.id(), &task.request.resources, &pending)
                .await?;
            if resolution.response != Response::Rejected {
                pending.extend(resolution.task_resources.iter().cloned());
            }
            decided.push((task, resolution));
        }

        // 2. 一つでも rejected なら全部 rejected、何も enqueue しない
        if decided
            .iter()
            .any(|(_, r)| r.response == Response::Rejected)
        {
            return Ok(decided
                .into_iter()
                .map(|(task, resolution)| {
                    info!(
                        task_id = %task.id(),
                        call_name = %task.request.call_name,
                        reasons = resolution.reasons.len(),
                        "call rejected"
                    );
                    let mut report = CallReport::waiting(&task.request);
                    report.response = Some(Response::Rejected);
                    if resolution.response == Response::Rejected {
                        report.reasons = resolution.reasons;
                    }
                    report
                })
                .collect());
        }

        // 3. commit
        let mut reports = Vec::with_capacity(decided.len());
        for (mut task, resolution) in decided {
            let mut report = CallReport::waiting(&task.request);
            report.response = Some(resolution.response);
            report.reasons = resolution.reasons;

            task.blocking.extend(resolution.blocking.iter().copied());
            // 単発の呼び出しでも宣言された依存は待つ（live でなければ enqueue 時に落ちる）
            let declared: Vec<TaskId> = task.request.dependencies.keys().copied().collect();
            task.blocking.extend(declared);
            self.attach_callbacks(&mut task.request);

            self.store.insert_status_if_absent(report.clone()).await?;
            if !resolution.task_resources.is_empty() {
                self.store
                    .insert_task_resources(resolution.task_resources)
                    .await?;
            }
            info!(
                task_id = %task.id(),
                call_name = %task.request.call_name,
                response = %resolution.response,
                blocking = task.blocking.len(),
                "call queued"
            );
            self.queue.enqueue(task).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn attach_callbacks(&self, request: &mut CallRequest) {
        request
            .hooks
            .on_enqueue
            .push(Arc::new(GrantPermissions::new(self.permissions.clone())));
        request
            .hooks
            .on_dequeue
            .push(Arc::new(RevokePermissions::new(self.permissions.clone())));
        request
            .hooks
            .on_dequeue
            .push(Arc::new(ReleaseTaskResources::new(self.store.clone())));
    }

    // ------------------------------------------------------------------
    // キャンセル
    // ------------------------------------------------------------------

    /// `None` when the call is not live; `Some(false)` when the broker
    /// refused the revoke.
    pub async fn cancel_call(&self, task_id: TaskId) -> Result<Option<bool>, DispatchError> {
        if !self.queue.contains(task_id).await {
            debug!(task_id = %task_id, "cancel of a call that is not live");
            return Ok(None);
        }
        match self.dispatch.cancel(task_id).await {
            Ok(canceled) => Ok(Some(canceled)),
            Err(DispatchError::MissingResource(_)) => Ok(None),
            Err(DispatchError::Broker(e)) => {
                warn!(task_id = %task_id, error = %e, "broker refused to revoke call");
                Ok(Some(false))
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every live call of a group. Empty when none is live.
    pub async fn cancel_multiple_calls(
        &self,
        group_id: GroupId,
    ) -> Result<BTreeMap<TaskId, Option<bool>>, DispatchError> {
        let mut results = BTreeMap::new();
        for task in self.queue.group_tasks(group_id).await {
            let task_id = task.id();
            results.insert(task_id, self.cancel_call(task_id).await?);
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // 問い合わせ
    // ------------------------------------------------------------------

    /// Live tasks plus the recently completed ones, each with its current
    /// report (if any).
    async fn known_tasks(&self) -> Result<Vec<(Task, Option<CallReport>)>, DispatchError> {
        let mut tasks = self.queue.live_tasks().await;
        let mut cached: BTreeMap<TaskId, CallReport> = BTreeMap::new();
        let live: BTreeSet<TaskId> = tasks.iter().map(Task::id).collect();
        for (task, report) in self.queue.completed_tasks().await {
            if !live.contains(&task.id()) && !cached.contains_key(&task.id()) {
                cached.insert(task.id(), report);
                tasks.push(task);
            }
        }

        let ids: Vec<TaskId> = tasks.iter().map(Task::id).collect();
        let mut reports: BTreeMap<TaskId, CallReport> = self
            .store
            .get_statuses(&ids)
            .await?
            .into_iter()
            .map(|r| (r.task_id, r))
            .collect();

        Ok(tasks
            .into_iter()
            .map(|task| {
                let report = reports
                    .remove(&task.id())
                    .or_else(|| cached.remove(&task.id()));
                (task, report)
            })
            .collect())
    }

    pub async fn find_tasks(&self, criteria: &SearchCriteria) -> Result<Vec<Task>, DispatchError> {
        Ok(self
            .known_tasks()
            .await?
            .into_iter()
            .filter(|(task, report)| criteria.matches(task, report.as_ref()))
            .map(|(task, _)| task)
            .collect())
    }

    pub async fn find_call_reports(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<CallReport>, DispatchError> {
        Ok(self
            .known_tasks()
            .await?
            .into_iter()
            .filter(|(task, report)| criteria.matches(task, report.as_ref()))
            .filter_map(|(_, report)| report)
            .collect())
    }

    /// Reports straight from the store, in the order of `task_ids`. Unknown
    /// ids are left out.
    pub async fn get_call_reports_by_ids(
        &self,
        task_ids: &[TaskId],
        include_completed: bool,
    ) -> Result<Vec<CallReport>, DispatchError> {
        Ok(self
            .store
            .get_statuses(task_ids)
            .await?
            .into_iter()
            .filter(|r| include_completed || !r.is_complete())
            .collect())
    }

    // ------------------------------------------------------------------
    // 非同期呼び出しの完了報告
    // ------------------------------------------------------------------

    /// Mark a call finished. A call that already completed keeps its state
    /// and its current report is returned.
    pub async fn complete_call_success(
        &self,
        task_id: TaskId,
        result: Option<Value>,
    ) -> Result<CallReport, DispatchError> {
        self.require_status(task_id).await?;
        let outcome = match result {
            Some(value) => TaskResult::value(value),
            None => TaskResult::empty(),
        };
        match self.dispatch.on_success(task_id, outcome).await? {
            Some(report) => Ok(report),
            None => self.require_status(task_id).await,
        }
    }

    /// Mark a call failed. Like `complete_call_success`, a complete call is
    /// left alone.
    pub async fn complete_call_failure(
        &self,
        task_id: TaskId,
        error: ExecutionError,
    ) -> Result<CallReport, DispatchError> {
        self.require_status(task_id).await?;
        warn!(task_id = %task_id, error = %error, "call reported failure");
        let update = StatusUpdate::state(CallState::Error)
            .finished_at(self.clock.now())
            .with_error(error);
        match self
            .store
            .update_status_unless(task_id, &CallState::COMPLETE, update)
            .await?
        {
            Some(report) => Ok(report),
            None => self.require_status(task_id).await,
        }
    }

    pub async fn report_call_progress(
        &self,
        task_id: TaskId,
        progress: Value,
    ) -> Result<CallReport, DispatchError> {
        let update = StatusUpdate {
            progress: Some(progress),
            ..StatusUpdate::default()
        };
        self.store
            .update_status(task_id, update)
            .await?
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))
    }

    async fn require_status(&self, task_id: TaskId) -> Result<CallReport, DispatchError> {
        self.store
            .get_status(task_id)
            .await?
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))
    }

    // ------------------------------------------------------------------
    // リカバリ
    // ------------------------------------------------------------------

    /// Replay what was queued before a restart.
    ///
    /// TaskResource rows are wiped first. Every persisted queued call is
    /// then resubmitted in timestamp order unless its report is already
    /// complete; a group is resubmitted as a whole at the position of its
    /// earliest member, keeping its group id.
    pub async fn start(&self) -> Result<RecoverySummary, DispatchError> {
        let mut summary = RecoverySummary {
            cleared_task_resources: self.store.clear_task_resources().await?,
            ..RecoverySummary::default()
        };

        let queued = self.store.queued_calls().await?;
        for call in &queued {
            self.store.remove_queued_call(call.task_id).await?;
        }

        let mut replayable = Vec::with_capacity(queued.len());
        for call in queued {
            let complete = self
                .store
                .get_status(call.task_id)
                .await?
                .is_some_and(|r| r.is_complete());
            if complete {
                summary.already_complete.push(call.task_id);
            } else {
                replayable.push(call);
            }
        }

        let mut groups: BTreeMap<GroupId, Vec<CallRequest>> = BTreeMap::new();
        for call in &replayable {
            if let Some(group_id) = call.group_id {
                groups
                    .entry(group_id)
                    .or_default()
                    .push(call.request.clone());
            }
        }

        for call in replayable {
            match call.group_id {
                None => {
                    self.execute_call_asynchronously(call.request).await?;
                    summary.resubmitted.push(call.task_id);
                }
                Some(group_id) => {
                    let Some(requests) = groups.remove(&group_id) else {
                        continue;
                    };
                    let ids: Vec<TaskId> = requests.iter().map(|r| r.id).collect();
                    match self.submit_group(group_id, requests).await {
                        Ok(_) => summary.resubmitted.extend(ids),
                        Err(e) => {
                            warn!(group_id = %group_id, error = %e, "could not replay call group");
                            summary.failed_groups.push(group_id);
                        }
                    }
                }
            }
        }

        info!(
            cleared_task_resources = summary.cleared_task_resources,
            resubmitted = summary.resubmitted.len(),
            already_complete = summary.already_complete.len(),
            failed_groups = summary.failed_groups.len(),
            "recovery finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OperationRegistry;
    use crate::domain::{QueuedCall, ResourceOperation};
    use crate::impls::{InMemoryBroker, InMemoryStore, LocalAdmissionLock};
    use crate::ports::{
        NoopPermissionManager, QueuedCallStore, ResourceStore, StatusStore, SystemClock,
        UlidGenerator,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        coordinator: Coordinator,
        _shutdown: watch::Sender<bool>,
    }

    /// Coordinator without a dispatcher loop: admitted calls stay waiting.
    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatch = Arc::new(DispatchTask::new(
            store.clone(),
            broker,
            clock.clone(),
            Arc::new(OperationRegistry::new()),
        ));
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            dispatch.clone(),
            clock.clone(),
            Duration::from_secs(20),
        ));
        let (tx, rx) = watch::channel(false);
        let coordinator = Coordinator::new(CoordinatorParts {
            store: store.clone(),
            dispatch,
            queue,
            matrix: OperationMatrix::standard(),
            lock: Arc::new(LocalAdmissionLock::new()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock,
            permissions: Arc::new(NoopPermissionManager),
            task_state_poll_interval: Duration::from_millis(10),
            shutdown: rx,
        });
        Fixture {
            store,
            coordinator,
            _shutdown: tx,
        }
    }

    fn sync_repo(f: &Fixture, repo: &str) -> CallRequest {
        f.coordinator
            .call_request(CallName::RepoSync)
            .syncs_resource("repository", repo)
    }

    fn delete_repo(f: &Fixture, repo: &str) -> CallRequest {
        f.coordinator
            .call_request(CallName::RepoDelete)
            .deletes_resource("repository", repo)
    }

    #[tokio::test]
    async fn delete_during_sync_is_rejected_and_not_stored() {
        let f = fixture();
        let sync = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1"))
            .await
            .unwrap();
        assert_eq!(sync.response, Some(Response::Accepted));

        let delete = f
            .coordinator
            .execute_call(delete_repo(&f, "repo-1"))
            .await
            .unwrap();

        assert_eq!(delete.response, Some(Response::Rejected));
        assert_eq!(delete.reasons.len(), 1);
        assert_eq!(delete.reasons[0].resource_id, "repo-1");
        assert_eq!(delete.reasons[0].operation, ResourceOperation::Sync);
        assert!(f.store.get_status(delete.task_id).await.unwrap().is_none());
        assert!(!f.coordinator.queue().contains(delete.task_id).await);
    }

    #[tokio::test]
    async fn postponed_call_is_blocked_by_the_holder() {
        let f = fixture();
        let first = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1"))
            .await
            .unwrap();
        let second = f
            .coordinator
            .execute_call(sync_repo(&f, "repo-1"))
            .await
            .unwrap();

        assert_eq!(second.response, Some(Response::Postponed));
        let task = f.coordinator.queue().get(second.task_id).await.unwrap();
        assert_eq!(task.blocking, BTreeSet::from([first.task_id]));
        let held = f
            .store
            .find_task_resources(&[("repository".to_string(), "repo-1".to_string())])
            .await
            .unwrap();
        assert_eq!(held.len(), 2);
    }

    #[tokio::test]
    async fn one_rejection_rejects_the_whole_group() {
        let f = fixture();
        f.coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1"))
            .await
            .unwrap();

        let reports = f
            .coordinator
            .execute_multiple_calls(vec![
                f.coordinator.call_request(CallName::RepoPublish).publishes_resource("repository", "repo-2"),
                delete_repo(&f, "repo-1"),
            ])
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.response == Some(Response::Rejected)));
        assert!(reports.iter().all(|r| r.task_group_id.is_some()));
        for report in &reports {
            assert!(!f.coordinator.queue().contains(report.task_id).await);
        }
    }

    #[tokio::test]
    async fn group_members_conflict_with_each_other() {
        let f = fixture();
        let sync = sync_repo(&f, "repo-1");
        let publish = f
            .coordinator
            .call_request(CallName::RepoPublish)
            .publishes_resource("repository", "repo-1");
        let sync_id = sync.id;

        let reports = f
            .coordinator
            .execute_multiple_calls(vec![sync, publish])
            .await
            .unwrap();

        assert_eq!(reports[0].response, Some(Response::Accepted));
        assert_eq!(reports[1].response, Some(Response::Postponed));
        let publish_task = f.coordinator.queue().get(reports[1].task_id).await.unwrap();
        assert!(publish_task.blocking.contains(&sync_id));
    }

    #[tokio::test]
    async fn cyclic_group_stores_nothing() {
        let f = fixture();
        let a = f.coordinator.call_request(CallName::RepoSync);
        let b = f.coordinator.call_request(CallName::RepoPublish);
        let (a_id, b_id) = (a.id, b.id);
        let a = a.depends_on(b_id);
        let b = b.depends_on(a_id);

        let err = f
            .coordinator
            .execute_multiple_calls(vec![a, b])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::CircularDependencies(_)));
        assert!(f.coordinator.queue().live_tasks().await.is_empty());
        assert!(f.store.get_status(a_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn asynchronous_request_cannot_run_synchronously() {
        let f = fixture();
        let request = sync_repo(&f, "repo-1").asynchronous();
        let id = request.id;

        let err = f
            .coordinator
            .execute_call_synchronously(request, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AsynchronousExecution(t) if t == id));
    }

    #[tokio::test]
    async fn synchronous_timeout_dequeues_the_call() {
        let f = fixture();
        let request = sync_repo(&f, "repo-1");
        let id = request.id;

        let err = f
            .coordinator
            .execute_call_synchronously(request, Some(Duration::from_millis(40)))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::OperationTimedOut { task_id, .. } if task_id == id));
        assert!(!f.coordinator.queue().contains(id).await);
        let held = f
            .store
            .find_task_resources(&[("repository".to_string(), "repo-1".to_string())])
            .await
            .unwrap();
        assert!(held.is_empty());
    }

    #[tokio::test]
    async fn cancel_distinguishes_unknown_from_canceled() {
        let f = fixture();
        let report = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1"))
            .await
            .unwrap();

        let unknown = f
            .coordinator
            .cancel_call(f.coordinator.call_request(CallName::RepoSync).id)
            .await
            .unwrap();
        assert_eq!(unknown, None);

        assert_eq!(f.coordinator.cancel_call(report.task_id).await.unwrap(), Some(true));
        assert_eq!(f.coordinator.cancel_call(report.task_id).await.unwrap(), Some(true));
        let status = f.store.get_status(report.task_id).await.unwrap().unwrap();
        assert_eq!(status.state, CallState::Canceled);
    }

    #[tokio::test]
    async fn cancel_group_covers_live_members() {
        let f = fixture();
        let reports = f
            .coordinator
            .execute_multiple_calls(vec![sync_repo(&f, "repo-1"), sync_repo(&f, "repo-2")])
            .await
            .unwrap();
        let group_id = reports[0].task_group_id.unwrap();

        let results = f.coordinator.cancel_multiple_calls(group_id).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| *r == Some(true)));
    }

    #[tokio::test]
    async fn reports_are_found_by_criteria() {
        let f = fixture();
        let tagged = sync_repo(&f, "repo-1").with_tag("repository:repo-1");
        let tagged_id = tagged.id;
        f.coordinator.execute_call_asynchronously(tagged).await.unwrap();
        f.coordinator
            .execute_call_asynchronously(delete_repo(&f, "repo-2"))
            .await
            .unwrap();

        let criteria = SearchCriteria::new()
            .with_tag("repository:repo-1")
            .with_state(CallState::Waiting);
        let reports = f.coordinator.find_call_reports(&criteria).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task_id, tagged_id);

        let tasks = f
            .coordinator
            .find_tasks(&SearchCriteria::new().with_call_name(CallName::RepoDelete))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn external_completion_and_progress() {
        let f = fixture();
        let report = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1").asynchronous())
            .await
            .unwrap();

        let progress = f
            .coordinator
            .report_call_progress(report.task_id, json!({ "units": 3 }))
            .await
            .unwrap();
        assert_eq!(progress.progress, Some(json!({ "units": 3 })));

        let done = f
            .coordinator
            .complete_call_success(report.task_id, Some(json!("ok")))
            .await
            .unwrap();
        assert_eq!(done.state, CallState::Finished);

        let late = f
            .coordinator
            .complete_call_failure(report.task_id, ExecutionError::new("late", "too late"))
            .await
            .unwrap();
        assert_eq!(late.state, CallState::Finished);

        let missing = f
            .coordinator
            .complete_call_success(f.coordinator.call_request(CallName::RepoSync).id, None)
            .await
            .unwrap_err();
        assert!(matches!(missing, DispatchError::MissingResource(_)));
    }

    #[tokio::test]
    async fn reports_by_ids_can_leave_out_completed_calls() {
        let f = fixture();
        let a = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-1"))
            .await
            .unwrap();
        let b = f
            .coordinator
            .execute_call_asynchronously(sync_repo(&f, "repo-2"))
            .await
            .unwrap();
        f.coordinator.cancel_call(b.task_id).await.unwrap();

        let all = f
            .coordinator
            .get_call_reports_by_ids(&[a.task_id, b.task_id], true)
            .await
            .unwrap();
        let incomplete = f
            .coordinator
            .get_call_reports_by_ids(&[a.task_id, b.task_id], false)
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].task_id, a.task_id);
    }

    #[tokio::test]
    async fn start_replays_queued_calls_in_timestamp_order() {
        let f = fixture();
        let base = Utc::now() - ChronoDuration::minutes(5);
        let later = sync_repo(&f, "repo-1");
        let earlier = sync_repo(&f, "repo-2");
        let finished = sync_repo(&f, "repo-3");

        f.store
            .save_queued_call(QueuedCall::new(&later, base + ChronoDuration::seconds(2)))
            .await
            .unwrap();
        f.store
            .save_queued_call(QueuedCall::new(&earlier, base))
            .await
            .unwrap();
        f.store
            .save_queued_call(QueuedCall::new(&finished, base + ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let mut done = CallReport::waiting(&finished);
        done.state = CallState::Finished;
        f.store.insert_status_if_absent(done).await.unwrap();
        f.store
            .insert_task_resources(vec![TaskResource {
                task_id: finished.id,
                resource_type: "repository".into(),
                resource_id: "repo-3".into(),
                operation: ResourceOperation::Sync,
            }])
            .await
            .unwrap();

        let summary = f.coordinator.start().await.unwrap();

        assert_eq!(summary.cleared_task_resources, 1);
        assert_eq!(summary.resubmitted, vec![earlier.id, later.id]);
        assert_eq!(summary.already_complete, vec![finished.id]);
        let live: Vec<TaskId> = f
            .coordinator
            .queue()
            .live_tasks()
            .await
            .iter()
            .map(Task::id)
            .collect();
        assert_eq!(live, vec![earlier.id, later.id]);
    }

    #[tokio::test]
    async fn start_replays_a_group_under_its_id() {
        let f = fixture();
        let group_id = f.coordinator.ids.generate_group_id();
        let first = sync_repo(&f, "repo-1");
        let second = f
            .coordinator
            .call_request(CallName::RepoPublish)
            .publishes_resource("repository", "repo-1")
            .depends_on(first.id);
        let mut first = first;
        first.group_id = Some(group_id);
        let mut second = second;
        second.group_id = Some(group_id);

        let now = Utc::now();
        f.store
            .save_queued_call(QueuedCall::new(&second, now))
            .await
            .unwrap();
        f.store
            .save_queued_call(QueuedCall::new(&first, now + ChronoDuration::seconds(1)))
            .await
            .unwrap();

        let summary = f.coordinator.start().await.unwrap();

        assert_eq!(summary.resubmitted.len(), 2);
        let grouped = f.coordinator.queue().group_tasks(group_id).await;
        let order: Vec<TaskId> = grouped.iter().map(Task::id).collect();
        assert_eq!(order, vec![first.id, second.id]);
    }
}
