//! Store ports - 永続ストアの抽象化
//!
//! 各操作は 1 レコード単位で atomic であることを要求します。
//! 複数の dispatcher と worker が同時に同じレコードを触るためです。
//!
//! - **StatusStore**: CallReport（insert-if-absent / 条件付き更新）
//! - **ResourceStore**: TaskResource（競合検出用）
//! - **ReservationStore**: ReservedResource（worker への振り分け）
//! - **WorkerStore**: Worker（生存管理）
//! - **QueuedCallStore**: QueuedCall（リカバリ用、timestamp 順に読める）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CallReport, CallState, GroupId, QueuedCall, ReservedResource, StatusUpdate, TaskId,
    TaskResource, WorkerRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// Equality filter over stored reports.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub worker_name: Option<String>,
    pub group_id: Option<GroupId>,
    /// Only reports whose state is *not* one of these.
    pub exclude_states: Vec<CallState>,
}

impl StatusFilter {
    pub fn incomplete_on_worker(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: Some(worker_name.into()),
            group_id: None,
            exclude_states: CallState::COMPLETE.to_vec(),
        }
    }

    pub fn matches(&self, report: &CallReport) -> bool {
        if let Some(worker) = &self.worker_name
            && report.worker_name.as_deref() != Some(worker.as_str())
        {
            return false;
        }
        if let Some(group) = self.group_id
            && report.task_group_id != Some(group)
        {
            return false;
        }
        !self.exclude_states.contains(&report.state)
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert `report` unless a report with the same task id exists.
    /// Returns whether the insert happened.
    async fn insert_status_if_absent(&self, report: CallReport) -> Result<bool, StoreError>;

    async fn get_status(&self, task_id: TaskId) -> Result<Option<CallReport>, StoreError>;

    /// Reports for the given ids, in the given order, skipping unknown ids.
    async fn get_statuses(&self, task_ids: &[TaskId]) -> Result<Vec<CallReport>, StoreError>;

    /// Apply `update` to an existing report. `None` when there is no report.
    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Option<CallReport>, StoreError>;

    /// Compare-and-set: apply `update` only if the current state is not in
    /// `unless`. `None` when the report is missing or the guard failed.
    async fn update_status_unless(
        &self,
        task_id: TaskId,
        unless: &[CallState],
        update: StatusUpdate,
    ) -> Result<Option<CallReport>, StoreError>;

    async fn find_statuses(&self, filter: &StatusFilter) -> Result<Vec<CallReport>, StoreError>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn insert_task_resources(&self, resources: Vec<TaskResource>) -> Result<(), StoreError>;

    /// Every held record sharing one of the `(resource_type, resource_id)` keys.
    async fn find_task_resources(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<TaskResource>, StoreError>;

    /// Remove every record of `task_id`, returning how many went away.
    async fn remove_task_resources(&self, task_id: TaskId) -> Result<usize, StoreError>;

    async fn clear_task_resources(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn find_reservation(&self, resource_id: &str) -> Result<Option<ReservedResource>, StoreError>;

    /// Bind `resource_id` to `worker_name` for `task_id`.
    ///
    /// When the key is already bound, `task_id` joins the existing binding and
    /// the existing worker is returned unchanged. The returned row is the one
    /// to route to.
    async fn reserve(
        &self,
        resource_id: &str,
        worker_name: &str,
        task_id: TaskId,
    ) -> Result<ReservedResource, StoreError>;

    /// Drop `task_id` from the binding; deletes the row with its last task.
    /// Returns whether the row was deleted.
    async fn release(&self, resource_id: &str, task_id: TaskId) -> Result<bool, StoreError>;

    /// Delete every binding served by `worker_name`.
    async fn release_worker(&self, worker_name: &str) -> Result<Vec<ReservedResource>, StoreError>;

    async fn reservations(&self) -> Result<Vec<ReservedResource>, StoreError>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), StoreError>;

    /// Refresh the heartbeat; `false` when the worker is unknown.
    async fn touch_worker(&self, name: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn remove_worker(&self, name: &str) -> Result<bool, StoreError>;

    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Workers not serving any reservation.
    async fn unreserved_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;
}

#[async_trait]
pub trait QueuedCallStore: Send + Sync {
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StoreError>;

    async fn remove_queued_call(&self, task_id: TaskId) -> Result<bool, StoreError>;

    /// Every queued call in ascending timestamp order.
    async fn queued_calls(&self) -> Result<Vec<QueuedCall>, StoreError>;
}

/// Everything the engine needs from the persistent store.
pub trait Store: StatusStore + ResourceStore + ReservationStore + WorkerStore + QueuedCallStore {}

impl<T> Store for T where
    T: StatusStore + ResourceStore + ReservationStore + WorkerStore + QueuedCallStore
{
}
