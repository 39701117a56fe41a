//! InMemoryStore - 開発・テスト用の永続ストア
//!
//! # 実装詳細
//! - すべてのコレクションを 1 つの `tokio::sync::Mutex` の下に置く
//! - 各メソッドはロックを取って完結するので、1 操作 = 1 atomic 操作になる
//! - ロックを跨いで await しない

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

use crate::domain::{
    CallReport, CallState, QueuedCall, ReservedResource, StatusUpdate, TaskId, TaskResource,
    WorkerRecord,
};
use crate::ports::store::{
    QueuedCallStore, ReservationStore, ResourceStore, StatusFilter, StatusStore, StoreError,
    WorkerStore,
};

#[derive(Default)]
struct StoreState {
    statuses: BTreeMap<TaskId, CallReport>,
    task_resources: Vec<TaskResource>,
    reservations: BTreeMap<String, ReservedResource>,
    workers: BTreeMap<String, WorkerRecord>,
    queued: BTreeMap<TaskId, QueuedCall>,
}

/// InMemoryStore は全 store port を 1 つの構造体で実装する
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStore {
    async fn insert_status_if_absent(&self, report: CallReport) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.statuses.contains_key(&report.task_id) {
            return Ok(false);
        }
        state.statuses.insert(report.task_id, report);
        Ok(true)
    }

    async fn get_status(&self, task_id: TaskId) -> Result<Option<CallReport>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.statuses.get(&task_id).cloned())
    }

    async fn get_statuses(&self, task_ids: &[TaskId]) -> Result<Vec<CallReport>, StoreError> {
        let state = self.state.lock().await;
        Ok(task_ids
            .iter()
            .filter_map(|id| state.statuses.get(id).cloned())
            .collect())
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        update: StatusUpdate,
    ) -> Result<Option<CallReport>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(report) = state.statuses.get_mut(&task_id) else {
            return Ok(None);
        };
        update.apply_to(report);
        Ok(Some(report.clone()))
    }

    async fn update_status_unless(
        &self,
        task_id: TaskId,
        unless: &[CallState],
        update: StatusUpdate,
    ) -> Result<Option<CallReport>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(report) = state.statuses.get_mut(&task_id) else {
            return Ok(None);
        };
        if unless.contains(&report.state) {
            return Ok(None);
        }
        update.apply_to(report);
        Ok(Some(report.clone()))
    }

    async fn find_statuses(&self, filter: &StatusFilter) -> Result<Vec<CallReport>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .values()
            .filter(|report| filter.matches(report))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn insert_task_resources(&self, resources: Vec<TaskResource>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.task_resources.extend(resources);
        Ok(())
    }

    async fn find_task_resources(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<TaskResource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .task_resources
            .iter()
            .filter(|held| {
                keys.iter()
                    .any(|(t, i)| held.resource_type == *t && held.resource_id == *i)
            })
            .cloned()
            .collect())
    }

    async fn remove_task_resources(&self, task_id: TaskId) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.task_resources.len();
        state.task_resources.retain(|held| held.task_id != task_id);
        Ok(before - state.task_resources.len())
    }

    async fn clear_task_resources(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let removed = state.task_resources.len();
        state.task_resources.clear();
        Ok(removed)
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn find_reservation(&self, resource_id: &str) -> Result<Option<ReservedResource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reservations.get(resource_id).cloned())
    }

    async fn reserve(
        &self,
        resource_id: &str,
        worker_name: &str,
        task_id: TaskId,
    ) -> Result<ReservedResource, StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .reservations
            .entry(resource_id.to_string())
            .or_insert_with(|| ReservedResource {
                resource_id: resource_id.to_string(),
                worker_name: worker_name.to_string(),
                task_ids: BTreeSet::new(),
            });
        row.task_ids.insert(task_id);
        Ok(row.clone())
    }

    async fn release(&self, resource_id: &str, task_id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.reservations.get_mut(resource_id) else {
            return Ok(false);
        };
        row.task_ids.remove(&task_id);
        if row.task_ids.is_empty() {
            state.reservations.remove(resource_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_worker(&self, worker_name: &str) -> Result<Vec<ReservedResource>, StoreError> {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state
            .reservations
            .iter()
            .filter(|(_, row)| row.worker_name == worker_name)
            .map(|(key, _)| key.clone())
            .collect();
        Ok(keys
            .iter()
            .filter_map(|key| state.reservations.remove(key))
            .collect())
    }

    async fn reservations(&self) -> Result<Vec<ReservedResource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reservations.values().cloned().collect())
    }
}

#[async_trait]
impl WorkerStore for InMemoryStore {
    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.workers.insert(worker.name.clone(), worker);
        Ok(())
    }

    async fn touch_worker(&self, name: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(name) {
            Some(worker) => {
                worker.last_heartbeat = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_worker(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.workers.remove(name).is_some())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.workers.values().cloned().collect())
    }

    async fn unreserved_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let state = self.state.lock().await;
        let reserved: BTreeSet<&str> = state
            .reservations
            .values()
            .map(|row| row.worker_name.as_str())
            .collect();
        Ok(state
            .workers
            .values()
            .filter(|worker| !reserved.contains(worker.name.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueuedCallStore for InMemoryStore {
    async fn save_queued_call(&self, call: QueuedCall) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.queued.contains_key(&call.task_id) {
            return Err(StoreError::Duplicate(call.task_id.to_string()));
        }
        state.queued.insert(call.task_id, call);
        Ok(())
    }

    async fn remove_queued_call(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.queued.remove(&task_id).is_some())
    }

    async fn queued_calls(&self) -> Result<Vec<QueuedCall>, StoreError> {
        let state = self.state.lock().await;
        let mut calls: Vec<QueuedCall> = state.queued.values().cloned().collect();
        calls.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.task_id.cmp(&b.task_id)));
        Ok(calls)
    }
}
