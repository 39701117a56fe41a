//! Conflict resolution.
//!
//! Given the resources a proposed call declares, look at what in-flight calls
//! hold on the same `(resource_type, resource_id)` and decide whether the
//! proposal is accepted, postponed behind the holders, or rejected.
//!
//! Rejection wins over postponement: a proposal that is rejected by any
//! holder is rejected even if other holders would only postpone it.

pub mod matrix;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::{Reason, ResourceMap, Response, TaskId, TaskResource};
use crate::ports::{Store, StoreError};

pub use self::matrix::OperationMatrix;

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub response: Response,
    /// Holders the proposal waits for (postponed) or collided with (rejected).
    pub blocking: BTreeSet<TaskId>,
    pub reasons: Vec<Reason>,
    /// The proposal materialized as records, ready to be committed.
    pub task_resources: Vec<TaskResource>,
}

impl Resolution {
    fn accepted(task_resources: Vec<TaskResource>) -> Self {
        Self {
            response: Response::Accepted,
            blocking: BTreeSet::new(),
            reasons: Vec::new(),
            task_resources,
        }
    }
}

/// Materialize a resource map into one record per declared resource.
pub fn materialize(task_id: TaskId, resources: &ResourceMap) -> Vec<TaskResource> {
    resources
        .iter()
        .flat_map(|(resource_type, ids)| {
            ids.iter().map(move |(resource_id, operation)| TaskResource {
                task_id,
                resource_type: resource_type.clone(),
                resource_id: resource_id.clone(),
                operation: *operation,
            })
        })
        .collect()
}

/// Decide a proposal against an explicit set of held records.
pub fn resolve_against(
    matrix: &OperationMatrix,
    task_id: TaskId,
    resources: &ResourceMap,
    held: &[TaskResource],
) -> Resolution {
    let proposed = materialize(task_id, resources);
    if proposed.is_empty() {
        return Resolution::accepted(proposed);
    }

    let mut rejecting_tasks = BTreeSet::new();
    let mut rejecting_reasons: Vec<Reason> = Vec::new();
    let mut postponing_tasks = BTreeSet::new();
    let mut postponing_reasons: Vec<Reason> = Vec::new();

    for wanted in &proposed {
        let rejecting_ops = matrix.rejecting_operations(wanted.operation);
        let postponing_ops = matrix.postponing_operations(wanted.operation);

        for holder in held
            .iter()
            .filter(|h| h.task_id != task_id && h.key() == wanted.key())
        {
            let reason = Reason {
                resource_type: holder.resource_type.clone(),
                resource_id: holder.resource_id.clone(),
                operation: holder.operation,
            };
            if rejecting_ops.contains(&holder.operation) {
                rejecting_tasks.insert(holder.task_id);
                if !rejecting_reasons.contains(&reason) {
                    rejecting_reasons.push(reason);
                }
            } else if postponing_ops.contains(&holder.operation) {
                postponing_tasks.insert(holder.task_id);
                if !postponing_reasons.contains(&reason) {
                    postponing_reasons.push(reason);
                }
            }
        }
    }

    if !rejecting_tasks.is_empty() {
        return Resolution {
            response: Response::Rejected,
            blocking: rejecting_tasks,
            reasons: rejecting_reasons,
            task_resources: proposed,
        };
    }
    if !postponing_tasks.is_empty() {
        return Resolution {
            response: Response::Postponed,
            blocking: postponing_tasks,
            reasons: postponing_reasons,
            task_resources: proposed,
        };
    }
    Resolution::accepted(proposed)
}

/// Conflict check backed by the task-resource store.
pub struct ConflictResolver {
    matrix: OperationMatrix,
    store: Arc<dyn Store>,
}

impl ConflictResolver {
    pub fn new(matrix: OperationMatrix, store: Arc<dyn Store>) -> Self {
        Self { matrix, store }
    }

    pub fn matrix(&self) -> &OperationMatrix {
        &self.matrix
    }

    pub async fn find_conflicts(
        &self,
        task_id: TaskId,
        resources: &ResourceMap,
    ) -> Result<Resolution, StoreError> {
        self.find_conflicts_with(task_id, resources, &[]).await
    }

    /// Like `find_conflicts`, also counting `pending` records that are about
    /// to be committed but are not in the store yet (earlier calls of the
    /// same batch).
    pub async fn find_conflicts_with(
        &self,
        task_id: TaskId,
        resources: &ResourceMap,
        pending: &[TaskResource],
    ) -> Result<Resolution, StoreError> {
        if resources.values().all(|ids| ids.is_empty()) {
            return Ok(Resolution::accepted(Vec::new()));
        }
        let keys: Vec<(String, String)> = materialize(task_id, resources)
            .into_iter()
            .map(|r| (r.resource_type, r.resource_id))
            .collect();
        let mut held = self.store.find_task_resources(&keys).await?;
        held.extend(pending.iter().cloned());
        Ok(resolve_against(&self.matrix, task_id, resources, &held))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResourceOperation as Op;
    use crate::impls::InMemoryStore;
    use crate::ports::ResourceStore;
    use rstest::rstest;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn resources(entries: &[(&str, &str, Op)]) -> ResourceMap {
        let mut map = ResourceMap::new();
        for (t, i, op) in entries {
            map.entry(t.to_string()).or_default().insert(i.to_string(), *op);
        }
        map
    }

    fn held(task_id: TaskId, resource_id: &str, operation: Op) -> TaskResource {
        TaskResource {
            task_id,
            resource_type: "repository".into(),
            resource_id: resource_id.into(),
            operation,
        }
    }

    #[test]
    fn empty_proposal_is_always_accepted() {
        let holder = held(id(), "repo-1", Op::Delete);
        let resolution = resolve_against(
            &OperationMatrix::standard(),
            id(),
            &ResourceMap::new(),
            &[holder],
        );
        assert_eq!(resolution.response, Response::Accepted);
        assert!(resolution.blocking.is_empty());
        assert!(resolution.task_resources.is_empty());
    }

    #[rstest]
    #[case::sync_then_delete(Op::Sync, Op::Delete)]
    #[case::sync_then_read(Op::Sync, Op::Read)]
    #[case::sync_then_sync(Op::Sync, Op::Sync)]
    #[case::create_then_create(Op::Create, Op::Create)]
    #[case::delete_then_create(Op::Delete, Op::Create)]
    #[case::read_then_read(Op::Read, Op::Read)]
    #[case::publish_then_update(Op::Publish, Op::Update)]
    fn single_holder_matches_the_matrix(#[case] held_op: Op, #[case] proposed_op: Op) {
        let matrix = OperationMatrix::standard();
        let holder_id = id();
        let resolution = resolve_against(
            &matrix,
            id(),
            &resources(&[("repository", "repo-1", proposed_op)]),
            &[held(holder_id, "repo-1", held_op)],
        );

        let expected = matrix.response(held_op, proposed_op);
        assert_eq!(resolution.response, expected);
        assert_eq!(resolution.blocking.contains(&holder_id), expected != Response::Accepted);
    }

    #[test]
    fn rejection_beats_postponement_across_holders() {
        let (syncing, reading) = (id(), id());
        let resolution = resolve_against(
            &OperationMatrix::standard(),
            id(),
            &resources(&[("repository", "repo-1", Op::Delete)]),
            &[held(reading, "repo-1", Op::Read), held(syncing, "repo-1", Op::Sync)],
        );

        assert_eq!(resolution.response, Response::Rejected);
        assert_eq!(resolution.blocking, BTreeSet::from([syncing]));
        assert_eq!(
            resolution.reasons,
            vec![Reason {
                resource_type: "repository".into(),
                resource_id: "repo-1".into(),
                operation: Op::Sync,
            }]
        );
    }

    #[test]
    fn reasons_are_deduplicated() {
        let resolution = resolve_against(
            &OperationMatrix::standard(),
            id(),
            &resources(&[("repository", "repo-1", Op::Sync)]),
            &[held(id(), "repo-1", Op::Update), held(id(), "repo-1", Op::Update)],
        );
        assert_eq!(resolution.response, Response::Postponed);
        assert_eq!(resolution.blocking.len(), 2);
        assert_eq!(resolution.reasons.len(), 1);
    }

    #[test]
    fn unrelated_resources_do_not_conflict() {
        let resolution = resolve_against(
            &OperationMatrix::standard(),
            id(),
            &resources(&[("repository", "repo-2", Op::Delete)]),
            &[held(id(), "repo-1", Op::Sync)],
        );
        assert_eq!(resolution.response, Response::Accepted);
        assert_eq!(resolution.task_resources.len(), 1);
    }

    #[tokio::test]
    async fn resolver_reads_held_records_from_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let syncing = id();
        store
            .insert_task_resources(vec![held(syncing, "repo-1", Op::Sync)])
            .await
            .unwrap();
        let resolver = ConflictResolver::new(OperationMatrix::standard(), store);

        let resolution = resolver
            .find_conflicts(id(), &resources(&[("repository", "repo-1", Op::Delete)]))
            .await
            .unwrap();

        assert_eq!(resolution.response, Response::Rejected);
        assert_eq!(resolution.reasons.len(), 1);
        assert_eq!(resolution.reasons[0].resource_id, "repo-1");
        assert_eq!(resolution.reasons[0].operation, Op::Sync);
    }
}
