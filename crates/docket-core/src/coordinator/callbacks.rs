//! Built-in life-cycle callbacks the coordinator attaches to every request.
//!
//! - enqueue: grant the submitting principal access to the task
//! - dequeue: revoke that access, then drop the task's resource records

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::domain::CallRequest;
use crate::ports::{HookError, LifeCycleCallback, PermissionManager, Store};

pub struct GrantPermissions {
    permissions: Arc<dyn PermissionManager>,
}

impl GrantPermissions {
    pub fn new(permissions: Arc<dyn PermissionManager>) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl LifeCycleCallback for GrantPermissions {
    fn name(&self) -> &str {
        "grant_permissions"
    }

    async fn call(&self, request: &CallRequest) -> Result<(), HookError> {
        match &request.principal {
            Some(principal) => self.permissions.grant(principal, request.id).await,
            None => Ok(()),
        }
    }
}

pub struct RevokePermissions {
    permissions: Arc<dyn PermissionManager>,
}

impl RevokePermissions {
    pub fn new(permissions: Arc<dyn PermissionManager>) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl LifeCycleCallback for RevokePermissions {
    fn name(&self) -> &str {
        "revoke_permissions"
    }

    async fn call(&self, request: &CallRequest) -> Result<(), HookError> {
        match &request.principal {
            Some(principal) => self.permissions.revoke(principal, request.id).await,
            None => Ok(()),
        }
    }
}

/// Removes every TaskResource row of the request's task.
pub struct ReleaseTaskResources {
    store: Arc<dyn Store>,
}

impl ReleaseTaskResources {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LifeCycleCallback for ReleaseTaskResources {
    fn name(&self) -> &str {
        "release_task_resources"
    }

    async fn call(&self, request: &CallRequest) -> Result<(), HookError> {
        let removed = self
            .store
            .remove_task_resources(request.id)
            .await
            .map_err(|e| HookError::new(self.name(), e.to_string()))?;
        debug!(task_id = %request.id, removed, "task resources released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallName, ResourceOperation, TaskId, TaskResource};
    use crate::impls::InMemoryStore;
    use crate::ports::ResourceStore;
    use tokio::sync::Mutex;
    use ulid::Ulid;

    #[derive(Default)]
    struct Recording {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PermissionManager for Recording {
        async fn grant(&self, principal: &str, task_id: TaskId) -> Result<(), HookError> {
            self.log.lock().await.push(format!("grant {principal} {task_id}"));
            Ok(())
        }

        async fn revoke(&self, principal: &str, task_id: TaskId) -> Result<(), HookError> {
            self.log.lock().await.push(format!("revoke {principal} {task_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn permissions_follow_the_principal() {
        let recording = Arc::new(Recording::default());
        let grant = GrantPermissions::new(recording.clone());
        let revoke = RevokePermissions::new(recording.clone());
        let request = CallRequest::new(TaskId::from_ulid(Ulid::new()), CallName::RepoSync)
            .with_principal("admin");
        let anonymous = CallRequest::new(TaskId::from_ulid(Ulid::new()), CallName::RepoSync);

        grant.call(&request).await.unwrap();
        grant.call(&anonymous).await.unwrap();
        revoke.call(&request).await.unwrap();

        let log = recording.log.lock().await.clone();
        assert_eq!(
            log,
            vec![
                format!("grant admin {}", request.id),
                format!("revoke admin {}", request.id),
            ]
        );
    }

    #[tokio::test]
    async fn release_drops_only_the_tasks_rows() {
        let store = Arc::new(InMemoryStore::new());
        let mine = TaskId::from_ulid(Ulid::new());
        let other = TaskId::from_ulid(Ulid::new());
        let row = |task_id| TaskResource {
            task_id,
            resource_type: "repository".to_string(),
            resource_id: "repo-1".to_string(),
            operation: ResourceOperation::Read,
        };
        store
            .insert_task_resources(vec![row(mine), row(other)])
            .await
            .unwrap();

        ReleaseTaskResources::new(store.clone())
            .call(&CallRequest::new(mine, CallName::RepoSync))
            .await
            .unwrap();

        let left = store
            .find_task_resources(&[("repository".to_string(), "repo-1".to_string())])
            .await
            .unwrap();
        assert_eq!(left, vec![row(other)]);
    }
}
