//! Life-cycle callback hooks.
//!
//! Callbacks ride on a `CallRequest` and run when its task enters
//! (`on_enqueue`) or leaves (`on_dequeue`) the live queue. The coordinator
//! attaches permission grant/revoke and task-resource cleanup this way, but
//! any collaborator may register its own.

use async_trait::async_trait;

use crate::domain::{CallRequest, TaskId};

#[derive(Debug, thiserror::Error)]
#[error("life-cycle callback {name} failed: {message}")]
pub struct HookError {
    pub name: String,
    pub message: String,
}

impl HookError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait LifeCycleCallback: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: &CallRequest) -> Result<(), HookError>;
}

/// Grants the submitting principal access to the task it created.
#[async_trait]
pub trait PermissionManager: Send + Sync {
    async fn grant(&self, principal: &str, task_id: TaskId) -> Result<(), HookError>;

    async fn revoke(&self, principal: &str, task_id: TaskId) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPermissionManager;

#[async_trait]
impl PermissionManager for NoopPermissionManager {
    async fn grant(&self, _principal: &str, _task_id: TaskId) -> Result<(), HookError> {
        Ok(())
    }

    async fn revoke(&self, _principal: &str, _task_id: TaskId) -> Result<(), HookError> {
        Ok(())
    }
}
