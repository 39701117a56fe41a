use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::outcome::codes;
use crate::domain::{CallName, ExecutionError, TaskEnvelope, TaskResult};

/// Does the real work of one call name.
///
/// Takes the whole envelope so the handler can read positional and keyword
/// arguments as it likes.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, call: &TaskEnvelope) -> Result<TaskResult, ExecutionError>;
}

/// Adapter turning an async closure into a handler.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskResult, ExecutionError>> + Send,
{
    async fn handle(&self, call: &TaskEnvelope) -> Result<TaskResult, ExecutionError> {
        (self.f)(call.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskResult, ExecutionError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate handler for call_name={0}")]
    DuplicateHandler(CallName),
}

/// Registry of handlers (call name -> handler).
///
/// Built during initialization, read-only afterwards.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<CallName, Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        call_name: CallName,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&call_name) {
            return Err(RegistryError::DuplicateHandler(call_name));
        }
        self.handlers.insert(call_name, handler);
        Ok(())
    }

    pub fn get(&self, call_name: CallName) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&call_name).cloned()
    }

    pub fn registered(&self) -> BTreeSet<CallName> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `call` in the current task.
    pub async fn execute(&self, call: &TaskEnvelope) -> Result<TaskResult, ExecutionError> {
        let handler = self.get(call.call_name).ok_or_else(|| missing_handler(call.call_name))?;
        handler.handle(call).await
    }
}

pub(crate) fn missing_handler(call_name: CallName) -> ExecutionError {
    ExecutionError::new(
        codes::HANDLER_MISSING,
        format!("no handler registered for call_name={call_name}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn envelope(call_name: CallName) -> TaskEnvelope {
        TaskEnvelope::new(TaskId::from_ulid(Ulid::new()), call_name)
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let mut registry = OperationRegistry::new();
        registry
            .register(
                CallName::RepoSync,
                handler_fn(|call: TaskEnvelope| async move {
                    Ok(TaskResult::value(serde_json::json!({ "synced": call.call_name })))
                }),
            )
            .unwrap();

        let result = registry.execute(&envelope(CallName::RepoSync)).await.unwrap();
        assert_eq!(result.result, Some(serde_json::json!({ "synced": "repo_sync" })));
    }

    #[tokio::test]
    async fn missing_handler_is_an_execution_error() {
        let registry = OperationRegistry::new();
        let err = registry
            .execute(&envelope(CallName::RepoDelete))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::HANDLER_MISSING);
        assert!(err.description.contains("repo_delete"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = OperationRegistry::new();
        let noop = || handler_fn(|_call: TaskEnvelope| async { Ok(TaskResult::empty()) });
        registry.register(CallName::RepoCreate, noop()).unwrap();

        let err = registry.register(CallName::RepoCreate, noop()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler(CallName::RepoCreate)));
        assert_eq!(registry.len(), 1);
    }
}
