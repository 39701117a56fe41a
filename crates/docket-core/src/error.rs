use std::time::Duration;
use thiserror::Error;

use crate::domain::TaskId;
use crate::ports::{BrokerError, StoreError};

/// Errors raised to callers of the coordinator and the dispatch layer.
///
/// Failures inside dispatched work are not in here: they are stored on the
/// call report as an `ExecutionError`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("call {0} is asynchronous and cannot be executed synchronously")]
    AsynchronousExecution(TaskId),

    #[error("timed out after {waited:?} waiting for {task_id}")]
    OperationTimedOut { task_id: TaskId, waited: Duration },

    #[error("circular dependencies among {0:?}")]
    CircularDependencies(Vec<TaskId>),

    #[error("unrecognized search criteria: {0:?}")]
    UnrecognizedSearchCriteria(Vec<String>),

    #[error("invalid value for search criterion {key}: {message}")]
    InvalidSearchCriteria { key: String, message: String },

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
