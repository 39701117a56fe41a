//! Domain model (ids, operations, requests, reports, bookkeeping records).
//!
//! ここは純粋なデータのみ。I/O や待ち合わせは ports / coordinator / dispatch 側で行う。

pub mod call_name;
pub mod envelope;
pub mod ids;
pub mod operation;
pub mod outcome;
pub mod report;
pub mod request;
pub mod resource;
pub mod state;

pub use call_name::CallName;
pub use envelope::{BrokerMessage, TaskEnvelope};
pub use ids::{GroupId, TaskId};
pub use operation::{ResourceOperation, Response};
pub use outcome::{ExecutionError, TaskResult};
pub use report::{CallReport, Reason, StatusUpdate};
pub use request::{CallRequest, LifeCycleHooks, ResourceMap};
pub use resource::{QueuedCall, ReservedResource, TaskResource, WorkerRecord, reservation_key};
pub use state::CallState;
