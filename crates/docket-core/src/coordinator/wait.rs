//! Polling for a report to reach a state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{CallReport, CallState, TaskId};
use crate::error::DispatchError;
use crate::ports::Store;

/// Poll `task_id`'s report every `poll_interval` until its state is one of
/// `states`.
///
/// Fails with `OperationTimedOut` once `timeout` elapses and with
/// `ShuttingDown` when the shutdown signal fires first. The caller decides
/// what to do with the task on timeout.
pub async fn wait_for_task(
    store: &Arc<dyn Store>,
    task_id: TaskId,
    states: &[CallState],
    poll_interval: Duration,
    timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<CallReport, DispatchError> {
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);

    loop {
        let report = store
            .get_status(task_id)
            .await?
            .ok_or_else(|| DispatchError::MissingResource(task_id.to_string()))?;
        if states.contains(&report.state) {
            return Ok(report);
        }

        let now = Instant::now();
        if let Some(deadline) = deadline
            && now >= deadline
        {
            return Err(DispatchError::OperationTimedOut {
                task_id,
                waited: now - started,
            });
        }
        let nap = match deadline {
            Some(deadline) => poll_interval.min(deadline - now),
            None => poll_interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(DispatchError::ShuttingDown);
                }
            }
        }
    }
}
