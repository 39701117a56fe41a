//! DocketConfig - 実行時設定
//!
//! すべての項目にデフォルトがあり、設定ファイルは部分的に書けばよい。
//! 時間はミリ秒の整数で持ち、`Duration` を返すアクセサで読む。

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocketConfig {
    pub coordinator: CoordinatorConfig,
    pub reservation: ReservationConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How often a synchronous caller re-reads the report.
    pub task_state_poll_interval_ms: u64,
    /// Period of the dispatcher pass.
    pub dispatch_interval_ms: u64,
    /// How long dequeued tasks stay visible to the query API.
    pub completed_task_cache_life_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_state_poll_interval_ms: 500,
            dispatch_interval_ms: 500,
            completed_task_cache_life_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Retry period while no worker is available for a reservation.
    pub worker_poll_interval_ms: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            worker_poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub heartbeat_interval_ms: u64,
    /// A worker silent for this long is treated as lost.
    pub heartbeat_timeout_ms: u64,
    pub consume_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 30_000,
            consume_timeout_ms: 200,
        }
    }
}

impl DocketConfig {
    pub fn task_state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.task_state_poll_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.dispatch_interval_ms)
    }

    pub fn completed_task_cache_life(&self) -> Duration {
        Duration::from_millis(self.coordinator.completed_task_cache_life_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reservation.worker_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.workers.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.heartbeat_timeout_ms)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.consume_timeout_ms)
    }

    /// Fail fast on settings that would spin or never detect a lost worker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("coordinator.task_state_poll_interval_ms", self.coordinator.task_state_poll_interval_ms),
            ("coordinator.dispatch_interval_ms", self.coordinator.dispatch_interval_ms),
            ("reservation.worker_poll_interval_ms", self.reservation.worker_poll_interval_ms),
            ("workers.heartbeat_interval_ms", self.workers.heartbeat_interval_ms),
            ("workers.consume_timeout_ms", self.workers.consume_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.workers.heartbeat_timeout_ms <= self.workers.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "workers.heartbeat_timeout_ms ({}) must exceed workers.heartbeat_interval_ms ({})",
                self.workers.heartbeat_timeout_ms, self.workers.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}
