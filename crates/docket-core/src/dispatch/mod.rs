//! Dispatch layer: everything between "the coordinator decided to run it" and
//! "a handler ran on some worker".
//!
//! - **handler**: CallName -> handler の登録表
//! - **wrapper**: DispatchTask（apply / apply_async / 予約付き dispatch / cancel）
//! - **reservation**: ResourceManager（予約キーを worker に束縛して振り分ける）
//! - **worker**: WorkerProcess と WorkerGroup
//! - **lifecycle**: 消えた worker の後始末

pub mod handler;
pub mod lifecycle;
pub mod reservation;
pub mod worker;
pub mod wrapper;

pub use self::handler::{FnHandler, OperationHandler, OperationRegistry, RegistryError, handler_fn};
pub use self::lifecycle::{WorkerCleanup, WorkerLifecycleManager};
pub use self::reservation::ResourceManager;
pub use self::worker::{WorkerGroup, WorkerProcess, WorkerTimings};
pub use self::wrapper::{Dispatch, DispatchTask};
