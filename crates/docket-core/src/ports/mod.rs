//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 永続ストア・メッセージブローカー・ロック・権限管理はすべて外部の協力者で、
//! ここでは境界の契約だけを決めます。実装は `impls` にあります。

pub mod broker;
pub mod clock;
pub mod hooks;
pub mod id_generator;
pub mod lock;
pub mod store;

pub use self::broker::{
    Broker, BrokerError, DEFAULT_QUEUE, RESOURCE_MANAGER_QUEUE, Revocation, WorkerEvent,
    dedicated_queue,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::hooks::{HookError, LifeCycleCallback, NoopPermissionManager, PermissionManager};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock::{AdmissionLock, AdmissionPermit};
pub use self::store::{
    QueuedCallStore, ReservationStore, ResourceStore, StatusFilter, StatusStore, Store,
    StoreError, WorkerStore,
};
