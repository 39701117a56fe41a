//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: 全 store port をまとめた in-memory 実装
//! - **InMemoryBroker**: キューごとの FIFO + broadcast
//! - **LocalAdmissionLock**: プロセス内 mutex
//!
//! 本番用の実装（ドキュメントストア、メッセージブローカー、分散ロック）は別クレートに置く想定。

pub mod inmem_broker;
pub mod inmem_store;
pub mod local_lock;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::InMemoryStore;
pub use self::local_lock::LocalAdmissionLock;
