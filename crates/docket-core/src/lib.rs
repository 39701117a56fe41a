//! docket-core
//!
//! Resource-aware task coordination.
//!
//! 呼び出し（CallRequest）が宣言したリソース操作を、実行中の呼び出しが保持している
//! 操作と突き合わせて accepted / postponed / rejected を決め、受理したものを
//! 依存関係の順にワーカーへ配送します。同じリソースへの操作は一つのワーカーに
//! 集約されます。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, operation, state, request, report, resource, envelope, outcome）
//! - **ports**: 抽象化レイヤー（Store, Broker, AdmissionLock, Clock, IdGenerator, hooks）
//! - **impls**: ports の in-memory 実装
//! - **conflict**: Operation matrix と衝突判定
//! - **coordinator**: 受付・依存解決・live queue・検索・リカバリ
//! - **dispatch**: handler registry、dispatch wrapper、reservation、worker、lifecycle
//! - **app**: 設定、AppBuilder、Cluster
//! - **error**: 呼び出し側に返すエラー

pub mod app;
pub mod conflict;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use crate::error::DispatchError;
