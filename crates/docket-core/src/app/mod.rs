//! App - アプリケーション層
//!
//! ports / coordinator / dispatch を組み合わせて、起動可能な単位にまとめます。
//!
//! # 主要コンポーネント
//! - **DocketConfig**: 実行時設定（デフォルト付き、起動時に検証）
//! - **AppBuilder**: handler 登録と外部協力者のワイヤリング
//! - **Cluster**: coordinator・dispatcher・resource manager・worker 群・lifecycle manager

pub mod builder;
pub mod cluster;
pub mod config;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::cluster::Cluster;
pub use self::config::{ConfigError, DocketConfig};
