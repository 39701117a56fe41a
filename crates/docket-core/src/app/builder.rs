//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! handler の登録、外部協力者（store / broker / lock / 権限管理）の差し替え、
//! 設定の検証をまとめて行い、起動可能な `App` を作る。
//! 指定しなかった協力者は in-memory 実装で埋める。

use std::sync::Arc;

use crate::conflict::OperationMatrix;
use crate::dispatch::{OperationHandler, OperationRegistry, RegistryError};
use crate::domain::CallName;
use crate::impls::{InMemoryBroker, InMemoryStore, LocalAdmissionLock};
use crate::ports::{
    AdmissionLock, Broker, Clock, NoopPermissionManager, PermissionManager, Store, SystemClock,
};

use super::config::{ConfigError, DocketConfig};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register(CallName::RepoSync, handler_fn(sync_repo))?
///     .expect_operations(&[CallName::RepoSync])
///     .build()?;
/// let cluster = app.start().await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_operations() で期待される call name を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 設定値も build() 時に検証する
pub struct AppBuilder {
    registry: OperationRegistry,
    expected_operations: Option<Vec<CallName>>,
    config: DocketConfig,
    matrix: OperationMatrix,
    store: Option<Arc<dyn Store>>,
    broker: Option<Arc<dyn Broker>>,
    clock: Option<Arc<dyn Clock>>,
    permissions: Option<Arc<dyn PermissionManager>>,
    lock: Option<Arc<dyn AdmissionLock>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing operations: {0:?}. These call names were expected but have no handler.")]
    MissingOperations(Vec<CallName>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: OperationRegistry::new(),
            expected_operations: None,
            config: DocketConfig::default(),
            matrix: OperationMatrix::standard(),
            store: None,
            broker: None,
            clock: None,
            permissions: None,
            lock: None,
        }
    }

    /// Handler を登録
    ///
    /// 同じ call name を二度登録すると `RegistryError::DuplicateHandler`。
    pub fn register(
        mut self,
        call_name: CallName,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(call_name, handler)?;
        Ok(self)
    }

    /// 期待される call name のリストを設定
    pub fn expect_operations(mut self, call_names: &[CallName]) -> Self {
        self.expected_operations = Some(call_names.to_vec());
        self
    }

    pub fn config(mut self, config: DocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn matrix(mut self, matrix: OperationMatrix) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionManager>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn AdmissionLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - expect_operations() の call name が全て登録されているか
    /// - 設定値が妥当か（`DocketConfig::validate`）
    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_operations {
            let registered = self.registry.registered();
            let missing: Vec<CallName> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOperations(missing));
            }
        }
        self.config.validate()?;

        Ok(App {
            config: self.config,
            registry: Arc::new(self.registry),
            matrix: self.matrix,
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            broker: self.broker.unwrap_or_else(|| Arc::new(InMemoryBroker::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            permissions: self
                .permissions
                .unwrap_or_else(|| Arc::new(NoopPermissionManager)),
            lock: self
                .lock
                .unwrap_or_else(|| Arc::new(LocalAdmissionLock::new())),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は起動前のアプリケーション
///
/// `start()`（cluster.rs）でリカバリを実行し、各ループを spawn する。
pub struct App {
    pub config: DocketConfig,
    pub registry: Arc<OperationRegistry>,
    pub matrix: OperationMatrix,
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub permissions: Arc<dyn PermissionManager>,
    pub lock: Arc<dyn AdmissionLock>,
}
