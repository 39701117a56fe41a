use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ports::lock::{AdmissionLock, AdmissionPermit};

impl AdmissionPermit for OwnedMutexGuard<()> {}

/// Process-local admission lock.
#[derive(Debug, Clone, Default)]
pub struct LocalAdmissionLock {
    inner: Arc<Mutex<()>>,
}

impl LocalAdmissionLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdmissionLock for LocalAdmissionLock {
    async fn acquire(&self) -> Box<dyn AdmissionPermit> {
        Box::new(self.inner.clone().lock_owned().await)
    }
}
