//! AdmissionLock port.
//!
//! Serializes "check conflicts, then commit reservations" across concurrent
//! submissions. Per-record atomicity in the store cannot give that: two
//! submissions could both observe "no conflict" and both commit.
//!
//! The in-process implementation only covers dispatchers sharing one
//! process. Running several dispatcher processes against one store needs a
//! distributed implementation of this trait.

use async_trait::async_trait;

/// Held for the duration of one admission; dropping it releases the lock.
pub trait AdmissionPermit: Send {}

#[async_trait]
pub trait AdmissionLock: Send + Sync {
    async fn acquire(&self) -> Box<dyn AdmissionPermit>;
}
