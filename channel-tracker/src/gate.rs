//! Postprocessing gate.
//!
//! One exclusive permit shared by every slot. A slot takes it when its
//! fetcher enters the finalize phase and gives it back when the cycle ends.
//! The permit is an owned RAII guard: dropping it (including when the
//! holding task is aborted) returns it, and acquisition is bounded by a
//! timeout so a wedged holder cannot stall the other slots forever.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Postprocessing gate busy for {waited:?} (held by slot {holder:?})")]
    Timeout {
        waited: Duration,
        holder: Option<usize>,
    },
    #[error("Postprocessing gate closed")]
    Closed,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    holder: Mutex<Option<usize>>,
}

/// Shared handle to the gate; clone freely.
#[derive(Debug, Clone)]
pub struct PostprocessGate {
    inner: Arc<GateInner>,
    timeout: Duration,
}

impl PostprocessGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(1)),
                holder: Mutex::new(None),
            }),
            timeout,
        }
    }

    /// Wait for the permit on behalf of `slot`.
    pub async fn acquire(&self, slot: usize) -> Result<GatePermit, GateError> {
        let acquire = self.inner.semaphore.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GateError::Closed),
            Err(_) => {
                let holder = self.holder();
                warn!(slot, ?holder, "Timed out waiting for postprocessing gate");
                return Err(GateError::Timeout {
                    waited: self.timeout,
                    holder,
                });
            }
        };

        *self.inner.holder.lock() = Some(slot);
        debug!(slot, "Postprocessing gate acquired");
        Ok(GatePermit {
            slot,
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Slot currently holding the permit, if any.
    pub fn holder(&self) -> Option<usize> {
        *self.inner.holder.lock()
    }

    pub fn is_free(&self) -> bool {
        self.inner.semaphore.available_permits() > 0
    }

    /// Refuse all future acquisitions; pending waiters fail with `Closed`.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

/// Held permit. Released on drop.
#[derive(Debug)]
pub struct GatePermit {
    slot: usize,
    inner: Arc<GateInner>,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut holder = self.inner.holder.lock();
        if *holder == Some(self.slot) {
            *holder = None;
        }
        debug!(slot = self.slot, "Postprocessing gate released");
    }
}
