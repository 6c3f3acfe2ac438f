//! Shared handle to the single scoring backend.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backend::ExecutionBackend;
use crate::cancellation::CancellationToken;
use crate::error::{DecodeError, DecodeResult};

/// Owns the backend for the lifetime of the hosting service.
///
/// Concurrent decodes queue on an exclusive lease before each score call
/// unless the backend reports that concurrent scoring is safe.
pub struct SharedOracle<B> {
    backend: Arc<B>,
    slot: Arc<Mutex<()>>,
}

impl<B> Clone for SharedOracle<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<B: ExecutionBackend> SharedOracle<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(())),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Waits for exclusive access. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OracleLease<'_, B>> {
        if self.backend.supports_concurrent_scoring() {
            return (!cancel.is_cancelled()).then(|| OracleLease {
                backend: self.backend.as_ref(),
                _guard: None,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = self.slot.clone().lock_owned() => Some(OracleLease {
                backend: self.backend.as_ref(),
                _guard: Some(guard),
            }),
        }
    }

    /// Whether some decode currently holds the lease.
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Releases model resources once no decode holds the lease.
    pub async fn release(&self) -> DecodeResult<()> {
        let _guard = self.slot.lock().await;
        log::info!("Releasing {} backend", self.backend.device());
        self.backend.release().await.map_err(DecodeError::Oracle)
    }
}

impl<B> std::fmt::Debug for SharedOracle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedOracle")
            .field("holders", &Arc::strong_count(&self.backend))
            .finish()
    }
}

/// Exclusive access to the backend. Dropping it lets the next decode in.
pub struct OracleLease<'a, B> {
    backend: &'a B,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl<B> std::ops::Deref for OracleLease<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}
