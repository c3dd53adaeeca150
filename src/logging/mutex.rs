//! Locking primitives for the logging pipeline.
//!
//! [`AsyncMutex`] guards the in-memory queue across suspension points. Waiters
//! are granted the lock strictly in arrival order, so a steady stream of
//! pushes cannot starve a flush (and vice versa). Releasing happens when the
//! returned guard is dropped.
//!
//! [`mutex_lock`] is for short synchronous sections that never await, such as
//! swapping the batch timer handle.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::{Mutex as TokioMutex, MutexGuard as TokioMutexGuard};
use tracing::{trace, warn};

/// Fair, async-aware single-holder lock.
#[derive(Debug, Default)]
pub struct AsyncMutex<T> {
    inner: TokioMutex<T>,
}

impl<T> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: TokioMutex::new(value),
        }
    }

    /// Wait for exclusive access. Contended callers queue up FIFO.
    pub async fn lock(&self) -> TokioMutexGuard<'_, T> {
        if let Ok(guard) = self.inner.try_lock() {
            return guard;
        }
        trace!(op = "mutex.lock", result = "contended", "Waiting for queue lock");
        self.inner.lock().await
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned logging lock"
            );
            poisoned.into_inner()
        }
    }
}
