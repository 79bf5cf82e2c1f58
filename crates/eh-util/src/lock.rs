//! Locks for async and sync call sites

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::atomic::AtomicBoolean;
use crate::error::UtilError;
use crate::Result;

/// Async mutual exclusion backed by a semaphore.
///
/// `lock()` suspends the calling task until a permit is free; the returned guard
/// gives the permit back when released or dropped.
#[derive(Debug, Clone)]
pub struct AsyncLock {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl AsyncLock {
    pub fn new() -> Self {
        Self::with_concurrency(1)
    }

    /// Lock that admits up to `concurrency` holders at once
    pub fn with_concurrency(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub async fn lock(&self) -> Result<AsyncLockGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UtilError::LockClosed)?;
        Ok(AsyncLockGuard::new(permit))
    }

    /// Acquire without waiting, if a permit is free
    pub fn try_lock(&self) -> Option<AsyncLockGuard> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(AsyncLockGuard::new)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fail current waiters and every later `lock()` with `LockClosed`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped holder of an `AsyncLock` permit
#[derive(Debug)]
pub struct AsyncLockGuard {
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    released: AtomicBoolean,
}

impl AsyncLockGuard {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Mutex::new(Some(permit)),
            released: AtomicBoolean::new(false),
        }
    }

    /// Give the permit back. Calling it again is a no-op.
    pub fn release(&self) {
        if self.released.compare_and_set(false, true) {
            self.permit.lock().take();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.get()
    }
}

impl Drop for AsyncLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Timeout-bounded mutex for synchronous code paths
#[derive(Debug)]
pub struct SyncLock<T> {
    inner: Mutex<T>,
    timeout: Duration,
}

impl<T> SyncLock<T> {
    pub fn new(value: T, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(value),
            timeout,
        }
    }

    /// Acquire within the configured timeout
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.lock_for(self.timeout)
    }

    pub fn lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        self.inner
            .try_lock_for(timeout)
            .ok_or(UtilError::LockTimeout { timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
