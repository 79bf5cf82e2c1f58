//! EdgeHub concurrency primitives
//!
//! Small building blocks shared by every stateful component of the hub:
//! - AtomicReference: swappable `Arc` slot with compare-and-swap by identity
//! - AtomicBoolean / AtomicLong: single-word flags and counters
//! - AsyncLock: semaphore-backed lock for async call sites
//! - SyncLock: timeout-bounded lock for synchronous call sites

pub mod atomic;
pub mod error;
pub mod lock;

pub use atomic::{AtomicBoolean, AtomicLong, AtomicReference, Conflict};
pub use error::UtilError;
pub use lock::{AsyncLock, AsyncLockGuard, SyncLock};

pub type Result<T> = std::result::Result<T, UtilError>;
