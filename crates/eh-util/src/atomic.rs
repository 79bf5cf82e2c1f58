//! Atomic cells
//!
//! `AtomicReference` holds an `Arc<T>` and swaps it as a unit. Readers get the
//! snapshot that was current when they called `load()` and keep it for as long
//! as they hold the `Arc`, so a swap never exposes a half-written value.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::UtilError;

/// Rejected compare-and-swap: the slot held a different value than expected.
pub struct Conflict<T> {
    /// Value currently held by the slot
    pub current: Arc<T>,
    /// Update that was not applied
    pub rejected: Arc<T>,
}

impl<T> fmt::Debug for Conflict<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conflict").finish_non_exhaustive()
    }
}

impl<T> From<Conflict<T>> for UtilError {
    fn from(_: Conflict<T>) -> Self {
        UtilError::conflict(format!(
            "compare-and-swap on AtomicReference<{}> lost to another writer",
            std::any::type_name::<T>()
        ))
    }
}

/// Shared slot holding an `Arc<T>`
pub struct AtomicReference<T> {
    slot: RwLock<Arc<T>>,
}

impl<T> AtomicReference<T> {
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc(value: Arc<T>) -> Self {
        Self { slot: RwLock::new(value) }
    }

    /// Current value
    pub fn load(&self) -> Arc<T> {
        self.slot.read().clone()
    }

    /// Replace the value unconditionally
    pub fn store(&self, value: Arc<T>) {
        *self.slot.write() = value;
    }

    /// Replace the value and return the previous one
    pub fn swap(&self, value: Arc<T>) -> Arc<T> {
        std::mem::replace(&mut *self.slot.write(), value)
    }

    /// Install `update` iff the slot still holds `expected` (compared by identity).
    ///
    /// Returns the replaced value on success. On conflict nothing changes and the
    /// caller decides whether to retry against `Conflict::current` or fail.
    pub fn compare_and_swap(&self, expected: &Arc<T>, update: Arc<T>) -> Result<Arc<T>, Conflict<T>> {
        let mut slot = self.slot.write();
        if Arc::ptr_eq(&slot, expected) {
            Ok(std::mem::replace(&mut *slot, update))
        } else {
            Err(Conflict {
                current: slot.clone(),
                rejected: update,
            })
        }
    }

    pub fn compare_and_set(&self, expected: &Arc<T>, update: Arc<T>) -> bool {
        self.compare_and_swap(expected, update).is_ok()
    }
}

impl<T: Default> Default for AtomicReference<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicReference").field(&self.load()).finish()
    }
}

/// Lock-free boolean flag
#[derive(Debug, Default)]
pub struct AtomicBoolean {
    value: AtomicBool,
}

impl AtomicBoolean {
    pub fn new(value: bool) -> Self {
        Self { value: AtomicBool::new(value) }
    }

    pub fn get(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Set a new value and return the previous one
    pub fn get_and_set(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::SeqCst)
    }

    pub fn compare_and_set(&self, expected: bool, update: bool) -> bool {
        self.value
            .compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Lock-free 64-bit signed counter
#[derive(Debug, Default)]
pub struct AtomicLong {
    value: AtomicI64,
}

impl AtomicLong {
    pub fn new(value: i64) -> Self {
        Self { value: AtomicI64::new(value) }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Increment and return the new value
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Add `delta` and return the new value
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn compare_and_set(&self, expected: i64, update: i64) -> bool {
        self.value
            .compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Raise the value to `candidate` if it is larger. Returns true if the value moved.
    pub fn advance_to(&self, candidate: i64) -> bool {
        let mut current = self.get();
        while candidate > current {
            match self.value.compare_exchange_weak(current, candidate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_atomic_boolean_compare_and_set() {
        let flag = AtomicBoolean::new(true);

        assert!(flag.compare_and_set(true, false));
        assert!(!flag.get());

        // Current value is false, so expecting true fails and leaves it alone
        assert!(!flag.compare_and_set(true, true));
        assert!(!flag.get());

        assert!(flag.compare_and_set(false, true));
        assert!(flag.get());
    }

    #[test]
    fn test_atomic_boolean_get_and_set() {
        let flag = AtomicBoolean::default();
        assert!(!flag.get_and_set(true));
        assert!(flag.get_and_set(true));
    }

    #[test]
    fn test_atomic_long_counters() {
        let counter = AtomicLong::new(5);
        assert_eq!(counter.increment(), 6);
        assert_eq!(counter.add(-2), 4);
        assert!(counter.compare_and_set(4, 10));
        assert!(!counter.compare_and_set(4, 11));
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn test_atomic_long_advance_to_never_regresses() {
        let offset = AtomicLong::new(0);
        assert!(offset.advance_to(7));
        assert!(!offset.advance_to(3));
        assert!(!offset.advance_to(7));
        assert_eq!(offset.get(), 7);
    }

    #[test]
    fn test_atomic_long_concurrent_increments() {
        let counter = Arc::new(AtomicLong::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_atomic_reference_compare_and_swap() {
        let reference = AtomicReference::new(vec![1, 2]);
        let original = reference.load();

        let previous = reference.compare_and_swap(&original, Arc::new(vec![3])).unwrap();
        assert!(Arc::ptr_eq(&previous, &original));
        assert_eq!(*reference.load(), vec![3]);

        // Stale expectation: same contents, different identity
        let stale = Arc::new(vec![3]);
        let conflict = reference.compare_and_swap(&stale, Arc::new(vec![4])).unwrap_err();
        assert_eq!(*conflict.current, vec![3]);
        assert_eq!(*conflict.rejected, vec![4]);
        assert_eq!(*reference.load(), vec![3]);

        let err: UtilError = conflict.into();
        assert!(matches!(err, UtilError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn test_atomic_reference_snapshot_survives_swap() {
        let reference = AtomicReference::new(String::from("first"));
        let snapshot = reference.load();
        let previous = reference.swap(Arc::new(String::from("second")));

        assert_eq!(snapshot.as_str(), "first");
        assert!(Arc::ptr_eq(&snapshot, &previous));
        assert_eq!(reference.load().as_str(), "second");
    }
}
