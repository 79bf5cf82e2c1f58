//! Concurrency primitive errors

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtilError {
    /// A compare-and-swap lost against another writer where a single writer was expected.
    #[error("Concurrency conflict: {context}")]
    ConcurrencyConflict { context: String },

    #[error("Lock not acquired within {timeout:?}")]
    LockTimeout { timeout: Duration },

    #[error("Lock closed")]
    LockClosed,
}

impl UtilError {
    pub fn conflict(context: impl Into<String>) -> Self {
        Self::ConcurrencyConflict { context: context.into() }
    }
}
