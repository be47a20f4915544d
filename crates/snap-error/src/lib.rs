#![forbid(unsafe_code)]
//! Error types for snapcache.
//!
//! # Error Taxonomy
//!
//! The snapshot dictionary is pure in-memory state, so there is no I/O or
//! transient-fault category. What remains falls in two classes:
//!
//! | Variant | Class | Raised by |
//! |---------|-------|-----------|
//! | `RecursiveLock` | Programming | write-lock acquisition on a thread that already holds it |
//! | `NotLocked` | Programming | a `*_locked` mutation without holding the write lock |
//! | `ScopeMismatch` | Programming | a scope context that holds a foreign item under the dictionary's key |
//!
//! "Not found" is never an error: lookups return `Option`.
//!
//! ## Propagation Policy
//!
//! Programming errors propagate synchronously to the caller that attempted
//! the operation. They are never retried or swallowed inside the cache;
//! callers must serialize writers upstream instead of catching and
//! continuing.
//!
//! Collection never produces a `SnapError`. A pass that cannot complete
//! leaves the dictionary valid and is retried on the next trigger.

use thiserror::Error;

/// Unified error type for all snapcache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapError {
    /// The calling thread already holds the dictionary's write lock.
    ///
    /// Raised for a second unscoped acquisition, and for any acquisition
    /// through a different scope context while the lock is held. Re-entry
    /// through the *same* scope context is not an error.
    #[error("recursive write locks are not allowed")]
    RecursiveLock,

    /// A `*_locked` mutation was attempted without holding the write lock.
    #[error("write lock must be acquired")]
    NotLocked,

    /// A scope context returned an enlisted item of an unexpected type.
    #[error("scope context entry {key:?} is not a write lock for this dictionary")]
    ScopeMismatch { key: String },
}

/// Coarse classification of a [`SnapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller bug: fix the call site, do not retry.
    Programming,
}

impl SnapError {
    /// Classify this error.
    ///
    /// The mapping is exhaustive so a new variant cannot be added without
    /// deciding its class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RecursiveLock | Self::NotLocked | Self::ScopeMismatch { .. } => {
                ErrorClass::Programming
            }
        }
    }

    /// Whether retrying the same call could ever succeed without a code change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.class() {
            ErrorClass::Programming => false,
        }
    }
}

/// Result alias using `SnapError`.
pub type Result<T> = std::result::Result<T, SnapError>;
