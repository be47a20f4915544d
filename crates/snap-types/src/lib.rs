#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unit of committed write visibility.
///
/// Generations only move forward, except for the single step back taken
/// when a scoped write is rolled back.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Distance from `floor` up to `self`, zero when `floor` is ahead.
    #[must_use]
    pub fn delta_from(self, floor: Self) -> u64 {
        self.0.saturating_sub(floor.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Process-unique identity of one dictionary instance.
///
/// Used to key write-lock enlistments in a scope context, so two
/// dictionaries sharing a scope never see each other's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DictionaryId(pub u64);

static NEXT_DICTIONARY_ID: AtomicU64 = AtomicU64::new(1);

impl DictionaryId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn allocate() -> Self {
        Self(NEXT_DICTIONARY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Key under which this dictionary's write lock enlists in a scope context.
    #[must_use]
    pub fn scope_key(self) -> String {
        format!("snap_dictionary:{}", self.0)
    }
}

impl fmt::Display for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dict#{}", self.0)
    }
}
