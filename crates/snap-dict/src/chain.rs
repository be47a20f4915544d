//! Per-key value chains.
//!
//! Every key owns a newest-first chain of [`ValueLink`]s, one per
//! generation in which the key changed. The chain head lives in a
//! [`ChainHead`], an RCU cell backed by [`arc_swap::ArcSwap`]: readers load
//! the head without locking, the writer publishes a new head atomically.
//!
//! Links are immutable once published except for their `next` pointer,
//! which collection may repoint to `None` to unlink a tail no reader can
//! reach. Nothing is ever edited in place, so a reader that already holds a
//! link keeps a consistent view of everything it can still reach.
//!
//! # Invariants
//!
//! - Generations strictly decrease from head to tail.
//! - A `None` value is a tombstone: "cleared at this generation", which is
//!   different from the key having no link at all.

use arc_swap::{ArcSwap, ArcSwapOption};
use snap_types::Generation;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── ValueLink ──────────────────────────────────────────────────────────────

/// One generation-tagged value (or tombstone) in a key's chain.
pub(crate) struct ValueLink<V> {
    generation: Generation,
    value: Option<Arc<V>>,
    next: ArcSwapOption<ValueLink<V>>,
}

impl<V: fmt::Debug> fmt::Debug for ValueLink<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueLink")
            .field("generation", &self.generation)
            .field("value", &self.value)
            .field("has_next", &self.next.load().is_some())
            .finish()
    }
}

impl<V> ValueLink<V> {
    pub(crate) fn new(
        generation: Generation,
        value: Option<Arc<V>>,
        next: Option<Arc<ValueLink<V>>>,
    ) -> Self {
        debug_assert!(
            next.as_ref().is_none_or(|n| n.generation < generation),
            "chain generations must strictly decrease"
        );
        Self {
            generation,
            value,
            next: ArcSwapOption::new(next),
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    pub(crate) fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }

    #[inline]
    pub(crate) fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<Arc<ValueLink<V>>> {
        self.next.load_full()
    }

    /// Unlink everything older than this link, returning the detached tail.
    pub(crate) fn cut_next(&self) -> Option<Arc<ValueLink<V>>> {
        self.next.swap(None)
    }

    /// The newest link visible at `generation`, starting from `head`.
    pub(crate) fn visible_at(head: &Arc<Self>, generation: Generation) -> Option<Arc<Self>> {
        let mut link = Arc::clone(head);
        while link.generation > generation {
            link = link.next()?;
        }
        Some(link)
    }

    /// Number of links reachable from `from`, inclusive.
    pub(crate) fn chain_len(from: Option<&Arc<Self>>) -> usize {
        let mut len = 0_usize;
        let mut cursor = from.cloned();
        while let Some(link) = cursor {
            len += 1;
            cursor = link.next();
        }
        len
    }

    /// `(generation, value)` pairs, newest first.
    pub(crate) fn entries(head: &Arc<Self>) -> Vec<(Generation, Option<Arc<V>>)> {
        let mut out = Vec::new();
        let mut cursor = Some(Arc::clone(head));
        while let Some(link) = cursor {
            out.push((link.generation, link.value.clone()));
            cursor = link.next();
        }
        out
    }
}

impl<V> Drop for ValueLink<V> {
    // Unwind the tail iteratively so dropping a long chain cannot overflow
    // the stack through nested `Arc` drops.
    fn drop(&mut self) {
        let mut next = self.next.swap(None);
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(owned) => next = owned.next.swap(None),
                Err(_) => break,
            }
        }
    }
}

// ─── Trimming ───────────────────────────────────────────────────────────────

/// Outcome of trimming one chain against a collection horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trim {
    /// The chain stays; `pruned` links were unlinked, `kept` remain.
    Keep { kept: usize, pruned: usize },
    /// The head is a tombstone at or below the horizon: the key can go.
    Remove,
}

/// Unlink every link no reader at a generation `>= horizon` can reach.
///
/// Keeps all links newer than `horizon` plus the newest link at or below
/// it, because that one answers lookups for generations between it and
/// the next newer link. A tombstone in that position is dropped as well:
/// falling off the end of a chain already reads as absent.
pub(crate) fn trim<V>(head: &Arc<ValueLink<V>>, horizon: Generation) -> Trim {
    if head.generation <= horizon {
        if head.is_tombstone() {
            return Trim::Remove;
        }
        let pruned = ValueLink::chain_len(head.cut_next().as_ref());
        return Trim::Keep { kept: 1, pruned };
    }

    let mut kept = 1_usize;
    let mut link = Arc::clone(head);
    loop {
        let Some(next) = link.next() else {
            return Trim::Keep { kept, pruned: 0 };
        };
        if next.generation > horizon {
            kept += 1;
            link = next;
            continue;
        }
        let pruned = if next.is_tombstone() {
            ValueLink::chain_len(link.cut_next().as_ref())
        } else {
            kept += 1;
            ValueLink::chain_len(next.cut_next().as_ref())
        };
        return Trim::Keep { kept, pruned };
    }
}

// ─── ChainHead ──────────────────────────────────────────────────────────────

/// RCU cell holding the head of one key's chain.
///
/// Readers call [`load`](Self::load) and walk the returned link without
/// any lock. The single writer publishes with [`publish`](Self::publish);
/// readers that loaded the old head keep seeing it until they drop it.
pub(crate) struct ChainHead<V> {
    inner: ArcSwap<ValueLink<V>>,
    update_count: AtomicU64,
}

impl<V: fmt::Debug> fmt::Debug for ChainHead<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHead")
            .field("head", &*self.load())
            .field("update_count", &self.update_count())
            .finish()
    }
}

impl<V> ChainHead<V> {
    pub(crate) fn new(link: ValueLink<V>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(link),
            update_count: AtomicU64::new(0),
        }
    }

    /// Load the current head as a full `Arc`, safe to hold while walking.
    #[inline]
    pub(crate) fn load(&self) -> Arc<ValueLink<V>> {
        self.inner.load_full()
    }

    /// Atomically publish a new head.
    pub(crate) fn publish(&self, link: ValueLink<V>) {
        self.publish_arc(Arc::new(link));
    }

    /// Atomically publish an existing link as the head (rollback path).
    pub(crate) fn publish_arc(&self, link: Arc<ValueLink<V>>) {
        self.inner.store(link);
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of publishes since creation.
    pub(crate) fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}
