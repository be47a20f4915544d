//! Generation bookkeeping.
//!
//! [`GenState`] owns every counter that decides which generation a writer
//! writes to and which generation a new snapshot reads: `live_gen`, the
//! `next_gen` flag, the writer slot, and the FIFO of [`GenObj`]s that
//! track snapshot liveness. It is only ever touched under the dictionary's
//! generation mutex, so none of it is atomic.
//!
//! Snapshot liveness is reference counted: each snapshot holds an
//! `Arc<GenRef>`, the queue holds a `Weak<GenRef>`. A `GenObj` is dead once
//! its strong count reaches zero, whether snapshots were disposed or just
//! dropped.

use serde::Serialize;
use snap_types::Generation;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::error;

/// Shared handle pinning one generation for as long as snapshots hold it.
#[derive(Debug)]
pub(crate) struct GenRef {
    generation: Generation,
}

impl GenRef {
    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }
}

/// One queued generation and the (weak) handle its snapshots share.
#[derive(Debug)]
pub(crate) struct GenObj {
    generation: Generation,
    handle: Weak<GenRef>,
}

impl GenObj {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            handle: Weak::new(),
        }
    }

    /// Strong handle for a new snapshot, recreated if every previous one died.
    fn claim(&mut self) -> Arc<GenRef> {
        if let Some(handle) = self.handle.upgrade() {
            return handle;
        }
        let handle = Arc::new(GenRef {
            generation: self.generation,
        });
        self.handle = Arc::downgrade(&handle);
        handle
    }

    pub(crate) fn snapshot_count(&self) -> usize {
        self.handle.strong_count()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.snapshot_count() > 0
    }

    pub(crate) fn info(&self) -> GenObjInfo {
        GenObjInfo {
            generation: self.generation,
            snapshots: self.snapshot_count(),
        }
    }
}

/// Point-in-time view of a queued generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenObjInfo {
    pub generation: Generation,
    pub snapshots: usize,
}

/// How a writer acquisition moved the generation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenerationOpen {
    /// The live generation was already open and unclaimed; writes join it.
    Joined,
    /// `live_gen` advanced because a snapshot had claimed it.
    Advanced,
    /// `live_gen` advanced over an open generation, which was queued first
    /// so readers can keep using it while the writer runs.
    Forced,
}

/// Generation counters, writer slot and snapshot queue.
#[derive(Debug)]
pub(crate) struct GenState {
    pub(crate) live_gen: Generation,
    pub(crate) next_gen: bool,
    pub(crate) floor_gen: Generation,
    /// Set by collection when it trimmed up to an open, unlocked live
    /// generation. The next writer must then force a new generation, so a
    /// snapshot taken during that write is never older than the trim point.
    sealed: bool,
    /// `live_gen` at the last collection pass, used to pace auto-collection.
    pub(crate) last_collect_gen: Generation,
    pub(crate) writer: Option<ThreadId>,
    gen_objs: VecDeque<GenObj>,
}

impl Default for GenState {
    fn default() -> Self {
        Self::new()
    }
}

impl GenState {
    pub(crate) fn new() -> Self {
        Self {
            live_gen: Generation::ZERO,
            next_gen: false,
            floor_gen: Generation::ZERO,
            sealed: false,
            last_collect_gen: Generation::ZERO,
            writer: None,
            gen_objs: VecDeque::new(),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.writer.is_some()
    }

    /// Move the counters for a writer that just took the slot.
    pub(crate) fn open_generation(&mut self, scoped: bool) -> GenerationOpen {
        if !self.next_gen {
            self.live_gen = self.live_gen.next();
            self.next_gen = true;
            self.sealed = false;
            return GenerationOpen::Advanced;
        }
        if scoped || self.sealed {
            let committed = self.live_gen;
            if self.current().is_none_or(|obj| obj.generation != committed) {
                self.gen_objs.push_back(GenObj::new(committed));
            }
            self.live_gen = committed.next();
            self.sealed = false;
            return GenerationOpen::Forced;
        }
        GenerationOpen::Joined
    }

    /// Undo the generation opened by an incomplete scoped writer.
    ///
    /// Returns the generation the dictionary is back at; every chain link
    /// newer than it must be discarded by the caller.
    pub(crate) fn rollback_generation(&mut self) -> Generation {
        self.live_gen = self.live_gen.prev();
        self.next_gen = false;
        self.sealed = false;
        self.live_gen
    }

    /// Register a new snapshot and return its generation handle.
    ///
    /// While a writer holds the slot, snapshots read the last committed
    /// generation (`live_gen - 1`, the writer always has `next_gen` set);
    /// otherwise they read `live_gen` and close it to further joining
    /// writers.
    pub(crate) fn claim_snapshot(&mut self) -> Arc<GenRef> {
        let target = if self.is_locked() && self.next_gen {
            self.live_gen.prev()
        } else {
            self.live_gen
        };

        if self.current().is_none_or(|obj| obj.generation != target) {
            self.gen_objs.push_back(GenObj::new(target));
        }
        if !self.is_locked() {
            self.next_gen = false;
            self.sealed = false;
        }

        self.claim_back(target)
    }

    /// Claim the newest queued generation. The queue is never empty here;
    /// if it is, the snapshot gets a fresh entry for `target`.
    fn claim_back(&mut self, target: Generation) -> Arc<GenRef> {
        if let Some(obj) = self.gen_objs.back_mut() {
            return obj.claim();
        }
        error!(
            target: "snapcache::dict",
            generation = target.0,
            "snapshot_queue_empty"
        );
        let mut obj = GenObj::new(target);
        let handle = obj.claim();
        self.gen_objs.push_back(obj);
        handle
    }

    /// Pop dead generations off the front of the queue, advancing the floor.
    pub(crate) fn retire_dead(&mut self) -> usize {
        let mut retired = 0_usize;
        while self.gen_objs.front().is_some_and(|obj| !obj.is_alive()) {
            if let Some(obj) = self.gen_objs.pop_front() {
                self.floor_gen = obj.generation;
                retired += 1;
            }
        }
        retired
    }

    /// Oldest generation any existing or future snapshot can read.
    ///
    /// Seals the live generation when the horizon reaches it while no
    /// writer runs (see [`GenState::sealed`]).
    pub(crate) fn horizon(&mut self) -> Generation {
        let future = if self.is_locked() && self.next_gen {
            self.live_gen.prev()
        } else {
            if self.next_gen {
                self.sealed = true;
            }
            self.live_gen
        };
        match self.gen_objs.front() {
            Some(oldest) => oldest.generation.min(future),
            None => future,
        }
    }

    pub(crate) fn current(&self) -> Option<&GenObj> {
        self.gen_objs.back()
    }

    pub(crate) fn oldest_alive(&self) -> Option<&GenObj> {
        self.gen_objs.iter().find(|obj| obj.is_alive())
    }

    pub(crate) fn gen_count(&self) -> usize {
        self.gen_objs.len()
    }

    pub(crate) fn snap_count(&self) -> usize {
        self.gen_objs.iter().map(GenObj::snapshot_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn lock(state: &mut GenState) {
        state.writer = Some(thread::current().id());
    }

    #[test]
    fn first_snapshot_claims_generation_zero() {
        let mut state = GenState::new();
        let snap = state.claim_snapshot();
        assert_eq!(snap.generation(), Generation(0));
        assert!(!state.next_gen);
        assert_eq!(state.gen_count(), 1);
        assert_eq!(state.snap_count(), 1);

        // A second snapshot at the same generation shares the handle.
        let again = state.claim_snapshot();
        assert!(Arc::ptr_eq(&snap, &again));
        assert_eq!(state.gen_count(), 1);
        assert_eq!(state.snap_count(), 2);
    }

    #[test]
    fn claim_on_an_empty_queue_recovers_with_a_fresh_entry() {
        let mut state = GenState::new();
        let snap = state.claim_back(Generation(4));
        assert_eq!(snap.generation(), Generation(4));
        assert_eq!(state.gen_count(), 1);
        assert_eq!(state.snap_count(), 1);
        assert_eq!(state.current().map(|obj| obj.generation), Some(Generation(4)));
    }

    #[test]
    fn writer_advances_only_after_a_claim() {
        let mut state = GenState::new();
        assert_eq!(state.open_generation(false), GenerationOpen::Advanced);
        assert_eq!(state.live_gen, Generation(1));
        assert_eq!(state.open_generation(false), GenerationOpen::Joined);
        assert_eq!(state.live_gen, Generation(1));

        let _snap = state.claim_snapshot();
        assert_eq!(state.open_generation(false), GenerationOpen::Advanced);
        assert_eq!(state.live_gen, Generation(2));
    }

    #[test]
    fn scoped_writer_forces_and_queues_the_open_generation() {
        let mut state = GenState::new();
        state.open_generation(false);
        assert!(state.current().is_none());

        assert_eq!(state.open_generation(true), GenerationOpen::Forced);
        assert_eq!(state.live_gen, Generation(2));
        assert!(state.next_gen);
        assert_eq!(state.current().map(|o| o.generation), Some(Generation(1)));

        lock(&mut state);
        let snap = state.claim_snapshot();
        assert_eq!(snap.generation(), Generation(1));
        assert_eq!(state.gen_count(), 1);
        assert!(state.next_gen);
    }

    #[test]
    fn rollback_returns_to_previous_generation() {
        let mut state = GenState::new();
        let _snap = state.claim_snapshot();
        state.open_generation(true);
        lock(&mut state);
        assert_eq!(state.live_gen, Generation(1));

        assert_eq!(state.rollback_generation(), Generation(0));
        state.writer = None;
        assert!(!state.next_gen);
        assert_eq!(state.claim_snapshot().generation(), Generation(0));
        assert_eq!(state.gen_count(), 1);
    }

    #[test]
    fn retire_pops_only_dead_prefix() {
        let mut state = GenState::new();
        let a = state.claim_snapshot();
        state.open_generation(false);
        let b = state.claim_snapshot();
        state.open_generation(false);
        let c = state.claim_snapshot();
        assert_eq!(state.gen_count(), 3);

        drop(b);
        assert_eq!(state.retire_dead(), 0);
        drop(a);
        assert_eq!(state.retire_dead(), 2);
        assert_eq!(state.floor_gen, Generation(1));
        assert_eq!(state.gen_count(), 1);
        assert_eq!(state.oldest_alive().map(|o| o.generation), Some(c.generation()));
    }

    #[test]
    fn horizon_tracks_oldest_snapshot_and_writer() {
        let mut state = GenState::new();
        state.open_generation(false);
        let one = state.claim_snapshot();
        state.open_generation(false);
        lock(&mut state);
        assert_eq!(state.horizon(), Generation(1));

        drop(one);
        state.retire_dead();
        assert_eq!(state.horizon(), Generation(1));
        assert!(!state.sealed);

        state.writer = None;
        assert_eq!(state.horizon(), Generation(2));
        assert!(state.sealed);
    }

    #[test]
    fn sealed_generation_forces_the_next_unscoped_writer() {
        let mut state = GenState::new();
        state.open_generation(false);
        assert_eq!(state.horizon(), Generation(1));

        assert_eq!(state.open_generation(false), GenerationOpen::Forced);
        lock(&mut state);
        assert_eq!(state.claim_snapshot().generation(), Generation(1));
    }
}
