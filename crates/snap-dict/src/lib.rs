#![forbid(unsafe_code)]
//! Generational snapshot dictionary.
//!
//! [`SnapDictionary`] is an in-memory multi-version map built for a
//! read-mostly workload: many readers take cheap [`Snapshot`]s and read a
//! frozen generation of the data, while a single writer at a time commits
//! new content under a write lock.
//!
//! Every key owns a newest-first chain of generation-tagged values. A
//! snapshot at generation `G` sees, for each key, the newest value written
//! at a generation `<= G`. Writers never mutate a published value; they
//! publish a new chain head instead. [`collect`](SnapDictionary::collect)
//! trims chain links that no live or future snapshot can reach.
//!
//! # Example
//!
//! ```
//! use snap_dict::SnapDictionary;
//!
//! let dict = SnapDictionary::<u32, String>::new();
//! dict.set(1, "one".to_owned()).unwrap();
//! let before = dict.create_snapshot();
//!
//! dict.set(1, "uno".to_owned()).unwrap();
//! let after = dict.create_snapshot();
//!
//! assert_eq!(before.get(&1).as_deref().map(String::as_str), Some("one"));
//! assert_eq!(after.get(&1).as_deref().map(String::as_str), Some("uno"));
//! ```
//!
//! # Logging
//!
//! - **TRACE** `snapcache::dict`: `dict_read`: point lookup against a snapshot
//! - **DEBUG** `snapcache::dict`: `snapshot_create` / `snapshot_drop`
//! - **DEBUG** `snapcache::dict::lock`: `write_lock_acquire` / `write_lock_release`
//! - **INFO**  `snapcache::dict::lock`: `write_lock_rollback`: incomplete scope undone
//! - **INFO**  `snapcache::dict::collect`: `collect_pass`: pass summary
//! - **WARN**  `snapcache::dict::collect`: `chain_too_long`: chain length over `chain_warn_len`
//! - **WARN**  `snapcache::dict::lock`: `write_lock_recursive`: same-thread re-acquisition
//! - **ERROR** `snapcache::dict`: `snapshot_queue_empty`: snapshot claimed with no queued generation, recovered

mod chain;
pub mod collect;
pub mod config;
pub mod demo;
mod generation;
mod lock;
mod snapshot;

pub use collect::{CollectReport, CollectTask};
pub use config::SnapConfig;
pub use generation::GenObjInfo;
pub use lock::{ScopedWriteLock, WriterSlot};
pub use snap_error::{Result, SnapError};
pub use snap_scope::{NoScope, ScopeContext, ScopeProvider};
pub use snap_types::{DictionaryId, Generation};
pub use snapshot::Snapshot;

use chain::{ChainHead, ValueLink};
use generation::GenState;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Shared state behind every handle to one dictionary.
pub(crate) struct DictInner<K, V> {
    id: DictionaryId,
    config: SnapConfig,
    collect_auto: AtomicBool,
    items: RwLock<BTreeMap<K, Arc<ChainHead<V>>>>,
    gens: Mutex<GenState>,
    writer_released: Condvar,
    collect_task: Mutex<Option<CollectTask>>,
    pass_lock: Mutex<()>,
}

/// Result of applying one write to an existing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    /// The key's only link was written in the live generation and is now
    /// cleared: the key must leave the map.
    RemoveKey,
}

fn apply_write<V>(cell: &ChainHead<V>, value: Option<Arc<V>>, live: Generation) -> Applied {
    let current = cell.load();
    if current.generation() < live {
        if !(current.is_tombstone() && value.is_none()) {
            cell.publish(ValueLink::new(live, value, Some(current)));
        }
        return Applied::Done;
    }

    // The head was written in this generation and no snapshot can see it
    // yet: replace it, keeping the older links.
    let next = current.next();
    match (value, next) {
        (None, None) => Applied::RemoveKey,
        (None, Some(older)) if older.is_tombstone() => {
            cell.publish_arc(older);
            Applied::Done
        }
        (value, next) => {
            cell.publish(ValueLink::new(live, value, next));
            Applied::Done
        }
    }
}

impl<K, V> DictInner<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(config: SnapConfig) -> Self {
        Self {
            id: DictionaryId::allocate(),
            config,
            collect_auto: AtomicBool::new(config.collect_auto),
            items: RwLock::new(BTreeMap::new()),
            gens: Mutex::new(GenState::new()),
            writer_released: Condvar::new(),
            collect_task: Mutex::new(None),
            pass_lock: Mutex::new(()),
        }
    }

    fn write_value(&self, key: &K, value: Option<Arc<V>>, live: Generation) {
        {
            // Publishing under the read lock keeps collection from removing
            // the key between the head load and the publish.
            let items = self.items.read();
            match items.get(key) {
                Some(cell) => {
                    if apply_write(cell, value.clone(), live) == Applied::Done {
                        return;
                    }
                }
                None if value.is_none() => return,
                None => {}
            }
        }

        let mut items = self.items.write();
        match items.entry(key.clone()) {
            Entry::Vacant(slot) => {
                if let Some(value) = value {
                    slot.insert(Arc::new(ChainHead::new(ValueLink::new(
                        live,
                        Some(value),
                        None,
                    ))));
                }
            }
            Entry::Occupied(slot) => {
                if apply_write(slot.get(), value, live) == Applied::RemoveKey {
                    slot.remove();
                }
            }
        }
    }

    pub(crate) fn read(&self, key: &K, generation: Generation) -> Option<Arc<V>> {
        let head = self.items.read().get(key).map(|cell| cell.load())?;
        let value = ValueLink::visible_at(&head, generation)?.value().cloned();
        trace!(
            target: "snapcache::dict",
            dictionary = self.id.0,
            generation = generation.0,
            found = value.is_some(),
            "dict_read"
        );
        value
    }

    /// Current heads in key order, captured under one read lock.
    pub(crate) fn heads(&self) -> Vec<Arc<ValueLink<V>>> {
        self.items.read().values().map(|cell| cell.load()).collect()
    }

    fn should_auto_collect(&self, gens: &GenState) -> bool {
        if !self.collect_auto.load(Ordering::Relaxed) {
            return false;
        }
        let since = gens.floor_gen.max(gens.last_collect_gen);
        gens.live_gen.delta_from(since) > self.config.collect_min_gen_delta
    }
}

/// A generational snapshot dictionary.
///
/// Cloning yields another handle to the same dictionary.
pub struct SnapDictionary<K, V> {
    inner: Arc<DictInner<K, V>>,
}

impl<K, V> Clone for SnapDictionary<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for SnapDictionary<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gens = self.inner.gens.lock();
        f.debug_struct("SnapDictionary")
            .field("id", &self.inner.id)
            .field("live_gen", &gens.live_gen)
            .field("next_gen", &gens.next_gen)
            .field("keys", &self.inner.items.read().len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for SnapDictionary<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SnapDictionary<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SnapConfig::default())
    }

    #[must_use]
    pub fn with_config(config: SnapConfig) -> Self {
        let inner = DictInner::new(config);
        debug!(
            target: "snapcache::dict",
            dictionary = inner.id.0,
            collect_auto = config.collect_auto,
            collect_min_gen_delta = config.collect_min_gen_delta,
            "dict_create"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    #[must_use]
    pub fn id(&self) -> DictionaryId {
        self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> SnapConfig {
        self.inner.config
    }

    /// Turn automatic collection on or off for this dictionary.
    pub fn set_collect_auto(&self, enabled: bool) {
        self.inner.collect_auto.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn collect_auto(&self) -> bool {
        self.inner.collect_auto.load(Ordering::Relaxed)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Set `key` to `value` in the live generation.
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] unless the calling thread holds the write lock.
    pub fn set_locked(&self, key: K, value: V) -> Result<()> {
        let live = self.inner.ensure_locked()?;
        self.inner.write_value(&key, Some(Arc::new(value)), live);
        Ok(())
    }

    /// Clear `key` in the live generation. Clearing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] unless the calling thread holds the write lock.
    pub fn clear_locked(&self, key: &K) -> Result<()> {
        let live = self.inner.ensure_locked()?;
        self.inner.write_value(key, None, live);
        Ok(())
    }

    /// Clear every key in the live generation.
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] unless the calling thread holds the write lock.
    pub fn clear_all_locked(&self) -> Result<()> {
        let live = self.inner.ensure_locked()?;
        let keys: Vec<K> = self.inner.items.read().keys().cloned().collect();
        for key in &keys {
            self.inner.write_value(key, None, live);
        }
        Ok(())
    }

    /// Take an unscoped write lock, set, release.
    ///
    /// # Errors
    ///
    /// [`SnapError::RecursiveLock`] if this thread already holds the lock.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        let _lock = self.get_scoped_write_lock(&NoScope)?;
        self.set_locked(key, value)
    }

    /// Take an unscoped write lock, clear `key`, release.
    ///
    /// # Errors
    ///
    /// [`SnapError::RecursiveLock`] if this thread already holds the lock.
    pub fn clear(&self, key: &K) -> Result<()> {
        let _lock = self.get_scoped_write_lock(&NoScope)?;
        self.clear_locked(key)
    }

    /// Take an unscoped write lock, clear everything, release.
    ///
    /// # Errors
    ///
    /// [`SnapError::RecursiveLock`] if this thread already holds the lock.
    pub fn clear_all(&self) -> Result<()> {
        let _lock = self.get_scoped_write_lock(&NoScope)?;
        self.clear_all_locked()
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Freeze the current committed generation for reading.
    ///
    /// While another writer holds the lock the snapshot reads the last
    /// committed generation; the in-flight one stays invisible.
    pub fn create_snapshot(&self) -> Snapshot<K, V> {
        let (handle, live_gen, collect) = {
            let mut gens = self.inner.gens.lock();
            let handle = gens.claim_snapshot();
            let collect = self.inner.should_auto_collect(&gens);
            (handle, gens.live_gen, collect)
        };
        debug!(
            target: "snapcache::dict",
            dictionary = self.inner.id.0,
            generation = handle.generation().0,
            live_gen = live_gen.0,
            "snapshot_create"
        );
        if collect {
            self.collect_async();
        }
        Snapshot::tracked(self.clone(), handle)
    }

    /// An untracked snapshot of the live generation, in-flight writes included.
    ///
    /// It does not pin anything for collection; meant for the writer and
    /// for diagnostics.
    pub fn live_snapshot(&self) -> Snapshot<K, V> {
        let live = self.inner.gens.lock().live_gen;
        Snapshot::untracked(self.clone(), live)
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    #[must_use]
    pub fn live_gen(&self) -> Generation {
        self.inner.gens.lock().live_gen
    }

    #[must_use]
    pub fn next_gen(&self) -> bool {
        self.inner.gens.lock().next_gen
    }

    #[must_use]
    pub fn floor_gen(&self) -> Generation {
        self.inner.gens.lock().floor_gen
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.gens.lock().is_locked()
    }

    /// Queued generations, dead or alive, not yet retired by collection.
    #[must_use]
    pub fn gen_count(&self) -> usize {
        self.inner.gens.lock().gen_count()
    }

    /// Snapshots currently alive.
    #[must_use]
    pub fn snap_count(&self) -> usize {
        self.inner.gens.lock().snap_count()
    }

    /// Keys in the map, including cleared keys not yet collected.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.items.read().len()
    }

    /// Every link of `key`'s chain as `(generation, value)`, newest first.
    #[must_use]
    pub fn chain(&self, key: &K) -> Vec<(Generation, Option<Arc<V>>)> {
        self.inner
            .items
            .read()
            .get(key)
            .map(|cell| ValueLink::entries(&cell.load()))
            .unwrap_or_default()
    }

    /// The most recently queued generation, reused by new snapshots.
    #[must_use]
    pub fn current_gen_obj(&self) -> Option<GenObjInfo> {
        self.inner.gens.lock().current().map(generation::GenObj::info)
    }

    /// The oldest queued generation that still has snapshots.
    #[must_use]
    pub fn oldest_gen_obj_alive(&self) -> Option<GenObjInfo> {
        self.inner
            .gens
            .lock()
            .oldest_alive()
            .map(generation::GenObj::info)
    }

    #[must_use]
    pub fn diagnostics(&self) -> SnapDiagnostics {
        let (live_gen, next_gen, floor_gen, locked, gen_count, snap_count) = {
            let gens = self.inner.gens.lock();
            (
                gens.live_gen,
                gens.next_gen,
                gens.floor_gen,
                gens.is_locked(),
                gens.gen_count(),
                gens.snap_count(),
            )
        };
        let collecting = self
            .inner
            .collect_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        SnapDiagnostics {
            dictionary: self.inner.id,
            live_gen,
            next_gen,
            floor_gen,
            locked,
            gen_count,
            snap_count,
            key_count: self.count(),
            collecting,
        }
    }
}

/// Point-in-time counters for one dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapDiagnostics {
    pub dictionary: DictionaryId,
    pub live_gen: Generation,
    pub next_gen: bool,
    pub floor_gen: Generation,
    pub locked: bool,
    pub gen_count: usize,
    pub snap_count: usize,
    pub key_count: usize,
    pub collecting: bool,
}
