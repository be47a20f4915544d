//! Write lock.
//!
//! One writer at a time owns the dictionary's writer slot. A lock taken
//! without a scope context is released (and committed) when the guard
//! drops. A lock taken through a [`ScopeContext`](snap_scope::ScopeContext)
//! is enlisted in it: re-acquiring through the same context returns the
//! same guard, dropping guards does nothing, and the context's
//! `scope_exit(completed)` releases the slot, rolling the generation back
//! when the scope did not complete. Dropping a context that was never
//! exited counts as an incomplete scope.

use crate::{DictInner, SnapDictionary};
use snap_error::{Result, SnapError};
use snap_scope::{Contextual, ScopeContextual, ScopeProvider, get_contextual};
use snap_types::Generation;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Guard returned by [`SnapDictionary::get_scoped_write_lock`].
pub type ScopedWriteLock<K, V> = Contextual<WriterSlot<K, V>>;

/// Ownership of a dictionary's writer slot.
pub struct WriterSlot<K, V> {
    dict: SnapDictionary<K, V>,
    scoped: bool,
    generation: Generation,
    released: AtomicBool,
}

impl<K, V> fmt::Debug for WriterSlot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSlot")
            .field("dictionary", &self.dict.id())
            .field("scoped", &self.scoped)
            .field("generation", &self.generation)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl<K, V> WriterSlot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Generation this writer writes to.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_held(&self) -> Result<()> {
        if self.is_released() {
            return Err(SnapError::NotLocked);
        }
        Ok(())
    }

    /// See [`SnapDictionary::set_locked`].
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] when the guard was released or is used from
    /// a thread that does not own the slot.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        self.ensure_held()?;
        self.dict.set_locked(key, value)
    }

    /// See [`SnapDictionary::clear_locked`].
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] when called from a thread that does not own the slot.
    pub fn clear(&self, key: &K) -> Result<()> {
        self.ensure_held()?;
        self.dict.clear_locked(key)
    }

    /// See [`SnapDictionary::clear_all_locked`].
    ///
    /// # Errors
    ///
    /// [`SnapError::NotLocked`] when called from a thread that does not own the slot.
    pub fn clear_all(&self) -> Result<()> {
        self.ensure_held()?;
        self.dict.clear_all_locked()
    }
}

impl<K, V> ScopeContextual for WriterSlot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn release(&self, completed: bool) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dict.inner.release_writer(completed, self.scoped);
    }
}

impl<K, V> SnapDictionary<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Acquire the write lock, enlisting it in the provider's scope context
    /// when there is one.
    ///
    /// Blocks while another thread holds the lock.
    ///
    /// # Errors
    ///
    /// [`SnapError::RecursiveLock`] when the calling thread already holds
    /// the lock, unless it is re-entering through the same scope context.
    /// [`SnapError::ScopeMismatch`] when the context holds something else
    /// under this dictionary's key.
    pub fn get_scoped_write_lock<P>(&self, provider: &P) -> Result<ScopedWriteLock<K, V>>
    where
        P: ScopeProvider + ?Sized,
    {
        let key = self.inner.id.scope_key();
        get_contextual(provider, &key, |scoped| {
            let generation = self.inner.acquire_writer(scoped)?;
            Ok(WriterSlot {
                dict: self.clone(),
                scoped,
                generation,
                released: AtomicBool::new(false),
            })
        })
    }
}

impl<K, V> DictInner<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn acquire_writer(&self, scoped: bool) -> Result<Generation> {
        let me = thread::current().id();
        let mut gens = self.gens.lock();
        if gens.writer == Some(me) {
            warn!(
                target: "snapcache::dict::lock",
                dictionary = self.id.0,
                scoped,
                "write_lock_recursive"
            );
            return Err(SnapError::RecursiveLock);
        }
        while gens.writer.is_some() {
            self.writer_released.wait(&mut gens);
        }

        gens.writer = Some(me);
        let opened = gens.open_generation(scoped);
        debug!(
            target: "snapcache::dict::lock",
            dictionary = self.id.0,
            scoped,
            live_gen = gens.live_gen.0,
            opened = ?opened,
            "write_lock_acquire"
        );
        Ok(gens.live_gen)
    }

    pub(crate) fn release_writer(&self, completed: bool, scoped: bool) {
        let mut gens = self.gens.lock();
        if !completed {
            let undone = gens.live_gen;
            let restored = gens.rollback_generation();
            let heads_restored = self.rollback_heads(restored);
            info!(
                target: "snapcache::dict::lock",
                dictionary = self.id.0,
                undone_gen = undone.0,
                live_gen = restored.0,
                heads_restored,
                "write_lock_rollback"
            );
        }
        gens.writer = None;
        debug!(
            target: "snapcache::dict::lock",
            dictionary = self.id.0,
            scoped,
            completed,
            live_gen = gens.live_gen.0,
            "write_lock_release"
        );
        drop(gens);
        self.writer_released.notify_one();
    }

    /// Pop every chain head written after `live`, dropping keys left empty.
    fn rollback_heads(&self, live: Generation) -> usize {
        let mut restored = 0_usize;
        self.items.write().retain(|_, cell| {
            let head = cell.load();
            if head.generation() <= live {
                return true;
            }
            restored += 1;
            match head.next() {
                Some(previous) => {
                    cell.publish_arc(previous);
                    true
                }
                None => false,
            }
        });
        restored
    }

    /// Live generation, if the calling thread owns the writer slot.
    pub(crate) fn ensure_locked(&self) -> Result<Generation> {
        let gens = self.gens.lock();
        if gens.writer == Some(thread::current().id()) {
            Ok(gens.live_gen)
        } else {
            Err(SnapError::NotLocked)
        }
    }
}
