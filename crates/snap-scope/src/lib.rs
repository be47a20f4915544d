#![forbid(unsafe_code)]
//! Scope contexts: explicit unit-of-work objects with deferred completion.
//!
//! A [`ScopeContext`] is created by whatever owns the transaction (a
//! repository layer, a request handler, a test) and handed down the call
//! chain explicitly through a [`ScopeProvider`]. Components that need to
//! defer work until the unit of work ends *enlist* into the context under a
//! string key; enlisting the same key twice returns the item created the
//! first time. When the owner calls [`ScopeContext::scope_exit`], every
//! enlisted callback runs once, in priority order, with the completion flag.
//! A context dropped without exiting runs them as incomplete.
//!
//! [`get_contextual`] packages the common pattern: with no context the
//! caller gets a plain owned value released on drop; with a context the
//! value is enlisted and released only when the scope exits.
//!
//! # Logging
//!
//! - **DEBUG** `snapcache::scope`: `scope_enlist`: a new key enlisted
//! - **TRACE** `snapcache::scope`: `scope_enlist_reuse`: an existing key returned
//! - **DEBUG** `snapcache::scope`: `scope_exit`: callbacks about to run
//! - **DEBUG** `snapcache::scope`: `scope_enlist_lost_race`: a concurrent enlist won the key
//! - **WARN**  `snapcache::scope`: `scope_dropped_unexited`: pending items rolled back on drop

use parking_lot::Mutex;
use snap_error::{Result, SnapError};
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Priority used when a caller has no ordering preference.
pub const DEFAULT_PRIORITY: i32 = 100;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

type ExitAction = Box<dyn FnOnce(bool) + Send>;

struct Enlisted {
    key: String,
    priority: i32,
    item: Arc<dyn Any + Send + Sync>,
    on_exit: ExitAction,
}

/// A unit-of-work context that collects deferred completion callbacks.
pub struct ScopeContext {
    id: u64,
    entries: Mutex<Vec<Enlisted>>,
}

impl fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ScopeContext")
            .field("id", &self.id)
            .field(
                "keys",
                &entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for ScopeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for the shared form providers hand out.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enlist an item under `key`, or return the one already enlisted.
    ///
    /// `create` runs only when `key` is not enlisted yet; if it fails
    /// nothing is enlisted. `create` runs without the context locked and
    /// may block. If another enlistment of `key` lands while it runs, that
    /// one is kept and `on_exit(&created, false)` runs immediately.
    /// Otherwise `on_exit` runs once, from [`scope_exit`](Self::scope_exit)
    /// or when the context is dropped.
    ///
    /// # Errors
    ///
    /// Propagates the error from `create`, or returns
    /// [`SnapError::ScopeMismatch`] when `key` already holds an item of a
    /// different type.
    pub fn enlist<T, C, A>(&self, key: &str, priority: i32, create: C, on_exit: A) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        C: FnOnce() -> Result<T>,
        A: FnOnce(&T, bool) + Send + 'static,
    {
        if let Some(existing) = self.lookup(key) {
            trace!(target: "snapcache::scope", scope = self.id, key, "scope_enlist_reuse");
            return downcast_item(existing, key);
        }

        let item = Arc::new(create()?);

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter().find(|e| e.key == key) {
            let existing = Arc::clone(&existing.item);
            drop(entries);
            debug!(target: "snapcache::scope", scope = self.id, key, "scope_enlist_lost_race");
            on_exit(&*item, false);
            return downcast_item(existing, key);
        }

        let for_exit = Arc::clone(&item);
        entries.push(Enlisted {
            key: key.to_owned(),
            priority,
            item: Arc::clone(&item) as Arc<dyn Any + Send + Sync>,
            on_exit: Box::new(move |completed| on_exit(&*for_exit, completed)),
        });
        debug!(
            target: "snapcache::scope",
            scope = self.id,
            key,
            priority,
            enlisted = entries.len(),
            "scope_enlist"
        );
        Ok(item)
    }

    fn lookup(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.key == key)
            .map(|e| Arc::clone(&e.item))
    }

    /// Whether `key` is currently enlisted.
    #[must_use]
    pub fn is_enlisted(&self, key: &str) -> bool {
        self.entries.lock().iter().any(|e| e.key == key)
    }

    /// Number of pending enlistments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// End the unit of work.
    ///
    /// Drains every enlistment and runs its callback with `completed`,
    /// lowest priority value first; equal priorities run in enlistment
    /// order. The context is empty afterwards and may be reused.
    pub fn scope_exit(&self, completed: bool) {
        let mut drained = std::mem::take(&mut *self.entries.lock());
        drained.sort_by_key(|e| e.priority);
        debug!(
            target: "snapcache::scope",
            scope = self.id,
            completed,
            callbacks = drained.len(),
            "scope_exit"
        );
        for entry in drained {
            (entry.on_exit)(completed);
        }
    }
}

impl Drop for ScopeContext {
    /// A context dropped without [`scope_exit`](Self::scope_exit) ends
    /// its unit of work as incomplete.
    fn drop(&mut self) {
        let pending = self.entries.get_mut().len();
        if pending > 0 {
            warn!(
                target: "snapcache::scope",
                scope = self.id,
                pending,
                "scope_dropped_unexited"
            );
            self.scope_exit(false);
        }
    }
}

fn downcast_item<T>(item: Arc<dyn Any + Send + Sync>, key: &str) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
{
    item.downcast::<T>().map_err(|_| SnapError::ScopeMismatch {
        key: key.to_owned(),
    })
}

/// Supplies the (optional) scope context for an operation.
pub trait ScopeProvider {
    fn context(&self) -> Option<&Arc<ScopeContext>>;
}

/// Provider with no ambient unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScope;

impl ScopeProvider for NoScope {
    fn context(&self) -> Option<&Arc<ScopeContext>> {
        None
    }
}

impl ScopeProvider for Arc<ScopeContext> {
    fn context(&self) -> Option<&Arc<ScopeContext>> {
        Some(self)
    }
}

impl ScopeProvider for Option<Arc<ScopeContext>> {
    fn context(&self) -> Option<&Arc<ScopeContext>> {
        self.as_ref()
    }
}

impl<P: ScopeProvider + ?Sized> ScopeProvider for &P {
    fn context(&self) -> Option<&Arc<ScopeContext>> {
        (**self).context()
    }
}

/// Something that must be released exactly once when its unit of work ends.
pub trait ScopeContextual: Send + Sync + 'static {
    fn release(&self, completed: bool);
}

/// Handle returned by [`get_contextual`].
///
/// `Unscoped` owns its value and releases it (completed) on drop.
/// `Scoped` shares the enlisted value; dropping the handle does nothing,
/// the scope context releases it on exit.
pub enum Contextual<T: ScopeContextual> {
    Unscoped(T),
    Scoped(Arc<T>),
}

impl<T: ScopeContextual> Contextual<T> {
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        matches!(self, Self::Scoped(_))
    }

    /// True when both handles refer to the same enlisted instance.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Scoped(a), Self::Scoped(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T: ScopeContextual> Deref for Contextual<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Unscoped(inner) => inner,
            Self::Scoped(inner) => &**inner,
        }
    }
}

impl<T: ScopeContextual> Drop for Contextual<T> {
    fn drop(&mut self) {
        if let Self::Unscoped(inner) = self {
            inner.release(true);
        }
    }
}

impl<T: ScopeContextual + fmt::Debug> fmt::Debug for Contextual<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unscoped(inner) => f.debug_tuple("Unscoped").field(inner).finish(),
            Self::Scoped(inner) => f.debug_tuple("Scoped").field(inner).finish(),
        }
    }
}

/// Get a scope-contextual value for `key`.
///
/// `create` receives `true` when the value will be enlisted in a context.
///
/// # Errors
///
/// Propagates errors from `create` and [`ScopeContext::enlist`].
pub fn get_contextual<P, T, F>(provider: &P, key: &str, create: F) -> Result<Contextual<T>>
where
    P: ScopeProvider + ?Sized,
    T: ScopeContextual,
    F: FnOnce(bool) -> Result<T>,
{
    match provider.context() {
        None => create(false).map(Contextual::Unscoped),
        Some(context) => context
            .enlist(
                key,
                DEFAULT_PRIORITY,
                || create(true),
                |item: &T, completed| item.release(completed),
            )
            .map(Contextual::Scoped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        releases: Mutex<Vec<bool>>,
    }

    impl ScopeContextual for Arc<Recorder> {
        fn release(&self, completed: bool) {
            self.releases.lock().push(completed);
        }
    }

    #[test]
    fn enlisting_same_key_returns_same_item() {
        let context = ScopeContext::new();
        let created = AtomicUsize::new(0);

        let a = context
            .enlist(
                "k",
                DEFAULT_PRIORITY,
                || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(5_u32)
                },
                |_, _| {},
            )
            .expect("first enlist");
        let b = context
            .enlist(
                "k",
                DEFAULT_PRIORITY,
                || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(6_u32)
                },
                |_, _| {},
            )
            .expect("second enlist");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 5);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn enlisting_with_a_different_type_is_rejected() {
        let context = ScopeContext::new();
        context
            .enlist("k", DEFAULT_PRIORITY, || Ok(1_u32), |_, _| {})
            .expect("enlist u32");

        let err = context
            .enlist("k", DEFAULT_PRIORITY, || Ok("text"), |_, _| {})
            .expect_err("type mismatch");
        assert_eq!(err, SnapError::ScopeMismatch { key: "k".into() });
    }

    #[test]
    fn failed_creation_enlists_nothing() {
        let context = ScopeContext::new();
        let err = context
            .enlist::<u32, _, _>("k", DEFAULT_PRIORITY, || Err(SnapError::RecursiveLock), |_, _| {})
            .expect_err("create fails");
        assert_eq!(err, SnapError::RecursiveLock);
        assert!(!context.is_enlisted("k"));
    }

    #[test]
    fn scope_exit_runs_callbacks_by_priority_with_flag() {
        let context = ScopeContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (key, priority) in [("late", 200), ("early", 10), ("default", DEFAULT_PRIORITY)] {
            let order = Arc::clone(&order);
            context
                .enlist(key, priority, || Ok(()), move |_, completed| {
                    order.lock().push((key, completed));
                })
                .expect("enlist");
        }

        context.scope_exit(false);

        assert_eq!(
            *order.lock(),
            vec![("early", false), ("default", false), ("late", false)]
        );
        assert!(context.is_empty());

        // Drained: a second exit runs nothing.
        context.scope_exit(true);
        assert_eq!(order.lock().len(), 3);
    }

    #[test]
    fn dropping_an_unexited_context_releases_as_incomplete() {
        let recorder = Arc::new(Recorder::default());
        let context = ScopeContext::shared();
        let handle = get_contextual(&context, "k", |_| Ok(Arc::clone(&recorder))).expect("scoped");

        drop(handle);
        drop(context);
        assert_eq!(*recorder.releases.lock(), vec![false]);
    }

    #[test]
    fn exited_context_releases_nothing_on_drop() {
        let recorder = Arc::new(Recorder::default());
        let context = ScopeContext::shared();
        drop(get_contextual(&context, "k", |_| Ok(Arc::clone(&recorder))).expect("scoped"));

        context.scope_exit(true);
        drop(context);
        assert_eq!(*recorder.releases.lock(), vec![true]);
    }

    #[test]
    fn blocking_create_leaves_the_context_usable() {
        let context = ScopeContext::shared();
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let enlister = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                context
                    .enlist(
                        "slow",
                        DEFAULT_PRIORITY,
                        || {
                            started_tx.send(()).expect("signal start");
                            go_rx.recv().expect("wait for go");
                            Ok(1_u32)
                        },
                        |_, _| {},
                    )
                    .map(|item| *item)
            })
        };

        started_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("create started");
        assert_eq!(context.len(), 0);
        assert!(!context.is_enlisted("slow"));
        context.scope_exit(true);
        assert!(format!("{context:?}").contains("ScopeContext"));

        go_tx.send(()).expect("release create");
        assert_eq!(enlister.join().expect("enlister"), Ok(1));
        assert!(context.is_enlisted("slow"));
    }

    #[test]
    fn losing_an_enlist_race_releases_the_new_item() {
        let context = ScopeContext::new();
        let released = Arc::new(Mutex::new(Vec::new()));

        let outer_released = Arc::clone(&released);
        let kept = context
            .enlist(
                "k",
                DEFAULT_PRIORITY,
                || {
                    // Another enlistment of the same key lands first.
                    let inner_released = Arc::clone(&released);
                    context
                        .enlist("k", DEFAULT_PRIORITY, || Ok(1_u32), move |v, completed| {
                            inner_released.lock().push((*v, completed));
                        })
                        .expect("inner enlist");
                    Ok(2_u32)
                },
                move |v, completed| outer_released.lock().push((*v, completed)),
            )
            .expect("outer enlist");

        assert_eq!(*kept, 1);
        assert_eq!(*released.lock(), vec![(2, false)]);
        assert_eq!(context.len(), 1);

        context.scope_exit(true);
        assert_eq!(*released.lock(), vec![(2, false), (1, true)]);
    }

    #[test]
    fn unscoped_contextual_releases_on_drop() {
        let recorder = Arc::new(Recorder::default());
        let handle = get_contextual(&NoScope, "k", |scoped| {
            assert!(!scoped);
            Ok(Arc::clone(&recorder))
        })
        .expect("unscoped");
        assert!(!handle.is_scoped());
        assert!(recorder.releases.lock().is_empty());

        drop(handle);
        assert_eq!(*recorder.releases.lock(), vec![true]);
    }

    #[test]
    fn scoped_contextual_releases_on_scope_exit_only() {
        let recorder = Arc::new(Recorder::default());
        let context = ScopeContext::shared();

        let first = get_contextual(&context, "k", |scoped| {
            assert!(scoped);
            Ok(Arc::clone(&recorder))
        })
        .expect("scoped");
        let second = get_contextual(&context, "k", |_| -> Result<Arc<Recorder>> {
            panic!("must reuse the enlisted instance")
        })
        .expect("reused");

        assert!(first.is_same(&second));
        drop(second);
        drop(first);
        assert!(recorder.releases.lock().is_empty());

        context.scope_exit(true);
        assert_eq!(*recorder.releases.lock(), vec![true]);
    }

    #[test]
    fn optional_provider_dispatches_on_presence() {
        let none: Option<Arc<ScopeContext>> = None;
        assert!(none.context().is_none());

        let some = Some(ScopeContext::shared());
        assert!(some.context().is_some());
        assert!((&some).context().is_some());
    }
}
