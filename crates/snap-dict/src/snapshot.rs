use crate::SnapDictionary;
use crate::chain::ValueLink;
use crate::generation::GenRef;
use snap_types::Generation;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A read handle frozen at one generation.
///
/// Holding a snapshot keeps its generation from being collected. Dropping
/// it releases that hold; [`dispose`](Self::dispose) does the same
/// explicitly.
pub struct Snapshot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    dict: SnapDictionary<K, V>,
    generation: Generation,
    handle: Option<Arc<GenRef>>,
}

impl<K, V> Snapshot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn tracked(dict: SnapDictionary<K, V>, handle: Arc<GenRef>) -> Self {
        Self {
            dict,
            generation: handle.generation(),
            handle: Some(handle),
        }
    }

    pub(crate) fn untracked(dict: SnapDictionary<K, V>, generation: Generation) -> Self {
        Self {
            dict,
            generation,
            handle: None,
        }
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether this snapshot pins its generation against collection.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.handle.is_some()
    }

    /// The value of `key` as of this snapshot's generation.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.dict.inner.read(key, self.generation)
    }

    /// Every value visible at this snapshot's generation, in key order.
    ///
    /// The set of keys is captured when this is called; the iterator is
    /// not a live view and calling again starts over.
    pub fn get_all(&self) -> impl Iterator<Item = Arc<V>> {
        let generation = self.generation;
        self.dict
            .inner
            .heads()
            .into_iter()
            .filter_map(move |head| ValueLink::visible_at(&head, generation)?.value().cloned())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get_all().next().is_none()
    }

    /// Release this snapshot now rather than at end of scope.
    pub fn dispose(self) {
        drop(self);
    }
}

impl<K, V> Clone for Snapshot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            dict: self.dict.clone(),
            generation: self.generation,
            handle: self.handle.clone(),
        }
    }
}

impl<K, V> Drop for Snapshot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(
                target: "snapcache::dict",
                dictionary = self.dict.id().0,
                generation = self.generation.0,
                last = Arc::strong_count(&handle) == 1,
                "snapshot_drop"
            );
        }
    }
}

impl<K, V> fmt::Debug for Snapshot<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("dictionary", &self.dict.id())
            .field("generation", &self.generation)
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{SnapConfig, SnapDictionary};
    use snap_types::Generation;

    fn manual() -> SnapDictionary<u32, &'static str> {
        SnapDictionary::with_config(SnapConfig::manual())
    }

    #[test]
    fn missing_key_reads_none() {
        let dict = manual();
        let snap = dict.create_snapshot();
        assert!(snap.get(&1).is_none());
        assert!(snap.is_empty());
    }

    #[test]
    fn clone_and_dispose_track_snapshot_count() {
        let dict = manual();
        let snap = dict.create_snapshot();
        let copy = snap.clone();
        assert_eq!(dict.snap_count(), 2);
        snap.dispose();
        assert_eq!(dict.snap_count(), 1);
        assert_eq!(copy.generation(), Generation(0));
        drop(copy);
        assert_eq!(dict.snap_count(), 0);
    }

    #[test]
    fn live_snapshot_is_untracked_and_sees_in_flight_writes() {
        let dict = manual();
        let lock = dict.get_scoped_write_lock(&crate::NoScope).unwrap();
        lock.set(3, "three").unwrap();

        let live = dict.live_snapshot();
        assert!(!live.is_tracked());
        assert_eq!(live.generation(), Generation(1));
        assert_eq!(live.get(&3).as_deref(), Some(&"three"));
        assert_eq!(dict.snap_count(), 0);

        let committed = dict.create_snapshot();
        assert_eq!(committed.generation(), Generation(0));
        assert!(committed.get(&3).is_none());
        drop(lock);
    }

    #[test]
    fn get_all_is_a_captured_view() {
        let dict = manual();
        dict.set(1, "one").unwrap();
        dict.set(2, "two").unwrap();
        let snap = dict.create_snapshot();

        let iter = snap.get_all();
        dict.set(3, "three").unwrap();
        let seen: Vec<&str> = iter.map(|v| *v).collect();
        assert_eq!(seen, vec!["one", "two"]);
    }
}
