//! Generation collection.
//!
//! A pass retires dead generations from the front of the queue, computes
//! the *horizon* (the oldest generation any live or future snapshot can
//! read), and trims every chain down to what a reader at or above the
//! horizon can reach. Keys whose head is a tombstone at or below the
//! horizon are removed from the map.
//!
//! Trimming only repoints `next` references, so a pass that is abandoned
//! halfway leaves every chain valid. Passes are serialized; at most one
//! background pass runs per dictionary.

use crate::chain::{Trim, trim};
use crate::{DictInner, SnapDictionary};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use snap_types::Generation;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Summary of one collection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub floor_gen: Generation,
    pub horizon: Generation,
    pub generations_retired: usize,
    pub keys_scanned: usize,
    pub links_pruned: usize,
    pub keys_removed: usize,
}

#[derive(Debug, Default)]
struct TaskState {
    report: Mutex<Option<CollectReport>>,
    done: Condvar,
}

/// Handle to a background collection pass.
#[derive(Debug, Clone, Default)]
pub struct CollectTask {
    state: Arc<TaskState>,
}

impl CollectTask {
    fn finish(&self, report: CollectReport) {
        *self.state.report.lock() = Some(report);
        self.state.done.notify_all();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.report.lock().is_some()
    }

    /// Block until the pass completes and return its report.
    #[must_use]
    pub fn wait(&self) -> CollectReport {
        let mut report = self.state.report.lock();
        loop {
            if let Some(done) = report.as_ref() {
                return done.clone();
            }
            self.state.done.wait(&mut report);
        }
    }
}

impl<K, V> DictInner<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn collect_pass(&self) -> CollectReport {
        let _pass = self.pass_lock.lock();

        let (floor_gen, horizon, generations_retired) = {
            let mut gens = self.gens.lock();
            let retired = gens.retire_dead();
            let horizon = gens.horizon();
            gens.last_collect_gen = gens.live_gen;
            (gens.floor_gen, horizon, retired)
        };

        let cells: Vec<_> = self
            .items
            .read()
            .iter()
            .map(|(key, cell)| (key.clone(), Arc::clone(cell)))
            .collect();

        let mut links_pruned = 0_usize;
        let mut removable = Vec::new();
        for (key, cell) in &cells {
            let head = cell.load();
            match trim(&head, horizon) {
                Trim::Keep { kept, pruned } => {
                    links_pruned += pruned;
                    if kept >= self.config.chain_warn_len {
                        warn!(
                            target: "snapcache::dict::collect",
                            dictionary = self.id.0,
                            chain_len = kept,
                            horizon = horizon.0,
                            "chain_too_long"
                        );
                    }
                }
                Trim::Remove => removable.push((key, head)),
            }
        }

        let mut keys_removed = 0_usize;
        if !removable.is_empty() {
            let mut items = self.items.write();
            for (key, observed) in removable {
                // A writer may have published a new head since the scan.
                let unchanged = items
                    .get(key)
                    .is_some_and(|cell| Arc::ptr_eq(&cell.load(), &observed));
                if unchanged {
                    items.remove(key);
                    keys_removed += 1;
                }
            }
        }

        let report = CollectReport {
            floor_gen,
            horizon,
            generations_retired,
            keys_scanned: cells.len(),
            links_pruned,
            keys_removed,
        };
        info!(
            target: "snapcache::dict::collect",
            dictionary = self.id.0,
            floor_gen = floor_gen.0,
            horizon = horizon.0,
            generations_retired,
            keys_scanned = report.keys_scanned,
            links_pruned,
            keys_removed,
            "collect_pass"
        );
        report
    }
}

impl<K, V> SnapDictionary<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Run a collection pass on the calling thread.
    pub fn collect(&self) -> CollectReport {
        self.inner.collect_pass()
    }

    /// Start a collection pass on a background thread.
    ///
    /// Returns the running task instead when one is already in flight.
    pub fn collect_async(&self) -> CollectTask {
        let mut slot = self.inner.collect_task.lock();
        if let Some(running) = slot.as_ref().filter(|task| !task.is_finished()) {
            return running.clone();
        }
        let task = CollectTask::default();
        *slot = Some(task.clone());
        drop(slot);

        let inner = Arc::clone(&self.inner);
        let worker = task.clone();
        let spawned = thread::Builder::new()
            .name("snap-collect".to_owned())
            .spawn(move || worker.finish(inner.collect_pass()));
        if let Err(error) = spawned {
            warn!(
                target: "snapcache::dict::collect",
                dictionary = self.inner.id.0,
                %error,
                "collect_spawn_failed"
            );
            task.finish(self.inner.collect_pass());
        }
        task
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
    fn pass_without_snapshots_keeps_newest_links() {
        let dict = manual();
        dict.set(1, "one").unwrap();
        let s1 = dict.create_snapshot();
        dict.set(1, "uno").unwrap();
        drop(s1);

        let report = dict.collect();
        assert_eq!(report.generations_retired, 1);
        assert_eq!(report.horizon, Generation(2));
        assert_eq!(report.links_pruned, 1);
        assert_eq!(report.keys_removed, 0);
        assert_eq!(dict.chain(&1).len(), 1);
    }

    #[test]
    fn async_task_reports_and_is_reusable() {
        let dict = manual();
        dict.set(1, "one").unwrap();
        let first = dict.collect_async().wait();
        assert_eq!(first.keys_scanned, 1);

        // The finished task is not handed out again.
        let second = dict.collect_async();
        let report = second.wait();
        assert!(second.is_finished());
        assert_eq!(report.keys_scanned, 1);
    }

    #[test]
    fn auto_collection_triggers_after_enough_generations() {
        let dict: SnapDictionary<u32, u32> = SnapDictionary::with_config(SnapConfig {
            collect_min_gen_delta: 2,
            ..SnapConfig::default()
        });
        for round in 0..6 {
            dict.set(0, round).unwrap();
            dict.create_snapshot().dispose();
        }
        // Wait for whatever pass the last snapshot started, then settle.
        dict.collect_async().wait();
        dict.collect();
        assert!(dict.floor_gen() > Generation(0));
        assert_eq!(dict.chain(&0).len(), 1);
    }
}
