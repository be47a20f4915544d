#![forbid(unsafe_code)]
//! Seeded stress runs against [`SnapDictionary`].
//!
//! One scoped writer commits or aborts whole rounds while reader threads
//! check that every snapshot observes exactly one committed round.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use snap_dict::{
    CollectReport, ScopeContext, SnapConfig, SnapDiagnostics, SnapDictionary, Snapshot,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;
use tracing::{info, warn};

const ABORTED: u64 = u64::MAX;
const PIN_EVERY_READS: u64 = 16;
const MAX_PINNED: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub seed: u64,
    pub rounds: u64,
    pub reader_threads: usize,
    pub keys: u32,
    /// Every Nth round is rolled back; zero disables aborts.
    pub abort_every: u64,
    pub collect_min_gen_delta: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            rounds: 500,
            reader_threads: 4,
            keys: 32,
            abort_every: 5,
            collect_min_gen_delta: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StressReport {
    pub seed: u64,
    pub rounds: u64,
    pub commits: u64,
    pub aborts: u64,
    pub reads: u64,
    pub violations: Vec<String>,
    pub passed: bool,
    pub final_round: u64,
    pub collect: CollectReport,
    pub diagnostics: SnapDiagnostics,
    pub duration_us: u64,
}

/// Run one seeded stress pass and report what the readers observed.
///
/// # Errors
///
/// Fails on an invalid config or if the writer cannot take the lock.
pub fn run_stress(config: &StressConfig) -> Result<StressReport> {
    if config.rounds == 0 {
        bail!("rounds must be > 0");
    }
    if config.reader_threads == 0 {
        bail!("reader_threads must be > 0");
    }
    if config.keys == 0 {
        bail!("keys must be > 0");
    }

    let dict: SnapDictionary<u32, u64> = SnapDictionary::with_config(SnapConfig {
        collect_auto: true,
        collect_min_gen_delta: config.collect_min_gen_delta,
        ..SnapConfig::default()
    });
    let done = Arc::new(AtomicBool::new(false));
    let committed = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(config.reader_threads + 1));
    let started = Instant::now();

    let readers: Vec<_> = (0..config.reader_threads)
        .map(|reader| {
            let dict = dict.clone();
            let done = Arc::clone(&done);
            let committed = Arc::clone(&committed);
            let barrier = Arc::clone(&barrier);
            let keys = config.keys;
            thread::spawn(move || {
                barrier.wait();
                read_until_done(reader, &dict, keys, &done, &committed)
            })
        })
        .collect();

    barrier.wait();
    let writes = write_rounds(config, &dict, &committed);
    done.store(true, Ordering::Release);

    let mut reads = 0_u64;
    let mut violations = Vec::new();
    for (reader, handle) in readers.into_iter().enumerate() {
        match handle.join() {
            Ok(outcome) => {
                reads += outcome.reads;
                violations.extend(outcome.violations);
            }
            Err(_) => violations.push(format!("reader {reader}: thread panicked")),
        }
    }
    let (commits, aborts) = writes?;

    let collect = dict.collect();
    let final_round = committed.load(Ordering::Acquire);
    match observe(&dict.create_snapshot(), config.keys) {
        Ok(Some(round)) if round == final_round => {}
        Ok(None) if final_round == 0 => {}
        Ok(seen) => violations.push(format!(
            "final snapshot saw {seen:?}, expected round {final_round}"
        )),
        Err(violation) => violations.push(format!("final snapshot: {violation}")),
    }

    let passed = violations.is_empty();
    let duration = started.elapsed();
    if passed {
        info!(
            target: "snapcache::harness",
            seed = config.seed,
            commits,
            aborts,
            reads,
            "stress_passed"
        );
    } else {
        warn!(
            target: "snapcache::harness",
            seed = config.seed,
            violations = violations.len(),
            "stress_failed"
        );
    }

    Ok(StressReport {
        seed: config.seed,
        rounds: config.rounds,
        commits,
        aborts,
        reads,
        violations,
        passed,
        final_round,
        collect,
        diagnostics: dict.diagnostics(),
        duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
    })
}

fn write_rounds(
    config: &StressConfig,
    dict: &SnapDictionary<u32, u64>,
    committed: &AtomicU64,
) -> Result<(u64, u64)> {
    let mut rng = DeterministicRng::new(config.seed);
    let mut commits = 0_u64;
    let mut aborts = 0_u64;
    let mut order: Vec<u32> = (0..config.keys).collect();

    for round in 1..=config.rounds {
        let abort = config.abort_every > 0 && round % config.abort_every == 0;
        let value = if abort { ABORTED } else { round };
        shuffle(&mut order, &mut rng);

        let context = ScopeContext::shared();
        let lock = dict.get_scoped_write_lock(&context)?;
        for key in &order {
            lock.set(*key, value)?;
            if rng.next_usize(8) == 0 {
                thread::yield_now();
            }
        }
        drop(lock);
        context.scope_exit(!abort);

        if abort {
            aborts += 1;
        } else {
            commits += 1;
            committed.store(round, Ordering::Release);
        }
        if rng.next_usize(16) == 0 {
            // Result is observed later through the final collect.
            let _task = dict.collect_async();
        }
    }
    Ok((commits, aborts))
}

#[derive(Debug, Default)]
struct ReaderOutcome {
    reads: u64,
    violations: Vec<String>,
}

fn read_until_done(
    reader: usize,
    dict: &SnapDictionary<u32, u64>,
    keys: u32,
    done: &AtomicBool,
    committed: &AtomicU64,
) -> ReaderOutcome {
    let mut outcome = ReaderOutcome::default();
    let mut pinned: Vec<(Snapshot<u32, u64>, Option<u64>)> = Vec::new();
    let mut last_round = 0_u64;

    while !done.load(Ordering::Acquire) {
        let floor = committed.load(Ordering::Acquire);
        let snapshot = dict.create_snapshot();
        outcome.reads += 1;
        match observe(&snapshot, keys) {
            Ok(seen) => {
                let round = seen.unwrap_or(0);
                if round < last_round {
                    outcome.violations.push(format!(
                        "reader {reader}: round {round} after {last_round}"
                    ));
                }
                if round < floor {
                    outcome.violations.push(format!(
                        "reader {reader}: round {round} after {floor} committed"
                    ));
                }
                last_round = last_round.max(round);
                if outcome.reads % PIN_EVERY_READS == 0 {
                    pinned.push((snapshot, seen));
                }
            }
            Err(violation) => outcome
                .violations
                .push(format!("reader {reader}: {violation}")),
        }

        if pinned.len() > MAX_PINNED {
            let (old, seen) = pinned.remove(0);
            recheck(reader, &old, seen, keys, &mut outcome);
        }
    }

    for (old, seen) in pinned {
        recheck(reader, &old, seen, keys, &mut outcome);
    }
    outcome
}

fn recheck(
    reader: usize,
    snapshot: &Snapshot<u32, u64>,
    seen: Option<u64>,
    keys: u32,
    outcome: &mut ReaderOutcome,
) {
    match observe(snapshot, keys) {
        Ok(again) if again == seen => {}
        Ok(again) => outcome.violations.push(format!(
            "reader {reader}: pinned {} moved from {seen:?} to {again:?}",
            snapshot.generation()
        )),
        Err(violation) => outcome
            .violations
            .push(format!("reader {reader}: pinned {violation}")),
    }
}

/// The single round visible to `snapshot`, or `None` before the first commit.
fn observe(snapshot: &Snapshot<u32, u64>, keys: u32) -> Result<Option<u64>, String> {
    let mut seen: Option<Option<u64>> = None;
    for key in 0..keys {
        let value = snapshot.get(&key).map(|value| *value);
        if value == Some(ABORTED) {
            return Err(format!(
                "rolled-back write visible at {} key {key}",
                snapshot.generation()
            ));
        }
        match seen {
            None => seen = Some(value),
            Some(first) if first != value => {
                return Err(format!(
                    "torn read at {}: key {key} has {value:?}, key 0 has {first:?}",
                    snapshot.generation()
                ));
            }
            Some(_) => {}
        }
    }
    Ok(seen.flatten())
}

fn shuffle(order: &mut [u32], rng: &mut DeterministicRng) {
    for index in (1..order.len()).rev() {
        order.swap(index, rng.next_usize(index + 1));
    }
}

#[derive(Debug, Clone)]
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive <= 1 {
            return 0;
        }
        let upper = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        usize::try_from(self.next_u64() % upper).unwrap_or(0)
    }
}
