#![forbid(unsafe_code)]

//! Snapshot read and write-lock throughput.
//!
//! Reads are meant to cost a map lookup plus a short chain walk, with no
//! contention against the writer.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use snap_dict::{NoScope, ScopeContext, SnapConfig, SnapDictionary};

const KEYS: u64 = 4_096;

fn write_generation(dict: &SnapDictionary<u64, u64>, generation: u64) {
    let lock = dict.get_scoped_write_lock(&NoScope).expect("lock");
    for key in 0..KEYS {
        lock.set(key, key ^ generation).expect("set");
    }
}

fn populated(generations: u64) -> SnapDictionary<u64, u64> {
    let dict = SnapDictionary::with_config(SnapConfig::manual());
    for generation in 0..generations {
        write_generation(&dict, generation);
        // Pin nothing, but close the generation so chains grow.
        dict.create_snapshot().dispose();
    }
    dict
}

fn bench_snapshot_reads(c: &mut Criterion) {
    let dict = populated(1);
    let snapshot = dict.create_snapshot();
    let mut key = 0_u64;
    c.bench_function("snapshot_get_single_link", |b| {
        b.iter(|| {
            key = (key + 7) % KEYS;
            black_box(snapshot.get(&key));
        });
    });

    let deep = SnapDictionary::with_config(SnapConfig::manual());
    write_generation(&deep, 0);
    let oldest = deep.create_snapshot();
    for generation in 1..16 {
        write_generation(&deep, generation);
        deep.create_snapshot().dispose();
    }
    c.bench_function("snapshot_get_deep_chain", |b| {
        b.iter(|| {
            key = (key + 7) % KEYS;
            black_box(oldest.get(&key));
        });
    });

    c.bench_function("snapshot_get_all_4k", |b| {
        b.iter(|| black_box(snapshot.get_all().count()));
    });

    c.bench_function("create_snapshot", |b| {
        b.iter(|| black_box(dict.create_snapshot()));
    });
}

fn bench_writes(c: &mut Criterion) {
    c.bench_function("unscoped_set", |b| {
        let dict = SnapDictionary::<u64, u64>::with_config(SnapConfig::manual());
        let mut key = 0_u64;
        b.iter(|| {
            key = (key + 1) % KEYS;
            dict.set(key, key).expect("set");
        });
    });

    c.bench_function("scoped_commit_64_writes", |b| {
        let dict = SnapDictionary::<u64, u64>::with_config(SnapConfig::manual());
        b.iter_batched(
            ScopeContext::shared,
            |context| {
                let lock = dict.get_scoped_write_lock(&context).expect("lock");
                for key in 0..64 {
                    lock.set(key, key).expect("set");
                }
                drop(lock);
                context.scope_exit(true);
            },
            BatchSize::SmallInput,
        );
    });

    c.bench_function("collect_16_generations", |b| {
        b.iter_batched(
            || populated(16),
            |dict| black_box(dict.collect()),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(snapshot_benches, bench_snapshot_reads, bench_writes);
criterion_main!(snapshot_benches);
