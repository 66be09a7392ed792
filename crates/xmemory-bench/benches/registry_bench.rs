//! Pointer registry benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use xmemory_core::{MemoryCell, Registry};

/// Addresses spaced like 16-byte aligned heap blocks.
fn addresses(count: usize) -> Vec<usize> {
    (0..count).map(|i| 0x7f00_0000_0000 + i * 48).collect()
}

fn filled(capacity: usize, load: usize) -> Registry {
    let mut registry = Registry::with_capacity(capacity);
    for addr in addresses(load) {
        registry.insert(MemoryCell::ram(addr, 48, None)).unwrap();
    }
    registry
}

fn bench_insert_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_insert_remove");
    for load in [1_000usize, 50_000, 150_000] {
        group.bench_with_input(BenchmarkId::new("load", load), &load, |b, &load| {
            let mut registry = filled(200_000, load);
            let probe = 0x6f00_0000_0000;
            b.iter(|| {
                let slot = registry.insert(MemoryCell::ram(probe, 16, None)).unwrap();
                black_box(registry.remove(slot));
            });
        });
    }
    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_find");
    for load in [1_000usize, 150_000] {
        let registry = filled(200_000, load);
        let hits = addresses(load);
        group.bench_with_input(BenchmarkId::new("hit", load), &load, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 7919) % hits.len();
                black_box(registry.find(hits[i]))
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", load), &load, |b, _| {
            b.iter(|| black_box(registry.find(black_box(0x10))));
        });
    }
    group.finish();
}

fn bench_churn_with_tombstones(c: &mut Criterion) {
    c.bench_function("registry_churn_1000", |b| {
        let mut registry = Registry::with_capacity(4096);
        let addrs = addresses(1000);
        b.iter(|| {
            let slots: Vec<_> = addrs
                .iter()
                .map(|&a| registry.insert(MemoryCell::ram(a, 48, None)).unwrap())
                .collect();
            for addr in addrs.iter().rev() {
                let slot = registry.find(*addr).unwrap();
                registry.remove(slot);
            }
            black_box(slots.len())
        });
    });
}

criterion_group!(
    benches,
    bench_insert_remove,
    bench_find,
    bench_churn_with_tombstones
);
criterion_main!(benches);
