//! Allocator facade benchmarks: managed context against the system allocator.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use xmemory_abi::{OperatingMode, Origin, Platform, SystemPlatform, Verbosity, XMemory, XmemConfig};

fn context(dir: &std::path::Path, mode: OperatingMode) -> XMemory {
    let config = XmemConfig::from_build()
        .with_mode(mode)
        .with_verbosity(Verbosity::Quiet)
        .with_log_capacity(0)
        .with_tmpdir(dir);
    XMemory::new(config)
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let dir = xmemory_core::scratch::ScratchDir::new("xmemory-test").unwrap();
    let origin = Origin::new("malloc_bench.rs", 1);
    let sizes: &[usize] = &[16, 256, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = SystemPlatform.sys_malloc(sz).unwrap();
                // SAFETY: allocated just above.
                unsafe { SystemPlatform.sys_free(black_box(ptr)) };
            });
        });
        for mode in [OperatingMode::Passthrough, OperatingMode::Managed] {
            let mut mem = context(dir.path(), mode);
            group.bench_with_input(BenchmarkId::new(mode.as_str(), size), &size, |b, &sz| {
                b.iter(|| {
                    let ptr = mem.malloc(sz, &origin);
                    // SAFETY: allocated just above.
                    unsafe { mem.free(black_box(ptr), &origin) };
                });
            });
        }
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let dir = xmemory_core::scratch::ScratchDir::new("xmemory-test").unwrap();
    let origin = Origin::new("malloc_bench.rs", 2);
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("managed_1000x64B", |b| {
        let mut mem = context(dir.path(), OperatingMode::Managed);
        b.iter(|| {
            let held: Vec<_> = (0..1000).filter_map(|_| mem.malloc(64, &origin)).collect();
            for ptr in held {
                // SAFETY: each pointer is released once.
                unsafe { mem.free(Some(ptr), &origin) };
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst);
criterion_main!(benches);
