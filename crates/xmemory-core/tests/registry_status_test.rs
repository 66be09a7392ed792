//! Integration test: registry bookkeeping feeding the status dump.
//!
//! Drives the registry the way the allocator context does (insert, shared
//! mapping reference counts, removal) and checks the counters, the rendered
//! report and the serialized snapshot stay consistent.
//!
//! Run: cargo test -p xmemory-core --test registry_status_test

use std::path::Path;

use xmemory_core::{
    CellKind, MemoryCell, Origin, Registry, StatusReport, SwapLedger, UsageStats, Verbosity,
};

fn render(registry: &Registry, ledger: &SwapLedger, verbosity: Verbosity) -> String {
    let origin = Origin::new("pipeline.c", 77);
    let report = StatusReport {
        origin: &origin,
        verbosity,
        capacity: registry.capacity(),
        probe: None,
        stats: registry.stats(),
        ledger,
    };
    let mut out = Vec::new();
    report.write(&mut out, registry.cells()).unwrap();
    String::from_utf8(out).unwrap()
}

// ---------------------------------------------------------------------------
// 1. Mixed workload
// ---------------------------------------------------------------------------

#[test]
fn mixed_cells_are_accounted_and_reported() {
    let mut registry = Registry::with_capacity(64);
    let ledger = SwapLedger::new("/var/tmp", 314);
    let (swap_id, _) = ledger.next_path();

    registry
        .insert(MemoryCell::ram(0x10_0000, 1000, Some(Origin::new("a.c", 1))))
        .unwrap();
    registry
        .insert(MemoryCell::swap(0x20_0000, 5000, swap_id, 9, 8192, None))
        .unwrap();
    let map = registry
        .insert(MemoryCell::mapped(
            0x30_0000,
            4096,
            Path::new("/data/flat.fits"),
            None,
        ))
        .unwrap();
    registry.acquire_mapping(map).unwrap();

    let stats = *registry.stats();
    assert_eq!(stats.cell_count, 3);
    assert_eq!(stats.bytes_total(), 6000);
    assert_eq!(stats.mapped_refs, 2);
    assert!(registry.check_counters());

    let text = render(&registry, &ledger, Verbosity::Quiet);
    assert!(text.contains("ALL_npointers       3\n"));
    assert!(text.contains("SWP_alloc           5000\n"));
    assert!(text.contains("MAP_mappings        2\n"));
    assert!(text.contains("swf[/var/tmp/vmswap_00314_00001][9]"));
    assert!(text.contains("R(0x100000) - a.c (1) for 1000 bytes"));

    // A second dump without activity is identical.
    assert_eq!(text, render(&registry, &ledger, Verbosity::Quiet));
}

// ---------------------------------------------------------------------------
// 2. Release back to baseline
// ---------------------------------------------------------------------------

#[test]
fn releasing_everything_restores_baseline() {
    let mut registry = Registry::with_capacity(16);
    let ledger = SwapLedger::new(".", 1);
    let addrs: Vec<usize> = (0..10).map(|i| 0x4000 + i * 0x40).collect();
    for &addr in &addrs {
        registry.insert(MemoryCell::ram(addr, 64, None)).unwrap();
    }
    for &addr in &addrs {
        let slot = registry.find(addr).unwrap();
        let cell = registry.remove(slot).unwrap();
        assert_eq!(cell.kind(), CellKind::Ram);
    }

    assert!(registry.is_empty());
    assert!(registry.stats().same_live_counts(&UsageStats::default()));
    assert_eq!(registry.stats().peak_cells, 10);
    assert_eq!(registry.stats().peak_bytes, 640);
    assert_eq!(render(&registry, &ledger, Verbosity::Quiet), "");
}

// ---------------------------------------------------------------------------
// 3. Snapshot serialization
// ---------------------------------------------------------------------------

#[test]
fn usage_snapshot_serializes() {
    let mut registry = Registry::with_capacity(8);
    registry.insert(MemoryCell::ram(0x9000, 12, None)).unwrap();
    let json = serde_json::to_value(registry.stats()).unwrap();
    assert_eq!(json["cell_count"], 1);
    assert_eq!(json["bytes_ram"], 12);
    assert_eq!(json["peak_bytes"], 12);
}
