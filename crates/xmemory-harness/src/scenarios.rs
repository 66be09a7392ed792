//! End-to-end allocator scenarios.
//!
//! Each scenario drives its own managed [`XMemory`] over an
//! [`InstrumentedPlatform`], records named checks and returns a
//! [`ScenarioReport`]. This is the only module of the harness that touches
//! allocator memory through raw pointers.

use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;

use serde::Serialize;
use xmemory_abi::{InstrumentedPlatform, Platform, XMemory};
use xmemory_core::{
    CellKind, LifecycleRecord, MemoryCell, OperatingMode, Origin, UsageStats, XmemConfig,
};

use crate::error::HarnessError;

/// Sizes exercised by [`round_trip`].
pub const ROUND_TRIP_SIZES: [usize; 4] = [1, 7, 4096, 1 << 20];

/// Sizes forced onto swap by [`spill`].
pub const SPILL_SIZES: [usize; 3] = [1, 4096, 100_000];

/// Offset of the second holder in [`shared_mapping`].
const SHARED_OFFSET: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub mode: &'static str,
    pub checks: Vec<Check>,
    pub baseline: UsageStats,
    pub final_stats: UsageStats,
    /// Allocator decisions taken during the run.
    #[serde(skip)]
    pub records: Vec<LifecycleRecord>,
}

impl ScenarioReport {
    fn new(scenario: &'static str, baseline: UsageStats) -> Self {
        Self {
            scenario,
            mode: OperatingMode::Managed.as_str(),
            checks: Vec::new(),
            baseline,
            final_stats: UsageStats::default(),
            records: Vec::new(),
        }
    }

    fn check(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        self.checks.push(Check {
            name: name.into(),
            passed,
            detail: detail.into(),
        });
    }

    fn finish<P: Platform>(mut self, mem: &mut XMemory<P>) -> Self {
        self.final_stats = mem.snapshot();
        self.records = mem.drain_logs();
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }
}

fn managed(config: &XmemConfig) -> XMemory<InstrumentedPlatform> {
    let config = config.clone().with_mode(OperatingMode::Managed);
    XMemory::with_platform(config, InstrumentedPlatform::system())
}

fn pattern(index: usize, seed: u8) -> u8 {
    (index as u8).wrapping_mul(31).wrapping_add(seed)
}

/// Write a pattern over the block and read it back.
///
/// # Safety
/// `ptr` must be valid for reads and writes of `len` bytes.
unsafe fn fill_and_verify(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    // SAFETY: forwarded caller contract.
    let bytes = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = pattern(i, seed);
    }
    bytes.iter().enumerate().all(|(i, &b)| b == pattern(i, seed))
}

/// # Safety
/// `ptr` must be valid for reads of `len` bytes.
unsafe fn is_zeroed(ptr: NonNull<u8>, len: usize) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe { slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == 0)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// RAM allocation and release for [`ROUND_TRIP_SIZES`].
pub fn round_trip(config: &XmemConfig) -> ScenarioReport {
    let mut mem = managed(config);
    let origin = Origin::caller();
    let mut report = ScenarioReport::new("round_trip", mem.snapshot());

    for (seed, size) in ROUND_TRIP_SIZES.into_iter().enumerate() {
        let Some(ptr) = mem.malloc(size, &origin) else {
            report.check(format!("malloc_{size}"), false, "allocation returned None");
            continue;
        };
        let cell = mem.cell_for(ptr).map(|c| (c.kind(), c.size));
        report.check(
            format!("ram_cell_{size}"),
            cell == Some((CellKind::Ram, size)),
            format!("{cell:?}"),
        );
        // SAFETY: `size` bytes were just allocated.
        let intact = unsafe { fill_and_verify(ptr, size, seed as u8) };
        report.check(format!("pattern_{size}"), intact, "");
        // SAFETY: allocated above, not used afterwards.
        unsafe { mem.free(Some(ptr), &origin) };
        report.check(
            format!("baseline_{size}"),
            mem.snapshot().same_live_counts(&report.baseline),
            format!("{:?}", mem.snapshot()),
        );
    }
    report.check("registry_counters", mem.registry().check_counters(), "");
    report.finish(&mut mem)
}

/// Swap backing with the system allocator forced to fail.
pub fn spill(config: &XmemConfig) -> ScenarioReport {
    let mut mem = managed(config);
    mem.platform().set_fail_ram(true);
    let origin = Origin::caller();
    let mut report = ScenarioReport::new("spill", mem.snapshot());

    for (seed, size) in SPILL_SIZES.into_iter().enumerate() {
        let Some(ptr) = mem.malloc(size, &origin) else {
            report.check(format!("malloc_{size}"), false, "allocation returned None");
            continue;
        };
        let kind = mem.cell_for(ptr).map(|c| c.kind());
        report.check(
            format!("swap_cell_{size}"),
            kind == Some(CellKind::Swap),
            format!("{kind:?}"),
        );
        let swap_file = mem.ledger().path_for(mem.ledger().last_id());
        report.check(
            format!("swap_file_{size}"),
            swap_file.exists(),
            swap_file.display().to_string(),
        );
        // SAFETY: the swap mapping covers at least `size` bytes.
        let (zeroed, intact) = unsafe { (is_zeroed(ptr, size), fill_and_verify(ptr, size, seed as u8)) };
        report.check(format!("zero_filled_{size}"), zeroed, "");
        report.check(format!("pattern_{size}"), intact, "");
        // SAFETY: allocated above, not used afterwards.
        unsafe { mem.free(Some(ptr), &origin) };
        report.check(
            format!("swap_removed_{size}"),
            !swap_file.exists(),
            swap_file.display().to_string(),
        );
    }
    let counts = mem.platform().counts();
    report.check(
        "swap_files_created",
        counts.swap_files == SPILL_SIZES.len(),
        format!("{counts:?}"),
    );
    report.check(
        "swap_counters_reset",
        mem.snapshot().swap_files == 0 && mem.snapshot().bytes_swap == 0,
        "",
    );
    report.finish(&mut mem)
}

/// Two `falloc`s of one file share a single mapping.
///
/// Without `file` a fixture is written into the configured tmpdir and
/// removed afterwards.
pub fn shared_mapping(
    config: &XmemConfig,
    file: Option<&Path>,
) -> Result<ScenarioReport, HarnessError> {
    let mut mem = managed(config);
    let fixture = match file {
        Some(path) => Fixture {
            path: path.to_path_buf(),
            owned: false,
        },
        None => Fixture {
            path: write_fixture(&config.tmpdir, 3 * mem.probe().page_size + 17)?,
            owned: true,
        },
    };
    let contents = fs::read(&fixture.path)?;
    if contents.is_empty() {
        return Err(HarnessError::Scenario {
            scenario: "shared_mapping",
            message: format!("{} is empty", fixture.path.display()),
        });
    }
    let offset = SHARED_OFFSET.min(contents.len() - 1);
    let origin = Origin::caller();
    let mut report = ScenarioReport::new("shared_mapping", mem.snapshot());

    let Some((first, first_len)) = mem.falloc(&fixture.path, 0, &origin) else {
        return Err(HarnessError::Scenario {
            scenario: "shared_mapping",
            message: format!("cannot map {}", fixture.path.display()),
        });
    };
    let Some((second, second_len)) = mem.falloc(&fixture.path, offset, &origin) else {
        // SAFETY: `first` came from falloc with offset 0.
        unsafe { mem.fdealloc(Some(first), 0, first_len, &origin) };
        return Err(HarnessError::Scenario {
            scenario: "shared_mapping",
            message: format!("second mapping of {} failed", fixture.path.display()),
        });
    };

    report.check(
        "lengths",
        first_len == contents.len() && second_len == contents.len() - offset,
        format!("{first_len} / {second_len}"),
    );
    report.check(
        "same_base",
        second.as_ptr() as usize == first.as_ptr() as usize + offset,
        format!("{:p} / {:p}", first.as_ptr(), second.as_ptr()),
    );
    let same_bytes = {
        // SAFETY: both ranges lie inside the private mapping of the file.
        let (head, tail) = unsafe {
            (
                slice::from_raw_parts(first.as_ptr(), first_len),
                slice::from_raw_parts(second.as_ptr(), second_len),
            )
        };
        head == contents.as_slice() && tail == &contents[offset..]
    };
    report.check("contents", same_bytes, "");
    let refs = mem.cell_for(first).map(MemoryCell::ref_count);
    report.check("ref_count_2", refs == Some(2), format!("{refs:?}"));
    let counts = mem.platform().counts();
    report.check(
        "one_mapping",
        counts.maps == 1 && counts.files_opened == 1,
        format!("{counts:?}"),
    );

    // SAFETY: `second` came from falloc with `offset`.
    unsafe { mem.fdealloc(Some(second), offset, second_len, &origin) };
    report.check(
        "kept_after_first_release",
        mem.cell_for(first).is_some() && mem.platform().counts().unmaps == 0,
        "",
    );
    // SAFETY: last holder.
    unsafe { mem.fdealloc(Some(first), 0, first_len, &origin) };
    report.check(
        "unmapped_after_last_release",
        mem.cell_for(first).is_none() && mem.platform().counts().unmaps == 1,
        "",
    );

    let past = mem.falloc(&fixture.path, contents.len(), &origin);
    report.check(
        "offset_past_end_rejected",
        past.is_none() && mem.platform().counts().maps == 1,
        "",
    );
    Ok(report.finish(&mut mem))
}

/// Status text and counters of a small mixed workload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDump {
    pub text: String,
    pub stats: UsageStats,
}

/// Hold two RAM cells and one swap cell, dump the status, release them.
pub fn status_dump(config: &XmemConfig) -> Result<StatusDump, HarnessError> {
    let mut mem = managed(config);
    let origin = Origin::caller();
    let mut held: Vec<NonNull<u8>> = [64, 4096]
        .into_iter()
        .filter_map(|size| mem.malloc(size, &origin))
        .collect();
    mem.platform().set_fail_ram(true);
    held.extend(mem.malloc(10_000, &origin));
    mem.platform().set_fail_ram(false);

    let mut text = Vec::new();
    let written = mem.write_status(&mut text, &origin);
    let stats = mem.snapshot();
    for ptr in held {
        // SAFETY: every pointer was allocated above and is released once.
        unsafe { mem.free(Some(ptr), &origin) };
    }
    written?;
    Ok(StatusDump {
        text: String::from_utf8_lossy(&text).into_owned(),
        stats,
    })
}

/// Mapped file used by [`shared_mapping`]; removed on drop when the
/// scenario wrote it.
struct Fixture {
    path: PathBuf,
    owned: bool,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn write_fixture(dir: &Path, len: usize) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("xmemory_map_{:05}.dat", std::process::id()));
    let data: Vec<u8> = (0..len).map(|i| pattern(i, 0x5a)).collect();
    fs::write(&path, data)?;
    Ok(path)
}
