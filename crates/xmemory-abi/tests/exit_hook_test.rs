//! Integration test: swap-file cleanup at process exit and the default fatal
//! handler.
//!
//! Run: cargo test -p xmemory-abi --test exit_hook_test
//!
//! The parent tests re-run this binary with `XMEMORY_CHILD_ROLE` set so the
//! child touches the global context and exits; the parent then inspects the
//! child's exit status and its scratch directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use xmemory_abi::{OperatingMode, Origin, XmemConfig, global};
use xmemory_core::swap::list_swap_files;

const ROLE_ENV: &str = "XMEMORY_CHILD_ROLE";
const DIR_ENV: &str = "XMEMORY_CHILD_DIR";

fn child_dir() -> Option<PathBuf> {
    std::env::var_os(DIR_ENV).map(PathBuf::from)
}

fn role_is(role: &str) -> bool {
    std::env::var(ROLE_ENV).is_ok_and(|r| r == role)
}

fn run_child(test: &str, role: &str, dir: &Path) -> Output {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE_ENV, role)
        .env(DIR_ENV, dir)
        .output()
        .unwrap()
}

/// Name swap files through the ledger without any registry cell behind them.
fn reserve_swap_files(count: usize) -> Vec<PathBuf> {
    let ledger = global::swap_ledger();
    (0..count)
        .map(|_| {
            let (_, path) = ledger.next_path();
            fs::write(&path, [0u8; 64]).unwrap();
            path
        })
        .collect()
}

fn configure_child(dir: &Path, capacity: usize) {
    let config = XmemConfig::from_build()
        .with_mode(OperatingMode::Managed)
        .with_capacity(capacity)
        .with_tmpdir(dir);
    assert!(global::configure(config));
}

// ---------------------------------------------------------------------------
// Child bodies (no-ops unless started by a parent test)
// ---------------------------------------------------------------------------

#[test]
fn child_leaves_swap_files_behind() {
    if !role_is("leave") {
        return;
    }
    let dir = child_dir().unwrap();
    configure_child(&dir, 64);
    let paths = reserve_swap_files(3);
    assert!(paths.iter().all(|p| p.exists()));
    // A stray file the ledger never named survives.
    fs::write(dir.join("vmswap_00001_00001"), b"other process").unwrap();
}

#[test]
fn child_overflows_registry() {
    if !role_is("overflow") {
        return;
    }
    let dir = child_dir().unwrap();
    configure_child(&dir, 2);
    reserve_swap_files(2);
    let origin = Origin::new("overflow.c", 7);
    for _ in 0..3 {
        let _ = global::malloc(32, &origin);
    }
    unreachable!("the third allocation must terminate the process");
}

// ---------------------------------------------------------------------------
// Parents
// ---------------------------------------------------------------------------

#[test]
fn exit_hook_removes_ledger_files() {
    if std::env::var_os(ROLE_ENV).is_some() {
        return;
    }
    let dir = xmemory_core::scratch::ScratchDir::new("xmemory-test").unwrap();
    let out = run_child("child_leaves_swap_files_behind", "leave", dir.path());
    assert!(out.status.success(), "child failed: {out:?}");

    let left: Vec<_> = list_swap_files(dir.path()).unwrap();
    assert_eq!(left.len(), 1, "left behind: {left:?}");
    assert_eq!(left[0].1, 1);
}

#[test]
fn capacity_overflow_exits_with_255_and_sweeps() {
    if std::env::var_os(ROLE_ENV).is_some() {
        return;
    }
    let dir = xmemory_core::scratch::ScratchDir::new("xmemory-test").unwrap();
    let out = run_child("child_overflows_registry", "overflow", dir.path());
    assert_eq!(out.status.code(), Some(255), "child output: {out:?}");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("pointer registry full (2 cells)"), "{stderr}");
    assert!(stderr.contains("overflow.c (7)"), "{stderr}");
    assert!(list_swap_files(dir.path()).unwrap().is_empty());
}
