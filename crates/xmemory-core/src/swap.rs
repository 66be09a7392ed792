//! Swap-file naming and the process-wide swap ledger.
//!
//! Swap files are named `vmswap_<pid:05>_<id:05x>` inside the configured
//! directory. Ids are handed out from 1 upwards and never reused, so the set
//! of files a process may have created is exactly `1..=last_id`. Cleanup
//! relies on that instead of on the registry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SWAP_PREFIX: &str = "vmswap_";

/// File name of swap file `id` created by process `pid`.
#[must_use]
pub fn swap_file_name(pid: u32, id: u64) -> String {
    format!("{SWAP_PREFIX}{pid:05}_{id:05x}")
}

/// Inverse of [`swap_file_name`]: `(pid, id)`.
#[must_use]
pub fn parse_swap_file_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix(SWAP_PREFIX)?;
    let (pid, id) = rest.split_once('_')?;
    if pid.is_empty() || id.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let pid = pid.parse().ok()?;
    let id = u64::from_str_radix(id, 16).ok()?;
    Some((pid, id))
}

/// `size` rounded up to a multiple of `page_size`.
#[must_use]
pub fn round_to_page(size: usize, page_size: usize) -> Option<usize> {
    if page_size == 0 {
        return Some(size);
    }
    size.checked_add(page_size - 1)
        .map(|padded| padded / page_size * page_size)
}

/// Swap files found in `dir`, as `(path, pid, id)`, sorted by name.
pub fn list_swap_files(dir: &Path) -> io::Result<Vec<(PathBuf, u32, u64)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((pid, id)) = name.to_str().and_then(parse_swap_file_name) else {
            continue;
        };
        found.push((entry.path(), pid, id));
    }
    found.sort();
    Ok(found)
}

/// Sequence of swap files named by one process in one directory.
///
/// Shared between a context and the exit hook; only the atomic counter
/// changes after construction.
#[derive(Debug)]
pub struct SwapLedger {
    dir: PathBuf,
    pid: u32,
    last_id: AtomicU64,
}

impl SwapLedger {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            dir: dir.into(),
            pid,
            last_id: AtomicU64::new(0),
        }
    }

    /// Reserve the next id and return it with its path.
    pub fn next_path(&self) -> (u64, PathBuf) {
        let id = self.last_id.fetch_add(1, Ordering::AcqRel) + 1;
        (id, self.path_for(id))
    }

    #[must_use]
    pub fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(swap_file_name(self.pid, id))
    }

    #[must_use]
    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove every swap file this ledger ever named. Missing files are
    /// skipped; returns how many were removed.
    pub fn sweep(&self) -> usize {
        (1..=self.last_id())
            .filter(|&id| fs::remove_file(self.path_for(id)).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_pid_and_hex_id() {
        assert_eq!(swap_file_name(42, 1), "vmswap_00042_00001");
        assert_eq!(swap_file_name(123_456, 0xabcdef), "vmswap_123456_abcdef");
        assert_eq!(parse_swap_file_name("vmswap_00042_0001f"), Some((42, 0x1f)));
        assert_eq!(parse_swap_file_name("vmswap_x_1"), None);
        assert_eq!(parse_swap_file_name("vmswap_42"), None);
        assert_eq!(parse_swap_file_name("other_00042_00001"), None);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_to_page(1, 4096), Some(4096));
        assert_eq!(round_to_page(4096, 4096), Some(4096));
        assert_eq!(round_to_page(4097, 4096), Some(8192));
        assert_eq!(round_to_page(10, 0), Some(10));
        assert_eq!(round_to_page(usize::MAX, 4096), None);
    }

    #[test]
    fn ledger_ids_are_monotonic_from_one() {
        let ledger = SwapLedger::new("/tmp", 7);
        assert_eq!(ledger.last_id(), 0);
        let (first, path) = ledger.next_path();
        assert_eq!(first, 1);
        assert_eq!(path, PathBuf::from("/tmp/vmswap_00007_00001"));
        let (second, _) = ledger.next_path();
        assert_eq!(second, 2);
        assert_eq!(ledger.last_id(), 2);
    }

    #[test]
    fn sweep_removes_named_files_and_skips_missing() {
        let dir = crate::scratch::ScratchDir::new("xmemory-test").unwrap();
        let ledger = SwapLedger::new(dir.path(), 99);
        let (_, a) = ledger.next_path();
        let (_, _never_created) = ledger.next_path();
        let (_, c) = ledger.next_path();
        fs::write(&a, b"x").unwrap();
        fs::write(&c, b"y").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"z").unwrap();

        let listed = list_swap_files(dir.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1, 99);

        assert_eq!(ledger.sweep(), 2);
        assert!(!a.exists());
        assert!(!c.exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert_eq!(ledger.sweep(), 0);
    }
}
