//! Removal of swap files left behind by processes that were killed before
//! their exit hook ran.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use xmemory_core::swap::list_swap_files;

/// Which swap files to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTarget {
    /// Files named by this pid, alive or not.
    Pid(u32),
    /// Files whose owning pid no longer exists.
    Dead,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub dir: PathBuf,
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Whether `pid` names a live process (Linux `/proc`).
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Sweep `dir` with liveness decided by [`process_alive`].
pub fn sweep(dir: &Path, target: SweepTarget) -> io::Result<SweepReport> {
    sweep_with(dir, target, process_alive)
}

/// Sweep `dir`, asking `alive` about each owning pid under
/// [`SweepTarget::Dead`].
pub fn sweep_with(
    dir: &Path,
    target: SweepTarget,
    alive: impl Fn(u32) -> bool,
) -> io::Result<SweepReport> {
    let mut report = SweepReport {
        dir: dir.to_path_buf(),
        ..SweepReport::default()
    };
    for (path, pid, _id) in list_swap_files(dir)? {
        let stale = match target {
            SweepTarget::Pid(wanted) => pid == wanted,
            SweepTarget::Dead => !alive(pid),
        };
        if !stale {
            report.kept.push(path);
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => report.errors.push(format!("{}: {err}", path.display())),
        }
    }
    Ok(report)
}
