//! Tracked allocation cells.
//!
//! A [`MemoryCell`] describes one live block handed out by the allocator:
//! where it lives, how big it is, which backing store satisfied it, and
//! (optionally) which call site asked for it.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::hash::path_hash;

/// Call-site provenance attached to allocator requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    file: Cow<'static, str>,
    line: u32,
}

impl Origin {
    /// Origin from a static source location (what `file!()`/`line!()` give).
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file: Cow::Borrowed(file),
            line,
        }
    }

    /// Origin with an owned file name, used for names arriving over the C ABI.
    #[must_use]
    pub fn owned(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: Cow::Owned(file.into()),
            line,
        }
    }

    /// Placeholder for requests that carry no location.
    #[must_use]
    pub const fn unknown() -> Self {
        Self::new("<unknown>", 0)
    }

    /// Location of the caller of the function this is invoked from.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }

    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.file, self.line)
    }
}

/// Backing-store classification of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    /// Satisfied by the system heap.
    Ram,
    /// Satisfied by a private mapping of a zero-filled temporary file.
    Swap,
    /// A shared, reference-counted mapping of an existing file.
    Mapped,
}

impl CellKind {
    /// Single-letter tag used in status dumps.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Ram => 'R',
            Self::Swap => 'S',
            Self::Mapped => 'M',
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ram => "ram",
            Self::Swap => "swap",
            Self::Mapped => "mapped",
        }
    }
}

/// Backing-specific state of a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    Ram,
    Swap {
        /// Sequence number the swap file was named with.
        file_id: u64,
        /// Descriptor kept open for the lifetime of the cell.
        fd: i32,
        /// Length of the mapping (size rounded up to the page size).
        mapped_len: usize,
    },
    Mapped {
        path: PathBuf,
        path_hash: u32,
        /// Number of outstanding `falloc` holders.
        ref_count: u32,
    },
}

/// One tracked allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCell {
    /// Base address handed to the caller (identity key).
    pub address: usize,
    /// Requested size in bytes; for mapped cells, the file size.
    pub size: usize,
    pub backing: Backing,
    /// Requesting call site, present only when origins are tracked.
    pub origin: Option<Origin>,
}

impl MemoryCell {
    #[must_use]
    pub fn ram(address: usize, size: usize, origin: Option<Origin>) -> Self {
        Self {
            address,
            size,
            backing: Backing::Ram,
            origin,
        }
    }

    #[must_use]
    pub fn swap(
        address: usize,
        size: usize,
        file_id: u64,
        fd: i32,
        mapped_len: usize,
        origin: Option<Origin>,
    ) -> Self {
        Self {
            address,
            size,
            backing: Backing::Swap {
                file_id,
                fd,
                mapped_len,
            },
            origin,
        }
    }

    /// A freshly mapped file with a single holder.
    #[must_use]
    pub fn mapped(address: usize, size: usize, path: &Path, origin: Option<Origin>) -> Self {
        Self {
            address,
            size,
            backing: Backing::Mapped {
                path: path.to_path_buf(),
                path_hash: path_hash(path.as_os_str().as_encoded_bytes()),
                ref_count: 1,
            },
            origin,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CellKind {
        match self.backing {
            Backing::Ram => CellKind::Ram,
            Backing::Swap { .. } => CellKind::Swap,
            Backing::Mapped { .. } => CellKind::Mapped,
        }
    }

    /// One past the last byte of the cell.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.address.saturating_add(self.size)
    }

    /// Whether `addr` falls inside `[address, address + size)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr < self.end()
    }

    /// Reference count for mapped cells, zero for everything else.
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        match self.backing {
            Backing::Mapped { ref_count, .. } => ref_count,
            _ => 0,
        }
    }

    /// Whether this cell maps `path` (hash compared first, then the path itself).
    #[must_use]
    pub fn maps_path(&self, path: &Path, hash: u32) -> bool {
        match &self.backing {
            Backing::Mapped {
                path: mapped,
                path_hash,
                ..
            } => *path_hash == hash && mapped == path,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_display_matches_diagnostic_format() {
        let origin = Origin::new("src/flat.c", 120);
        assert_eq!(origin.to_string(), "src/flat.c (120)");
        assert_eq!(Origin::owned("dark.c", 7).file(), "dark.c");
    }

    #[test]
    fn caller_origin_points_here() {
        let origin = Origin::caller();
        assert!(origin.file().ends_with("cell.rs"));
        assert!(origin.line() > 0);
    }

    #[test]
    fn kind_codes() {
        assert_eq!(CellKind::Ram.code(), 'R');
        assert_eq!(CellKind::Swap.code(), 'S');
        assert_eq!(CellKind::Mapped.code(), 'M');
    }

    #[test]
    fn mapped_cell_range_and_refcount() {
        let cell = MemoryCell::mapped(0x1000, 0x200, Path::new("cube.fits"), None);
        assert_eq!(cell.kind(), CellKind::Mapped);
        assert_eq!(cell.ref_count(), 1);
        assert!(cell.contains(0x1000));
        assert!(cell.contains(0x11ff));
        assert!(!cell.contains(0x1200));
        assert!(!cell.contains(0x0fff));

        let hash = path_hash(b"cube.fits");
        assert!(cell.maps_path(Path::new("cube.fits"), hash));
        assert!(!cell.maps_path(Path::new("other.fits"), hash));
    }

    #[test]
    fn non_mapped_cells_have_no_refcount() {
        assert_eq!(MemoryCell::ram(0x10, 8, None).ref_count(), 0);
        let swap = MemoryCell::swap(0x20, 8, 1, 3, 4096, None);
        assert_eq!(swap.kind(), CellKind::Swap);
        assert_eq!(swap.ref_count(), 0);
        assert!(!swap.maps_path(Path::new("x"), 0));
    }
}
