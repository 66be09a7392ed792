//! Error taxonomy for the allocator.
//!
//! Every variant that originates in a syscall keeps the `io::Error` as its
//! source and the path it was operating on, so the fatal message is enough to
//! diagnose a failed run from stderr alone.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmemError {
    #[error("pointer registry full ({capacity} cells)")]
    CapacityExhausted { capacity: usize },
    #[error("cannot create swap file {}: {source}", .path.display())]
    SwapCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot map swap file {}: {source}", .path.display())]
    SwapMap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot stat file {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot map file {}: {source}", .path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("offset {offset} past end of {} ({size} bytes)", .path.display())]
    OffsetOutOfRange {
        path: PathBuf,
        offset: usize,
        size: usize,
    },
    #[error("size overflow: {count} x {size}")]
    SizeOverflow { count: usize, size: usize },
    #[error("system allocator failed for {size} bytes")]
    AllocationFailed { size: usize },
}

impl XmemError {
    /// Short stable name, used as the event field of lifecycle records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::SwapCreate { .. } => "swap_create",
            Self::SwapMap { .. } => "swap_map",
            Self::Stat { .. } => "stat",
            Self::Open { .. } => "open",
            Self::Map { .. } => "map",
            Self::OffsetOutOfRange { .. } => "offset_out_of_range",
            Self::SizeOverflow { .. } => "size_overflow",
            Self::AllocationFailed { .. } => "allocation_failed",
        }
    }

    /// Errno of the underlying syscall failure, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SwapCreate { source, .. }
            | Self::SwapMap { source, .. }
            | Self::Stat { source, .. }
            | Self::Open { source, .. }
            | Self::Map { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = XmemError::Stat {
            path: PathBuf::from("/data/missing.fits"),
            source: io::Error::from_raw_os_error(2),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("cannot stat file /data/missing.fits:"), "{msg}");
        assert_eq!(err.raw_os_error(), Some(2));
        assert_eq!(err.kind(), "stat");
    }

    #[test]
    fn capacity_message() {
        let err = XmemError::CapacityExhausted { capacity: 3 };
        assert_eq!(err.to_string(), "pointer registry full (3 cells)");
        assert_eq!(err.raw_os_error(), None);
    }

    #[test]
    fn offset_message() {
        let err = XmemError::OffsetOutOfRange {
            path: PathBuf::from("a.fits"),
            offset: 10,
            size: 4,
        };
        assert_eq!(err.to_string(), "offset 10 past end of a.fits (4 bytes)");
    }
}
