//! # xmemory-abi
//!
//! The operating-system side of the xmemory allocator.
//!
//! ```text
//! C caller  -> xmemory_* entry (malloc_abi) -\
//! Rust code -> xmalloc!/... (macros) ---------> global context -> XMemory<P>
//!                                                                  |  registry (xmemory-core)
//!                                                                  \- Platform (libc)
//! ```
//!
//! [`XMemory`] is an explicit allocator context generic over a [`Platform`].
//! The process-wide instance lives behind one mutex in [`global`]; it is
//! created on first use and installs an exit hook that removes every swap
//! file the process named.

// All extern "C" exports accept raw pointers from C callers; the contract is
// the one of the libc function each entry point replaces.
#![allow(clippy::missing_safety_doc)]

#[macro_use]
mod macros;

pub mod context;
pub mod global;
pub mod malloc_abi;
pub mod platform;

mod mapping;
mod ram;
mod swap;

pub use context::{FatalHandler, XMemory, exit_process};
pub use platform::{InstrumentedPlatform, Platform, PlatformCounts, SystemPlatform};
pub use xmemory_core::{
    CellKind, LifecycleRecord, LogLevel, MemoryCell, OperatingMode, Origin, UsageStats,
    Verbosity, XmemConfig, XmemError,
};
