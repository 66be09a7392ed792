//! # xmemory-core
//!
//! Platform-neutral bookkeeping for the xmemory extended allocator.
//!
//! This crate owns everything that can be expressed without touching the OS:
//! the tracked-cell model, the fixed-capacity pointer registry, usage
//! counters, the lifecycle log, the status report format and the swap-file
//! naming scheme. Syscalls and raw memory live in `xmemory-abi`.
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod cell;
pub mod config;
pub mod error;
pub mod hash;
pub mod log;
pub mod registry;
pub mod resource;
pub mod scratch;
pub mod stats;
pub mod status;
pub mod swap;

pub use cell::{Backing, CellKind, MemoryCell, Origin};
pub use config::{OperatingMode, Verbosity, XmemConfig};
pub use error::XmemError;
pub use log::{LifecycleLog, LifecycleRecord, LogEvent, LogLevel};
pub use registry::{Registry, SlotIndex};
pub use resource::{ResourceProbe, Rlimit};
pub use stats::UsageStats;
pub use status::StatusReport;
pub use swap::SwapLedger;
