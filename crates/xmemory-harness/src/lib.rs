//! Scenario harness for the xmemory allocator.
//!
//! This crate provides:
//! - Scenarios: RAM round trip, forced swap spill, shared file mapping and a
//!   status dump, each against its own instrumented allocator context
//! - Sweep: removal of swap files orphaned by killed processes
//! - Structured JSONL logs carrying scenario verdicts and allocator decisions

#![deny(unsafe_code)]

pub mod error;
#[allow(unsafe_code)]
pub mod scenarios;
pub mod structured_log;
pub mod sweep;

pub use error::HarnessError;
pub use scenarios::{ScenarioReport, StatusDump};
pub use structured_log::{LogEmitter, LogEntry};
pub use sweep::{SweepReport, SweepTarget};
