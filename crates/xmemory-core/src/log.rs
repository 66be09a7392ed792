//! Structured lifecycle log.
//!
//! Every facade call appends one or more [`LifecycleRecord`]s carrying a
//! monotonic decision id, a correlation trace id and a snapshot of the usage
//! counters. Warnings and errors are echoed to stderr as they happen; lower
//! levels are echoed only at [`Verbosity::Trace`].

use std::collections::VecDeque;
use std::io::Write;

use serde::Serialize;

use crate::cell::{CellKind, Origin};
use crate::config::Verbosity;
use crate::stats::UsageStats;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Event description handed to [`LifecycleLog::record`].
#[derive(Debug, Clone)]
pub struct LogEvent {
    level: LogLevel,
    symbol: &'static str,
    event: &'static str,
    outcome: &'static str,
    ptr: Option<usize>,
    size: Option<usize>,
    kind: Option<CellKind>,
    details: String,
}

impl LogEvent {
    #[must_use]
    pub fn new(
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            outcome,
            ptr: None,
            size: None,
            kind: None,
            details: String::new(),
        }
    }

    #[must_use]
    pub fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: CellKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }
}

/// Structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id (`xmemory::<symbol>::<decision_id>`).
    pub trace_id: String,
    pub level: LogLevel,
    /// API symbol (`malloc`, `free`, `falloc`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc_ram`, `swap_spill`, `unknown_pointer`, ...).
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<CellKind>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// Requesting call site, `file (line)`.
    pub origin: String,
    /// Snapshot: live cells.
    pub cell_count: usize,
    /// Snapshot: RAM bytes.
    pub bytes_ram: usize,
    /// Snapshot: swap bytes.
    pub bytes_swap: usize,
}

impl LifecycleRecord {
    /// One-line human form used for the stderr echo.
    #[must_use]
    pub fn echo_line(&self) -> String {
        let mut line = format!("xmem: {} {}: {}", self.origin, self.symbol, self.event);
        if let Some(ptr) = self.ptr {
            line.push_str(&format!(" ptr={ptr:#x}"));
        }
        if let Some(size) = self.size {
            line.push_str(&format!(" size={size}"));
        }
        if !self.details.is_empty() {
            line.push_str(" -- ");
            line.push_str(&self.details);
        }
        line
    }
}

/// Bounded in-memory lifecycle log.
#[derive(Debug)]
pub struct LifecycleLog {
    records: VecDeque<LifecycleRecord>,
    capacity: usize,
    next_decision_id: u64,
    verbosity: Verbosity,
}

impl LifecycleLog {
    /// Log retaining at most `capacity` records (oldest dropped first).
    #[must_use]
    pub fn new(capacity: usize, verbosity: Verbosity) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_decision_id: 0,
            verbosity,
        }
    }

    /// Append a record built from `event` and the current counters.
    pub fn record(&mut self, event: LogEvent, origin: &Origin, stats: &UsageStats) {
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let decision_id = self.next_decision_id;
        let record = LifecycleRecord {
            decision_id,
            trace_id: format!("xmemory::{}::{:016x}", event.symbol, decision_id),
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            kind: event.kind,
            outcome: event.outcome,
            details: event.details,
            origin: origin.to_string(),
            cell_count: stats.cell_count,
            bytes_ram: stats.bytes_ram,
            bytes_swap: stats.bytes_swap,
        };

        if record.level >= LogLevel::Warn || self.verbosity.traces() {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", record.echo_line());
        }

        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn records(&self) -> &VecDeque<LifecycleRecord> {
        &self.records
    }

    /// Take every retained record, oldest first.
    pub fn drain(&mut self) -> Vec<LifecycleRecord> {
        self.records.drain(..).collect()
    }

    #[must_use]
    pub const fn last_decision_id(&self) -> u64 {
        self.next_decision_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_carry_trace_and_decision_ids() {
        let mut log = LifecycleLog::new(16, Verbosity::Quiet);
        let stats = UsageStats {
            cell_count: 2,
            bytes_ram: 48,
            ..UsageStats::default()
        };
        log.record(
            LogEvent::new(LogLevel::Trace, "malloc", "alloc_ram", "success")
                .ptr(0x1000)
                .size(48)
                .kind(CellKind::Ram),
            &Origin::new("flat.c", 12),
            &stats,
        );
        log.record(
            LogEvent::new(LogLevel::Debug, "free", "release", "success"),
            &Origin::unknown(),
            &UsageStats::default(),
        );

        let records = log.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision_id, 1);
        assert_eq!(records[0].trace_id, "xmemory::malloc::0000000000000001");
        assert_eq!(records[0].origin, "flat.c (12)");
        assert_eq!(records[0].cell_count, 2);
        assert_eq!(records[0].kind, Some(CellKind::Ram));
        assert_eq!(records[1].trace_id, "xmemory::free::0000000000000002");
        assert!(log.records().is_empty());
        assert_eq!(log.last_decision_id(), 2);
    }

    #[test]
    fn bounded_capacity_drops_oldest() {
        let mut log = LifecycleLog::new(2, Verbosity::Quiet);
        for _ in 0..5 {
            log.record(
                LogEvent::new(LogLevel::Trace, "malloc", "alloc_ram", "success"),
                &Origin::unknown(),
                &UsageStats::default(),
            );
        }
        let ids: Vec<u64> = log.records().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn echo_line_format() {
        let mut log = LifecycleLog::new(4, Verbosity::Quiet);
        log.record(
            LogEvent::new(LogLevel::Warn, "free", "unknown_pointer", "forwarded")
                .ptr(0xbeef)
                .details("not registered"),
            &Origin::new("dark.c", 3),
            &UsageStats::default(),
        );
        let line = log.records()[0].echo_line();
        assert_eq!(
            line,
            "xmem: dark.c (3) free: unknown_pointer ptr=0xbeef -- not registered"
        );
    }

    #[test]
    fn serialized_record_omits_empty_fields() {
        let mut log = LifecycleLog::new(4, Verbosity::Quiet);
        log.record(
            LogEvent::new(LogLevel::Info, "status", "status_dump", "written"),
            &Origin::unknown(),
            &UsageStats::default(),
        );
        let json = serde_json::to_value(&log.records()[0]).unwrap();
        assert_eq!(json["level"], "info");
        assert_eq!(json["symbol"], "status");
        assert!(json.get("ptr").is_none());
        assert!(json.get("details").is_none());
    }
}
