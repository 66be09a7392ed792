//! Structured JSONL logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file or any writer.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks used by the
//!   harness tests.
//!
//! Allocator lifecycle records are carried over with
//! [`LogEntry::from_lifecycle`], so one file holds both the scenario verdicts
//! and the allocator decisions behind them.

use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use xmemory_core::LifecycleRecord;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<xmemory_core::LogLevel> for LogLevel {
    fn from(level: xmemory_core::LogLevel) -> Self {
        match level {
            xmemory_core::LogLevel::Trace => Self::Trace,
            xmemory_core::LogLevel::Debug => Self::Debug,
            xmemory_core::LogLevel::Info => Self::Info,
            xmemory_core::LogLevel::Warn => Self::Warn,
            xmemory_core::LogLevel::Error => Self::Error,
        }
    }
}

/// Scenario or check verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Allocator operating mode (`passthrough`, `checked`, `managed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Backing kind of the cell involved (`ram`, `swap`, `mapped`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            scenario: None,
            mode: None,
            symbol: None,
            outcome: None,
            kind: None,
            size: None,
            origin: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Entry for an allocator lifecycle record. Keeps its trace id.
    #[must_use]
    pub fn from_lifecycle(record: &LifecycleRecord) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.kind = record.kind.map(|k| k.as_str().to_string());
        entry.size = record.size;
        entry.origin = Some(record.origin.clone());
        entry.details = Some(serde_json::json!({
            "decision_id": record.decision_id,
            "outcome": record.outcome,
            "ptr": record.ptr.map(|p| format!("{p:#x}")),
            "cell_count": record.cell_count,
            "bytes_ram": record.bytes_ram,
            "bytes_swap": record.bytes_swap,
            "message": record.details,
        }));
        entry
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    pub fn to_file(path: &Path, run_id: &str) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(Box::new(io::BufWriter::new(file)), run_id))
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    /// Discards everything (no `--log` given).
    #[must_use]
    pub fn sink(run_id: &str) -> Self {
        Self::to_writer(Box::new(io::sink()), run_id)
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("xmemory-harness::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare entry with a generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> io::Result<LogEntry> {
        let entry = LogEntry::new(self.next_trace_id(), level, event);
        self.emit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Emit a populated entry; an empty trace id is filled in.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        let line = entry.to_jsonl().map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    pub fn emit_lifecycle(&mut self, records: &[LifecycleRecord], scenario: &str) -> io::Result<()> {
        for record in records {
            self.emit_entry(LogEntry::from_lifecycle(record).with_scenario(scenario))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

fn field_error(line_number: usize, field: &str, message: impl Into<String>) -> LogValidationError {
    LogValidationError {
        line_number,
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate a single JSONL line and parse it.
pub fn validate_log_line(line: &str, line_number: usize) -> Result<LogEntry, Vec<LogValidationError>> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| vec![field_error(line_number, "<json>", format!("invalid JSON: {e}"))])?;
    let Some(obj) = value.as_object() else {
        return Err(vec![field_error(line_number, "<root>", "expected JSON object")]);
    };

    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(field_error(line_number, field, "required field missing"));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !["trace", "debug", "info", "warn", "error"].contains(&level)
    {
        errors.push(field_error(line_number, "level", format!("invalid level: '{level}'")));
    }

    if let Some(mode) = obj.get("mode").and_then(|v| v.as_str())
        && !["passthrough", "checked", "managed"].contains(&mode)
    {
        errors.push(field_error(line_number, "mode", format!("invalid mode: '{mode}'")));
    }

    if let Some(kind) = obj.get("kind").and_then(|v| v.as_str())
        && !["ram", "swap", "mapped"].contains(&kind)
    {
        errors.push(field_error(line_number, "kind", format!("invalid kind: '{kind}'")));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        errors.push(field_error(
            line_number,
            "trace_id",
            format!("trace_id should be '::'-separated, got: '{trace_id}'"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![field_error(
            line_number,
            "<deserialization>",
            format!("failed to deserialize: {e}"),
        )]
    })
}

/// Validate an entire JSONL file. Returns the number of non-empty lines and
/// every error found.
pub fn validate_log_file(path: &Path) -> io::Result<(usize, Vec<LogValidationError>)> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `YYYY-MM-DDTHH:MM:SS.mmmZ` for the current time.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("xmemory-harness::run-1::001", LogLevel::Info, "scenario_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "scenario_start");
        assert!(parsed.get("scenario").is_none());
        assert!(parsed.get("outcome").is_none());
    }

    #[test]
    fn utc_formatting_is_calendar_exact() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2000-02-29 12:34:56
        assert_eq!(format_utc(951_827_696, 7), "2000-02-29T12:34:56.007Z");
        // 2024-12-31 23:59:59
        assert_eq!(format_utc(1_735_689_599, 999), "2024-12-31T23:59:59.999Z");
    }

    #[test]
    fn validation_rejects_bad_enums_and_missing_fields() {
        let errs = validate_log_line(r#"{"trace_id":"a::b","level":"loud","event":"x"}"#, 3)
            .unwrap_err();
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"timestamp"));
        assert!(fields.contains(&"level"));
        assert_eq!(errs[0].line_number, 3);

        let errs = validate_log_line(
            r#"{"timestamp":"t","trace_id":"nocolons","level":"info","event":"x","kind":"disk"}"#,
            1,
        )
        .unwrap_err();
        assert_eq!(errs.len(), 2);

        assert!(validate_log_line("[1,2]", 1).is_err());
        assert!(validate_log_line("{", 1).is_err());
    }

    #[test]
    fn lifecycle_records_convert() {
        let record = LifecycleRecord {
            decision_id: 9,
            trace_id: "xmemory::malloc::0000000000000009".to_string(),
            level: xmemory_core::LogLevel::Info,
            symbol: "malloc",
            event: "swap_spill",
            ptr: Some(0x1000),
            size: Some(64),
            kind: Some(xmemory_core::CellKind::Swap),
            outcome: "success",
            details: String::new(),
            origin: "cube.c (3)".to_string(),
            cell_count: 1,
            bytes_ram: 0,
            bytes_swap: 64,
        };
        let entry = LogEntry::from_lifecycle(&record).with_scenario("spill");
        let line = entry.to_jsonl().unwrap();
        let parsed = validate_log_line(&line, 1).unwrap();
        assert_eq!(parsed.kind.as_deref(), Some("swap"));
        assert_eq!(parsed.level, LogLevel::Info);
        assert_eq!(parsed.details.unwrap()["ptr"], "0x1000");
    }
}
