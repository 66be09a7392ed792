//! Allocator configuration.
//!
//! Operating mode and verbosity are fixed when the crate is built:
//! - mode comes from the cargo features `mode-passthrough` / `mode-checked`
//!   (neither selects the fully managed allocator),
//! - verbosity comes from the `XMEMORY_DEBUG` environment variable at compile
//!   time (`0`, `1` or `2`).
//!
//! The only runtime input is `XMEMORY_TMPDIR`, the directory that receives swap
//! files. It is read once and cached for the life of the process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;

/// Default number of cells the pointer registry can hold.
pub const DEFAULT_CAPACITY: usize = 200_000;

/// Default number of lifecycle records retained before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Environment variable naming the swap-file directory.
pub const TMPDIR_ENV: &str = "XMEMORY_TMPDIR";

/// How allocation requests are served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Forward everything to the system allocator, failures returned as null.
    Passthrough = 0,
    /// Forward everything to the system allocator, failures are fatal.
    Checked = 1,
    /// Tracked RAM / swap / mapped allocation.
    #[default]
    Managed = 2,
}

impl OperatingMode {
    /// Parse from string (case-insensitive). Unknown names select `Managed`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "0" | "passthrough" | "system" | "off" => Self::Passthrough,
            "1" | "checked" | "strict" => Self::Checked,
            _ => Self::Managed,
        }
    }

    /// Mode selected by cargo features at build time.
    #[must_use]
    pub const fn compiled() -> Self {
        if cfg!(feature = "mode-passthrough") {
            Self::Passthrough
        } else if cfg!(feature = "mode-checked") {
            Self::Checked
        } else {
            Self::Managed
        }
    }

    /// Whether requests go through the registry.
    #[must_use]
    pub const fn tracks(self) -> bool {
        matches!(self, Self::Managed)
    }

    /// Whether allocation and mapping failures terminate the process.
    #[must_use]
    pub const fn fatal_on_failure(self) -> bool {
        matches!(self, Self::Checked)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Checked => "checked",
            Self::Managed => "managed",
        }
    }
}

/// How much diagnostic text the allocator emits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Warnings and fatal errors only.
    #[default]
    Quiet = 0,
    /// Record call-site origins and print probe values in status dumps.
    Leaks = 1,
    /// Echo every lifecycle record.
    Trace = 2,
}

impl Verbosity {
    #[must_use]
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Quiet,
            1 => Self::Leaks,
            _ => Self::Trace,
        }
    }

    /// Parse a numeric level; anything unparseable is `Quiet`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        s.trim().parse::<u8>().map_or(Self::Quiet, Self::from_level)
    }

    /// Level baked in from `XMEMORY_DEBUG` at compile time.
    #[must_use]
    pub fn compiled() -> Self {
        option_env!("XMEMORY_DEBUG").map_or(Self::Quiet, Self::from_str_loose)
    }

    #[must_use]
    pub const fn tracks_origins(self) -> bool {
        !matches!(self, Self::Quiet)
    }

    #[must_use]
    pub const fn traces(self) -> bool {
        matches!(self, Self::Trace)
    }
}

static TMPDIR: OnceLock<PathBuf> = OnceLock::new();

/// Swap-file directory from `XMEMORY_TMPDIR`, `.` when unset or empty.
#[must_use]
pub fn default_tmpdir() -> &'static Path {
    TMPDIR.get_or_init(|| {
        std::env::var_os(TMPDIR_ENV)
            .filter(|v| !v.is_empty())
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    })
}

/// Full allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XmemConfig {
    pub mode: OperatingMode,
    pub verbosity: Verbosity,
    /// Fixed registry capacity.
    pub capacity: usize,
    /// Directory receiving swap files.
    pub tmpdir: PathBuf,
    /// Bound on retained lifecycle records.
    pub log_capacity: usize,
}

impl XmemConfig {
    /// Configuration as built: feature-selected mode, compiled verbosity,
    /// environment tmpdir.
    #[must_use]
    pub fn from_build() -> Self {
        Self {
            mode: OperatingMode::compiled(),
            verbosity: Verbosity::compiled(),
            capacity: DEFAULT_CAPACITY,
            tmpdir: default_tmpdir().to_path_buf(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Registry capacity; clamped to at least one slot.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_tmpdir(mut self, tmpdir: impl Into<PathBuf>) -> Self {
        self.tmpdir = tmpdir.into();
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, log_capacity: usize) -> Self {
        self.log_capacity = log_capacity;
        self
    }
}

impl Default for XmemConfig {
    fn default() -> Self {
        Self::from_build()
    }
}
