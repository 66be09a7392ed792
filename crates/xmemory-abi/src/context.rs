//! The allocator context.
//!
//! [`XMemory`] owns the pointer registry, the swap ledger, the lifecycle log
//! and a [`Platform`]. Each facade call dispatches on the operating mode:
//! passthrough and checked modes forward to the system allocator, managed
//! mode goes through the registry and the RAM / swap / mapped strategies
//! (implemented in the `ram`, `swap` and `mapping` modules).

use std::ffi::CStr;
use std::io::{self, Write};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use xmemory_core::log::{LifecycleLog, LifecycleRecord, LogEvent, LogLevel};
use xmemory_core::{
    Backing, CellKind, MemoryCell, OperatingMode, Origin, Registry, ResourceProbe, SlotIndex,
    StatusReport, SwapLedger, UsageStats, XmemConfig, XmemError,
};

use crate::platform::{self, Platform, SystemPlatform};

/// Called once a fatal condition has been logged and the swap files removed.
pub type FatalHandler = fn(&XmemError, &Origin) -> !;

/// Default fatal handler: terminate the process with status 255.
pub fn exit_process(_err: &XmemError, _origin: &Origin) -> ! {
    std::process::exit(255)
}

/// Allocator context.
///
/// Dropping it releases every cell it still tracks. RAM blocks go back to
/// the system heap and mappings are unmapped whatever their reference count;
/// then every swap file the context named is removed.
pub struct XMemory<P: Platform = SystemPlatform> {
    pub(crate) config: XmemConfig,
    pub(crate) platform: P,
    pub(crate) registry: Registry,
    pub(crate) ledger: Arc<SwapLedger>,
    pub(crate) probe: ResourceProbe,
    pub(crate) log: LifecycleLog,
    fatal: FatalHandler,
}

impl XMemory<SystemPlatform> {
    /// Context over the system platform.
    #[must_use]
    pub fn new(config: XmemConfig) -> Self {
        Self::with_platform(config, SystemPlatform)
    }

    /// Context configured as the crate was built.
    #[must_use]
    pub fn from_build() -> Self {
        Self::new(XmemConfig::from_build())
    }
}

impl<P: Platform> XMemory<P> {
    #[must_use]
    pub fn with_platform(config: XmemConfig, platform: P) -> Self {
        let managed = config.mode.tracks();
        let probe = if managed {
            platform::probe_resources(&platform)
        } else {
            ResourceProbe::unlimited(platform.page_size())
        };
        // The registry is only consulted in managed mode.
        let capacity = if managed { config.capacity } else { 1 };
        let ledger = Arc::new(SwapLedger::new(config.tmpdir.clone(), platform.pid()));
        let log = LifecycleLog::new(config.log_capacity, config.verbosity);
        Self {
            registry: Registry::with_capacity(capacity),
            ledger,
            probe,
            log,
            platform,
            config,
            fatal: exit_process,
        }
    }

    /// Replace the fatal handler (tests install one that panics).
    #[must_use]
    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal = handler;
        self
    }

    #[must_use]
    pub fn config(&self) -> &XmemConfig {
        &self.config
    }

    #[must_use]
    pub fn mode(&self) -> OperatingMode {
        self.config.mode
    }

    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn probe(&self) -> &ResourceProbe {
        &self.probe
    }

    /// Ledger of swap files named by this context.
    #[must_use]
    pub fn ledger(&self) -> &Arc<SwapLedger> {
        &self.ledger
    }

    /// Registered cell owning `ptr` (exact base or inside a mapping).
    #[must_use]
    pub fn cell_for(&self, ptr: NonNull<u8>) -> Option<&MemoryCell> {
        self.registry
            .find_owner(ptr.as_ptr() as usize)
            .and_then(|slot| self.registry.get(slot))
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> UsageStats {
        *self.registry.stats()
    }

    #[must_use]
    pub fn logs(&self) -> Vec<LifecycleRecord> {
        self.log.records().iter().cloned().collect()
    }

    pub fn drain_logs(&mut self) -> Vec<LifecycleRecord> {
        self.log.drain()
    }

    // -----------------------------------------------------------------------
    // Facade
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes.
    pub fn malloc(&mut self, size: usize, origin: &Origin) -> Option<NonNull<u8>> {
        match self.config.mode {
            OperatingMode::Passthrough => self.platform.sys_malloc(size),
            OperatingMode::Checked => match self.platform.sys_malloc(size) {
                Some(ptr) => Some(ptr),
                None => self.fatal(XmemError::AllocationFailed { size }, origin),
            },
            OperatingMode::Managed => self.managed_malloc(size, origin, "malloc"),
        }
    }

    /// Allocate `count * size` zeroed bytes. Overflow of the product yields
    /// `None` (fatal in checked mode).
    pub fn calloc(&mut self, count: usize, size: usize, origin: &Origin) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(size) else {
            return self.soft_failure(
                "calloc",
                XmemError::SizeOverflow { count, size },
                origin,
            );
        };
        match self.config.mode {
            OperatingMode::Passthrough => self.platform.sys_calloc(count, size),
            OperatingMode::Checked => match self.platform.sys_calloc(count, size) {
                Some(ptr) => Some(ptr),
                None => self.fatal(XmemError::AllocationFailed { size: total }, origin),
            },
            OperatingMode::Managed => {
                let ptr = self.managed_malloc(total, origin, "calloc")?;
                // SAFETY: the block was just allocated with `total` bytes.
                unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
                Some(ptr)
            }
        }
    }

    /// Resize a block.
    ///
    /// `None` behaves like `malloc`. A size of zero releases `ptr` and returns
    /// `None`. Pointers the registry does not know are forwarded to the system
    /// `realloc`.
    ///
    /// # Safety
    /// `ptr` must come from this context or from the system allocator, and
    /// must not be used after a successful call.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: &Origin,
    ) -> Option<NonNull<u8>> {
        if !self.config.mode.tracks() {
            let resized = match ptr {
                // SAFETY: forwarded caller contract.
                Some(ptr) => unsafe { self.platform.sys_realloc(ptr, size) },
                None => self.platform.sys_malloc(size),
            };
            if resized.is_none() && size > 0 && self.config.mode.fatal_on_failure() {
                self.fatal(XmemError::AllocationFailed { size }, origin);
            }
            return resized;
        }

        let Some(old) = ptr else {
            return self.managed_malloc(size, origin, "realloc");
        };
        let addr = old.as_ptr() as usize;
        let Some(slot) = self.registry.find_owner(addr) else {
            self.log.record(
                LogEvent::new(LogLevel::Warn, "realloc", "unknown_pointer", "forwarded")
                    .ptr(addr)
                    .size(size)
                    .details("not registered, handed to the system realloc"),
                origin,
                self.registry.stats(),
            );
            // SAFETY: forwarded caller contract.
            return unsafe { self.platform.sys_realloc(old, size) };
        };

        if size == 0 {
            // SAFETY: `old` is registered and the caller gives it up.
            unsafe { self.release(slot, addr, "realloc", origin) };
            return None;
        }

        let available = self
            .registry
            .get(slot)
            .map_or(0, |cell| cell.end().saturating_sub(addr));
        let new = self.managed_malloc(size, origin, "realloc")?;
        // SAFETY: `old` is readable for `available` bytes, `new` writable for
        // `size`; distinct live blocks never overlap.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), available.min(size)) };
        // Slot indices do not survive an insert.
        if let Some(slot) = self.registry.find_owner(addr) {
            // SAFETY: as above.
            unsafe { self.release(slot, addr, "realloc", origin) };
        }
        Some(new)
    }

    /// Release a block.
    ///
    /// `None` only logs a warning. Pointers inside a shared mapping drop one
    /// reference to it. Unknown pointers are forwarded to the system `free`.
    ///
    /// # Safety
    /// `ptr` must come from this context or from the system allocator and
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>, origin: &Origin) {
        if !self.config.mode.tracks() {
            if let Some(ptr) = ptr {
                // SAFETY: forwarded caller contract.
                unsafe { self.platform.sys_free(ptr) };
            }
            return;
        }
        let Some(ptr) = ptr else {
            self.log.record(
                LogEvent::new(LogLevel::Warn, "free", "free_null", "ignored")
                    .details("free requested on NULL pointer"),
                origin,
                self.registry.stats(),
            );
            return;
        };
        let addr = ptr.as_ptr() as usize;
        match self.registry.find_owner(addr) {
            // SAFETY: registered pointer given up by the caller.
            Some(slot) => unsafe { self.release(slot, addr, "free", origin) },
            None => {
                self.log.record(
                    LogEvent::new(LogLevel::Warn, "free", "unknown_pointer", "forwarded")
                        .ptr(addr)
                        .details("not registered, handed to the system free"),
                    origin,
                    self.registry.stats(),
                );
                // SAFETY: forwarded caller contract.
                unsafe { self.platform.sys_free(ptr) };
            }
        }
    }

    /// Copy a C string (including its NUL) into a fresh block.
    pub fn strdup(&mut self, s: &CStr, origin: &Origin) -> Option<NonNull<u8>> {
        let bytes = s.to_bytes_with_nul();
        let dst = match self.config.mode {
            OperatingMode::Managed => self.managed_malloc(bytes.len(), origin, "strdup")?,
            _ => self.malloc(bytes.len(), origin)?,
        };
        // SAFETY: `dst` holds `bytes.len()` freshly allocated bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Some(dst)
    }

    /// Map `path` and return a pointer `offset` bytes into it together with
    /// the number of bytes available from there.
    ///
    /// In managed mode a file that is already mapped is shared: its reference
    /// count grows and no new mapping is made.
    pub fn falloc(
        &mut self,
        path: &Path,
        offset: usize,
        origin: &Origin,
    ) -> Option<(NonNull<u8>, usize)> {
        if self.config.mode.tracks() {
            self.managed_falloc(path, offset, origin)
        } else {
            self.unmanaged_falloc(path, offset, origin)
        }
    }

    /// Give back a pointer obtained from [`XMemory::falloc`].
    ///
    /// # Safety
    /// `ptr` must come from `falloc` with the same `offset`, and `size` must
    /// be the mapped length for pointers this context does not track.
    pub unsafe fn fdealloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        offset: usize,
        size: usize,
        origin: &Origin,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe { self.release_mapping(ptr, offset, size, origin) }
    }

    /// Write the status dump to stderr.
    pub fn status(&mut self, origin: &Origin) {
        let mut err = io::stderr().lock();
        let _ = self.write_status(&mut err, origin);
    }

    /// Write the status dump to `out`. Nothing is written outside managed mode.
    pub fn write_status<W: Write>(&self, out: &mut W, origin: &Origin) -> io::Result<()> {
        if !self.config.mode.tracks() {
            return Ok(());
        }
        let report = StatusReport {
            origin,
            verbosity: self.config.verbosity,
            capacity: self.registry.capacity(),
            probe: Some(&self.probe),
            stats: self.registry.stats(),
            ledger: &self.ledger,
        };
        report.write(out, self.registry.cells())
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Origin to store on a new cell at the configured verbosity.
    pub(crate) fn keep_origin(&self, origin: &Origin) -> Option<Origin> {
        self.config
            .verbosity
            .tracks_origins()
            .then(|| origin.clone())
    }

    /// Register `cell`; a full registry is fatal.
    pub(crate) fn register(&mut self, cell: MemoryCell, origin: &Origin) -> SlotIndex {
        match self.registry.insert(cell) {
            Ok(slot) => slot,
            Err(err) => self.fatal(err, origin),
        }
    }

    /// Terminate through the fatal handler when the registry cannot take one
    /// more cell. Checked before any backing store is created.
    pub(crate) fn ensure_capacity(&mut self, origin: &Origin) {
        if self.registry.is_full() {
            let capacity = self.registry.capacity();
            self.fatal(XmemError::CapacityExhausted { capacity }, origin);
        }
    }

    /// Log a recoverable failure and return `None`; fatal in checked mode.
    pub(crate) fn soft_failure<T>(
        &mut self,
        symbol: &'static str,
        err: XmemError,
        origin: &Origin,
    ) -> Option<T> {
        if self.config.mode.fatal_on_failure() {
            self.fatal(err, origin);
        }
        self.log.record(
            LogEvent::new(LogLevel::Warn, symbol, err.kind(), "null_returned")
                .details(err.to_string()),
            origin,
            self.registry.stats(),
        );
        None
    }

    /// Log `err`, remove every swap file, then hand over to the fatal handler.
    pub(crate) fn fatal(&mut self, err: XmemError, origin: &Origin) -> ! {
        self.log.record(
            LogEvent::new(LogLevel::Error, "xmemory", err.kind(), "fatal")
                .details(format!("fatal error: {err}")),
            origin,
            self.registry.stats(),
        );
        self.ledger.sweep();
        (self.fatal)(&err, origin)
    }

    /// Tear down the cell at `slot` (or drop one reference if it is a shared
    /// mapping). `addr` is the pointer the caller handed in.
    ///
    /// # Safety
    /// The caller gives up every pointer into a block that is released.
    pub(crate) unsafe fn release(
        &mut self,
        slot: SlotIndex,
        addr: usize,
        symbol: &'static str,
        origin: &Origin,
    ) {
        let Some(kind) = self.registry.get(slot).map(MemoryCell::kind) else {
            return;
        };
        if kind == CellKind::Mapped {
            // SAFETY: forwarded caller contract.
            unsafe { self.drop_mapping_ref(slot, symbol, origin) };
            return;
        }
        let Some(cell) = self.registry.remove(slot) else {
            return;
        };
        let Some(base) = NonNull::new(cell.address as *mut u8) else {
            return;
        };
        match &cell.backing {
            // SAFETY: RAM cells come from the system allocator.
            Backing::Ram => unsafe { self.platform.sys_free(base) },
            // SAFETY: swap cells own their mapping and descriptor.
            Backing::Swap { .. } => unsafe { self.release_swap(&cell, base, origin) },
            Backing::Mapped { .. } => {}
        }
        self.log.record(
            LogEvent::new(LogLevel::Trace, symbol, "release", "success")
                .ptr(addr)
                .size(cell.size)
                .kind(kind),
            origin,
            self.registry.stats(),
        );
    }
}

impl<P: Platform> Drop for XMemory<P> {
    fn drop(&mut self) {
        for cell in self.registry.drain() {
            let Some(base) = NonNull::new(cell.address as *mut u8) else {
                continue;
            };
            // SAFETY: blocks handed out by a context do not outlive it.
            unsafe {
                match &cell.backing {
                    Backing::Ram => self.platform.sys_free(base),
                    Backing::Swap { fd, mapped_len, .. } => {
                        let _ = self.platform.unmap(base, *mapped_len);
                        self.platform.close(*fd);
                    }
                    Backing::Mapped { .. } => {
                        let _ = self.platform.unmap(base, cell.size);
                    }
                }
            }
        }
        self.ledger.sweep();
    }
}
