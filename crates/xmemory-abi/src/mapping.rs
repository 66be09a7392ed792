//! Shared file mappings (`falloc` / `fdealloc`).
//!
//! In managed mode each file is mapped at most once. Later requests for the
//! same path share the mapping and bump its reference count; the mapping is
//! torn down when the count returns to zero.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use xmemory_core::log::{LogEvent, LogLevel};
use xmemory_core::{CellKind, MemoryCell, Origin, SlotIndex, XmemError};

use crate::context::XMemory;
use crate::platform::Platform;

impl<P: Platform> XMemory<P> {
    pub(crate) fn managed_falloc(
        &mut self,
        path: &Path,
        offset: usize,
        origin: &Origin,
    ) -> Option<(NonNull<u8>, usize)> {
        if let Some(slot) = self.registry.find_mapped(path) {
            let (address, size) = self.registry.get(slot).map(|c| (c.address, c.size))?;
            if offset >= size {
                let err = XmemError::OffsetOutOfRange {
                    path: path.to_path_buf(),
                    offset,
                    size,
                };
                return self.soft_failure("falloc", err, origin);
            }
            let refs = self.registry.acquire_mapping(slot)?;
            self.log.record(
                LogEvent::new(LogLevel::Trace, "falloc", "map_shared", "success")
                    .ptr(address)
                    .size(size)
                    .kind(CellKind::Mapped)
                    .details(format!("{} now has {refs} holders", path.display())),
                origin,
                self.registry.stats(),
            );
            let ptr = NonNull::new((address + offset) as *mut u8)?;
            return Some((ptr, size - offset));
        }

        self.ensure_capacity(origin);
        let (base, size) = self.map_whole_file(path, offset, origin)?;
        let cell = MemoryCell::mapped(base.as_ptr() as usize, size, path, self.keep_origin(origin));
        self.register(cell, origin);
        self.log.record(
            LogEvent::new(LogLevel::Debug, "falloc", "map_file", "success")
                .ptr(base.as_ptr() as usize)
                .size(size)
                .kind(CellKind::Mapped)
                .details(format!("mmap succeeded for [{}]", path.display())),
            origin,
            self.registry.stats(),
        );
        // SAFETY: offset < size, so the result stays inside the mapping.
        let ptr = unsafe { base.add(offset) };
        Some((ptr, size - offset))
    }

    /// Map without tracking (passthrough and checked modes).
    pub(crate) fn unmanaged_falloc(
        &mut self,
        path: &Path,
        offset: usize,
        origin: &Origin,
    ) -> Option<(NonNull<u8>, usize)> {
        let (base, size) = self.map_whole_file(path, offset, origin)?;
        // SAFETY: offset < size, so the result stays inside the mapping.
        Some((unsafe { base.add(offset) }, size - offset))
    }

    /// stat, bounds-check, open, map and close. Failures follow the mode's
    /// failure policy.
    fn map_whole_file(
        &mut self,
        path: &Path,
        offset: usize,
        origin: &Origin,
    ) -> Option<(NonNull<u8>, usize)> {
        let len = match self.platform.file_len(path) {
            Ok(len) => len,
            Err(source) => {
                let err = XmemError::Stat {
                    path: path.to_path_buf(),
                    source,
                };
                return self.soft_failure("falloc", err, origin);
            }
        };
        let size = usize::try_from(len).unwrap_or(usize::MAX);
        if offset >= size {
            let err = XmemError::OffsetOutOfRange {
                path: path.to_path_buf(),
                offset,
                size,
            };
            return self.soft_failure("falloc", err, origin);
        }
        let file = match self.platform.open_readonly(path) {
            Ok(file) => file,
            Err(source) => {
                let err = XmemError::Open {
                    path: path.to_path_buf(),
                    source,
                };
                return self.soft_failure("falloc", err, origin);
            }
        };
        let mapped = self.platform.map_private(file.as_raw_fd(), size);
        drop(file);
        match mapped {
            Ok(base) => Some((base, size)),
            Err(source) => {
                let err = XmemError::Map {
                    path: path.to_path_buf(),
                    source,
                };
                self.soft_failure("falloc", err, origin)
            }
        }
    }

    /// `fdealloc` body.
    ///
    /// # Safety
    /// See [`XMemory::fdealloc`].
    pub(crate) unsafe fn release_mapping(
        &mut self,
        ptr: Option<NonNull<u8>>,
        offset: usize,
        size: usize,
        origin: &Origin,
    ) {
        let Some(ptr) = ptr else {
            if self.config.mode.tracks() {
                self.log.record(
                    LogEvent::new(LogLevel::Warn, "fdealloc", "free_null", "ignored")
                        .details("fdealloc requested on NULL pointer"),
                    origin,
                    self.registry.stats(),
                );
            }
            return;
        };
        let addr = ptr.as_ptr() as usize;

        if self.config.mode.tracks() {
            if let Some(slot) = self.registry.find_owner(addr) {
                // SAFETY: registered pointer given up by the caller.
                unsafe { self.release(slot, addr, "fdealloc", origin) };
                return;
            }
            self.log.record(
                LogEvent::new(LogLevel::Warn, "fdealloc", "unknown_pointer", "munmap")
                    .ptr(addr)
                    .size(size)
                    .details("not registered, unmapping caller range"),
                origin,
                self.registry.stats(),
            );
        }

        let Some(base) = addr.checked_sub(offset).and_then(|b| NonNull::new(b as *mut u8)) else {
            return;
        };
        // SAFETY: the caller vouches that [ptr - offset, +size) is its mapping.
        if let Err(err) = unsafe { self.platform.unmap(base, size) } {
            self.log.record(
                LogEvent::new(LogLevel::Warn, "fdealloc", "munmap_failed", "ignored")
                    .ptr(addr)
                    .size(size)
                    .details(err.to_string()),
                origin,
                self.registry.stats(),
            );
        }
    }

    /// Drop one holder of the mapped cell at `slot`; unmap at zero.
    ///
    /// # Safety
    /// At zero holders nothing may reference the mapping any more.
    pub(crate) unsafe fn drop_mapping_ref(
        &mut self,
        slot: SlotIndex,
        symbol: &'static str,
        origin: &Origin,
    ) {
        let Some(remaining) = self.registry.release_mapping(slot) else {
            return;
        };
        if remaining > 0 {
            let address = self.registry.get(slot).map_or(0, |c| c.address);
            self.log.record(
                LogEvent::new(LogLevel::Trace, symbol, "unmap_deferred", "shared")
                    .ptr(address)
                    .kind(CellKind::Mapped)
                    .details(format!("{remaining} holders left")),
                origin,
                self.registry.stats(),
            );
            return;
        }
        let Some(cell) = self.registry.remove(slot) else {
            return;
        };
        if let Some(base) = NonNull::new(cell.address as *mut u8) {
            // SAFETY: last holder gone.
            if let Err(err) = unsafe { self.platform.unmap(base, cell.size) } {
                self.log.record(
                    LogEvent::new(LogLevel::Warn, symbol, "munmap_failed", "leaked")
                        .ptr(cell.address)
                        .size(cell.size)
                        .details(err.to_string()),
                    origin,
                    self.registry.stats(),
                );
            }
        }
        self.log.record(
            LogEvent::new(LogLevel::Debug, symbol, "unmap", "success")
                .ptr(cell.address)
                .size(cell.size)
                .kind(CellKind::Mapped),
            origin,
            self.registry.stats(),
        );
    }
}
