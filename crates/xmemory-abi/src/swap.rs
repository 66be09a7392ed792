//! Swap strategy: a zero-filled temporary file mapped privately, one file per
//! allocation.

use std::ptr::NonNull;

use xmemory_core::log::{LogEvent, LogLevel};
use xmemory_core::swap::round_to_page;
use xmemory_core::{Backing, CellKind, MemoryCell, Origin, XmemError};

use crate::context::XMemory;
use crate::platform::Platform;

impl<P: Platform> XMemory<P> {
    /// Back `size` bytes with a fresh swap file. Any failure is fatal.
    pub(crate) fn alloc_swap(
        &mut self,
        size: usize,
        origin: &Origin,
        symbol: &'static str,
    ) -> NonNull<u8> {
        let Some(mapped_len) = round_to_page(size, self.probe.page_size) else {
            self.fatal(XmemError::SizeOverflow { count: 1, size }, origin);
        };
        let (file_id, path) = self.ledger.next_path();

        let fd = match self.platform.create_swap_file(&path, mapped_len) {
            Ok(fd) => fd,
            Err(source) => self.fatal(XmemError::SwapCreate { path, source }, origin),
        };
        let ptr = match self.platform.map_private(fd, mapped_len) {
            Ok(ptr) => ptr,
            Err(source) => {
                self.platform.close(fd);
                let _ = self.platform.remove_file(&path);
                self.fatal(XmemError::SwapMap { path, source }, origin)
            }
        };

        let cell = MemoryCell::swap(
            ptr.as_ptr() as usize,
            size,
            file_id,
            fd,
            mapped_len,
            self.keep_origin(origin),
        );
        self.register(cell, origin);
        self.log.record(
            LogEvent::new(LogLevel::Info, symbol, "swap_spill", "success")
                .ptr(ptr.as_ptr() as usize)
                .size(size)
                .kind(CellKind::Swap)
                .details(format!("swap [{}] created", path.display())),
            origin,
            self.registry.stats(),
        );
        ptr
    }

    /// Unmap a removed swap cell, close its descriptor and delete its file.
    ///
    /// # Safety
    /// `base` is the cell's mapping and nothing references it any more.
    pub(crate) unsafe fn release_swap(
        &mut self,
        cell: &MemoryCell,
        base: NonNull<u8>,
        origin: &Origin,
    ) {
        let Backing::Swap {
            file_id,
            fd,
            mapped_len,
        } = cell.backing
        else {
            return;
        };
        // SAFETY: forwarded caller contract.
        if let Err(err) = unsafe { self.platform.unmap(base, mapped_len) } {
            self.log.record(
                LogEvent::new(LogLevel::Warn, "free", "munmap_failed", "leaked")
                    .ptr(cell.address)
                    .size(mapped_len)
                    .details(err.to_string()),
                origin,
                self.registry.stats(),
            );
        }
        self.platform.close(fd);
        let path = self.ledger.path_for(file_id);
        if let Err(err) = self.platform.remove_file(&path) {
            self.log.record(
                LogEvent::new(LogLevel::Warn, "free", "swap_remove_failed", "left_behind")
                    .details(format!("{}: {err}", path.display())),
                origin,
                self.registry.stats(),
            );
        }
    }
}
