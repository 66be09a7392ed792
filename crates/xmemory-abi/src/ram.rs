//! Managed allocation: the system heap first, swap when it is exhausted or
//! when the request would cross the probed data limit.

use std::ptr::NonNull;

use xmemory_core::log::{LogEvent, LogLevel};
use xmemory_core::{CellKind, MemoryCell, Origin};

use crate::context::XMemory;
use crate::platform::Platform;

impl<P: Platform> XMemory<P> {
    pub(crate) fn managed_malloc(
        &mut self,
        size: usize,
        origin: &Origin,
        symbol: &'static str,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            self.log.record(
                LogEvent::new(LogLevel::Info, symbol, "zero_size", "null_returned")
                    .size(0)
                    .details("called with 0 size"),
                origin,
                self.registry.stats(),
            );
            return None;
        }
        self.ensure_capacity(origin);

        let total = self.registry.stats().bytes_total();
        let ram = if self.probe.redirects(total, size) {
            self.log.record(
                LogEvent::new(LogLevel::Debug, symbol, "data_limit_redirect", "swap")
                    .size(size)
                    .details(format!(
                        "{total} + {size} bytes exceeds RLIMIT_DATA {:?}",
                        self.probe.data_limit
                    )),
                origin,
                self.registry.stats(),
            );
            None
        } else {
            self.platform.sys_malloc(size)
        };

        let Some(ptr) = ram else {
            return Some(self.alloc_swap(size, origin, symbol));
        };

        // SAFETY: `ptr` was just allocated with `size` bytes.
        unsafe { self.platform.commit_pages(ptr, size) };
        let cell = MemoryCell::ram(ptr.as_ptr() as usize, size, self.keep_origin(origin));
        self.register(cell, origin);
        self.log.record(
            LogEvent::new(LogLevel::Trace, symbol, "alloc", "success")
                .ptr(ptr.as_ptr() as usize)
                .size(size)
                .kind(CellKind::Ram),
            origin,
            self.registry.stats(),
        );
        Some(ptr)
    }
}
