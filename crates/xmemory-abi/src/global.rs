//! Process-wide allocator context.
//!
//! One [`XMemory`] over the system platform lives behind a single mutex and
//! is created on first use. Creating it registers an `atexit` hook that
//! removes every swap file the process named; the hook only reads the shared
//! [`SwapLedger`], never the mutex.

use std::ffi::CStr;
use std::io::{self, Write};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use xmemory_core::{LifecycleRecord, Origin, SwapLedger, UsageStats, XmemConfig};

use crate::context::XMemory;

static GLOBAL: Mutex<Option<XMemory>> = parking_lot::const_mutex(None);

/// Ledger of the global context, read by the exit hook.
static EXIT_LEDGER: OnceLock<Arc<SwapLedger>> = OnceLock::new();

extern "C" fn cleanup_at_exit() {
    if let Some(ledger) = EXIT_LEDGER.get() {
        ledger.sweep();
    }
}

fn install(mem: XMemory) -> XMemory {
    if EXIT_LEDGER.set(Arc::clone(mem.ledger())).is_ok() {
        // SAFETY: `cleanup_at_exit` is a plain function that touches only
        // the ledger, which lives for the rest of the process.
        unsafe { libc::atexit(cleanup_at_exit) };
    }
    mem
}

/// Create the global context from `config` instead of the build defaults.
///
/// Returns `false` (and changes nothing) once the context exists.
pub fn configure(config: XmemConfig) -> bool {
    let mut guard = GLOBAL.lock();
    if guard.is_some() {
        return false;
    }
    *guard = Some(install(XMemory::new(config)));
    true
}

/// Run `f` on the global context, creating it first if needed.
pub fn with_context<R>(f: impl FnOnce(&mut XMemory) -> R) -> R {
    let mut guard = GLOBAL.lock();
    let mem = guard.get_or_insert_with(|| install(XMemory::from_build()));
    f(mem)
}

pub fn malloc(size: usize, origin: &Origin) -> Option<NonNull<u8>> {
    with_context(|mem| mem.malloc(size, origin))
}

pub fn calloc(count: usize, size: usize, origin: &Origin) -> Option<NonNull<u8>> {
    with_context(|mem| mem.calloc(count, size, origin))
}

/// # Safety
/// See [`XMemory::realloc`].
pub unsafe fn realloc(
    ptr: Option<NonNull<u8>>,
    size: usize,
    origin: &Origin,
) -> Option<NonNull<u8>> {
    // SAFETY: forwarded caller contract.
    with_context(|mem| unsafe { mem.realloc(ptr, size, origin) })
}

/// # Safety
/// See [`XMemory::free`].
pub unsafe fn free(ptr: Option<NonNull<u8>>, origin: &Origin) {
    // SAFETY: forwarded caller contract.
    with_context(|mem| unsafe { mem.free(ptr, origin) });
}

pub fn strdup(s: &CStr, origin: &Origin) -> Option<NonNull<u8>> {
    with_context(|mem| mem.strdup(s, origin))
}

pub fn falloc(path: &Path, offset: usize, origin: &Origin) -> Option<(NonNull<u8>, usize)> {
    with_context(|mem| mem.falloc(path, offset, origin))
}

/// # Safety
/// See [`XMemory::fdealloc`].
pub unsafe fn fdealloc(ptr: Option<NonNull<u8>>, offset: usize, size: usize, origin: &Origin) {
    // SAFETY: forwarded caller contract.
    with_context(|mem| unsafe { mem.fdealloc(ptr, offset, size, origin) });
}

pub fn status(origin: &Origin) {
    with_context(|mem| mem.status(origin));
}

pub fn write_status<W: Write>(out: &mut W, origin: &Origin) -> io::Result<()> {
    with_context(|mem| mem.write_status(out, origin))
}

#[must_use]
pub fn snapshot() -> UsageStats {
    with_context(|mem| mem.snapshot())
}

pub fn drain_logs() -> Vec<LifecycleRecord> {
    with_context(XMemory::drain_logs)
}

/// Ledger shared with the exit hook.
#[must_use]
pub fn swap_ledger() -> Arc<SwapLedger> {
    with_context(|mem| Arc::clone(mem.ledger()))
}
