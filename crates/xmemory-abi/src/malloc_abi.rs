//! C entry points (`xmemory_malloc`, `xmemory_free`, ...).
//!
//! Every function takes the caller's `__FILE__` / `__LINE__` and forwards to
//! the global context. A NULL `file` is recorded as `<unknown>`.

use std::collections::HashMap;
use std::ffi::{CStr, OsStr, c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::LazyLock;

use parking_lot::Mutex;
use xmemory_core::Origin;

use crate::global;

/// Distinct `__FILE__` names kept for the life of the process.
const MAX_INTERNED_FILES: usize = 4096;

static FILE_NAMES: LazyLock<Mutex<HashMap<Box<[u8]>, &'static str>>> =
    LazyLock::new(Mutex::default);

/// Process-lifetime copy of a C file name. Only the first call for a given
/// name allocates; `None` once the table is full.
fn intern_file(name: &CStr) -> Option<&'static str> {
    let bytes = name.to_bytes();
    let mut names = FILE_NAMES.lock();
    if let Some(&file) = names.get(bytes) {
        return Some(file);
    }
    if names.len() >= MAX_INTERNED_FILES {
        return None;
    }
    let file: &'static str = Box::leak(name.to_string_lossy().into_owned().into_boxed_str());
    names.insert(bytes.into(), file);
    Some(file)
}

/// # Safety
/// `file` is NULL or a NUL-terminated string.
unsafe fn origin_from_c(file: *const c_char, line: c_int) -> Origin {
    if file.is_null() {
        return Origin::unknown();
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(file) };
    let line = u32::try_from(line).unwrap_or(0);
    match intern_file(name) {
        Some(file) => Origin::new(file, line),
        None => Origin::owned(name.to_string_lossy(), line),
    }
}

fn into_raw(ptr: Option<NonNull<u8>>) -> *mut c_void {
    ptr.map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

// ---------------------------------------------------------------------------
// malloc / calloc / realloc / free
// ---------------------------------------------------------------------------

/// `malloc` replacement. Returns NULL for a zero size.
///
/// # Safety
/// `file` is NULL or a NUL-terminated string. The result must be released
/// with `xmemory_free` or `xmemory_realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_malloc(size: usize, file: *const c_char, line: c_int) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    into_raw(global::malloc(size, &origin))
}

/// `calloc` replacement. Returns NULL when `nmemb * size` overflows.
///
/// # Safety
/// As [`xmemory_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_calloc(
    nmemb: usize,
    size: usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    into_raw(global::calloc(nmemb, size, &origin))
}

/// `realloc` replacement.
///
/// # Safety
/// `ptr` is NULL or a live block from this allocator (or the system one);
/// it must not be used after a non-NULL return or a zero `size`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_realloc(
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    // SAFETY: forwarded caller contract.
    into_raw(unsafe { global::realloc(NonNull::new(ptr.cast()), size, &origin) })
}

/// `free` replacement. NULL is logged and ignored.
///
/// # Safety
/// `ptr` is NULL or a live block; it must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_free(ptr: *mut c_void, file: *const c_char, line: c_int) {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    // SAFETY: forwarded caller contract.
    unsafe { global::free(NonNull::new(ptr.cast()), &origin) };
}

/// `strdup` replacement.
///
/// # Safety
/// `s` is NULL or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_strdup(s: *const c_char, file: *const c_char, line: c_int) -> *mut c_char {
    if s.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    // SAFETY: non-NULL and NUL-terminated per the contract.
    let src = unsafe { CStr::from_ptr(s) };
    into_raw(global::strdup(src, &origin)).cast()
}

// ---------------------------------------------------------------------------
// falloc / fdealloc
// ---------------------------------------------------------------------------

/// Map `path` and return a pointer `offset` bytes into it. The number of
/// bytes available from the returned pointer is stored in `*size_out`
/// (0 on failure) when `size_out` is not NULL.
///
/// # Safety
/// `path` and `file` are NULL or NUL-terminated; `size_out` is NULL or
/// writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_falloc(
    path: *const c_char,
    offset: usize,
    size_out: *mut usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    let mapped = if path.is_null() {
        None
    } else {
        // SAFETY: forwarded caller contract.
        let origin = unsafe { origin_from_c(file, line) };
        // SAFETY: non-NULL and NUL-terminated per the contract.
        let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
        global::falloc(Path::new(OsStr::from_bytes(bytes)), offset, &origin)
    };
    if !size_out.is_null() {
        // SAFETY: writable per the contract.
        unsafe { size_out.write(mapped.map_or(0, |(_, len)| len)) };
    }
    into_raw(mapped.map(|(ptr, _)| ptr))
}

/// Release a pointer from [`xmemory_falloc`]. `size` is only used for
/// pointers the allocator does not track.
///
/// # Safety
/// `ptr` came from `xmemory_falloc` with the same `offset` and must not be
/// used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_fdealloc(
    ptr: *mut c_void,
    offset: usize,
    size: usize,
    file: *const c_char,
    line: c_int,
) {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    // SAFETY: forwarded caller contract.
    unsafe { global::fdealloc(NonNull::new(ptr.cast()), offset, size, &origin) };
}

/// Status dump to stderr.
///
/// # Safety
/// `file` is NULL or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xmemory_status_(file: *const c_char, line: c_int) {
    // SAFETY: forwarded caller contract.
    let origin = unsafe { origin_from_c(file, line) };
    global::status(&origin);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_file_names_share_one_copy() {
        // SAFETY: C string literals.
        let first = unsafe { origin_from_c(c"flat_field.c".as_ptr(), 10) };
        let second = unsafe { origin_from_c(c"flat_field.c".as_ptr(), 20) };
        assert_eq!(first.to_string(), "flat_field.c (10)");
        assert_eq!(second.to_string(), "flat_field.c (20)");
        assert!(std::ptr::eq(first.file(), second.file()));
    }

    #[test]
    fn null_file_and_negative_line() {
        // SAFETY: NULL and a C string literal.
        let origin = unsafe { origin_from_c(ptr::null(), 5) };
        assert_eq!(origin, Origin::unknown());
        let origin = unsafe { origin_from_c(c"dark.c".as_ptr(), -1) };
        assert_eq!(origin.to_string(), "dark.c (0)");
    }
}
