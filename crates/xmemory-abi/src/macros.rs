//! Call-site capturing wrappers around [`crate::global`].
//!
//! Each macro records `file!()` / `line!()` of its expansion site as the
//! [`crate::Origin`] of the call.

/// Origin of the macro invocation site.
#[macro_export]
macro_rules! origin {
    () => {
        $crate::Origin::new(file!(), line!())
    };
}

/// `malloc(size)` on the global context.
#[macro_export]
macro_rules! xmalloc {
    ($size:expr) => {
        $crate::global::malloc($size, &$crate::origin!())
    };
}

/// `calloc(count, size)` on the global context.
#[macro_export]
macro_rules! xcalloc {
    ($count:expr, $size:expr) => {
        $crate::global::calloc($count, $size, &$crate::origin!())
    };
}

/// `realloc(ptr, size)` on the global context. Must be used in an `unsafe`
/// context; see [`crate::XMemory::realloc`].
#[macro_export]
macro_rules! xrealloc {
    ($ptr:expr, $size:expr) => {
        $crate::global::realloc($ptr, $size, &$crate::origin!())
    };
}

/// `free(ptr)` on the global context. Must be used in an `unsafe` context.
#[macro_export]
macro_rules! xfree {
    ($ptr:expr) => {
        $crate::global::free($ptr, &$crate::origin!())
    };
}

#[macro_export]
macro_rules! xstrdup {
    ($s:expr) => {
        $crate::global::strdup($s, &$crate::origin!())
    };
}

/// `falloc(path, offset)`: `Option<(NonNull<u8>, usize)>`.
#[macro_export]
macro_rules! xfalloc {
    ($path:expr, $offset:expr) => {
        $crate::global::falloc(::std::path::Path::new($path), $offset, &$crate::origin!())
    };
}

/// `fdealloc(ptr, offset, size)`. Must be used in an `unsafe` context.
#[macro_export]
macro_rules! xfdealloc {
    ($ptr:expr, $offset:expr, $size:expr) => {
        $crate::global::fdealloc($ptr, $offset, $size, &$crate::origin!())
    };
}

/// Status dump of the global context to stderr.
#[macro_export]
macro_rules! xstatus {
    () => {
        $crate::global::status(&$crate::origin!())
    };
}
