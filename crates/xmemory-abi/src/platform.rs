//! Platform seam.
//!
//! Every syscall and system-allocator call the context makes goes through
//! [`Platform`]. [`SystemPlatform`] is the libc implementation;
//! [`InstrumentedPlatform`] wraps another platform with call counters and
//! fault injection so spill, mapping and data-limit paths can be driven
//! deterministically.

use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use xmemory_core::resource::{self as res_core, ResourceProbe, Rlimit};

/// Chunk size used to zero-fill swap files.
const ZERO_CHUNK: usize = 2048;

/// Fallback when the page size cannot be queried.
const DEFAULT_PAGE_SIZE: usize = 4096;

pub trait Platform {
    fn page_size(&self) -> usize;

    /// Finite `RLIMIT_DATA` soft limit in bytes.
    fn data_limit(&self) -> Option<usize>;

    /// Raise the soft `RLIMIT_NOFILE` to the hard limit; returns the limit in
    /// effect afterwards.
    fn raise_descriptor_limit(&self) -> Option<Rlimit>;

    fn pid(&self) -> u32;

    fn sys_malloc(&self, size: usize) -> Option<NonNull<u8>>;

    fn sys_calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from the system allocator and not be used afterwards.
    unsafe fn sys_free(&self, ptr: NonNull<u8>);

    /// # Safety
    /// `ptr` must come from the system allocator; it is invalid on success.
    unsafe fn sys_realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Touch one byte per page so the kernel commits the block now.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes.
    unsafe fn commit_pages(&self, ptr: NonNull<u8>, len: usize) {
        if cfg!(target_os = "linux") {
            let step = self.page_size().max(1);
            let mut offset = 0;
            while offset < len {
                // SAFETY: offset < len and the caller guarantees len writable bytes.
                unsafe { ptr.as_ptr().add(offset).write_volatile(0) };
                offset += step;
            }
        }
    }

    /// Create `path` (mode 0600) holding `len` zero bytes; returns its open
    /// descriptor. The file is removed again if it cannot be filled.
    fn create_swap_file(&self, path: &Path, len: usize) -> io::Result<RawFd>;

    fn file_len(&self, path: &Path) -> io::Result<u64>;

    fn open_readonly(&self, path: &Path) -> io::Result<File>;

    /// Private read/write mapping of the first `len` bytes of `fd`.
    fn map_private(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>>;

    /// # Safety
    /// `[ptr, ptr + len)` must be a mapping created by `map_private` that is
    /// no longer referenced.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    fn close(&self, fd: RawFd);

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// A borrowed platform, so callers can inspect it after the context using it
/// is gone.
impl<P: Platform + ?Sized> Platform for &P {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn data_limit(&self) -> Option<usize> {
        (**self).data_limit()
    }

    fn raise_descriptor_limit(&self) -> Option<Rlimit> {
        (**self).raise_descriptor_limit()
    }

    fn pid(&self) -> u32 {
        (**self).pid()
    }

    fn sys_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).sys_malloc(size)
    }

    fn sys_calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        (**self).sys_calloc(count, size)
    }

    unsafe fn sys_free(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).sys_free(ptr) }
    }

    unsafe fn sys_realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).sys_realloc(ptr, size) }
    }

    unsafe fn commit_pages(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).commit_pages(ptr, len) }
    }

    fn create_swap_file(&self, path: &Path, len: usize) -> io::Result<RawFd> {
        (**self).create_swap_file(path, len)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        (**self).file_len(path)
    }

    fn open_readonly(&self, path: &Path) -> io::Result<File> {
        (**self).open_readonly(path)
    }

    fn map_private(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        (**self).map_private(fd, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).unmap(ptr, len) }
    }

    fn close(&self, fd: RawFd) {
        (**self).close(fd);
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        (**self).remove_file(path)
    }
}

/// Resource values captured when a managed context is created.
pub fn probe_resources<P: Platform + ?Sized>(platform: &P) -> ResourceProbe {
    ResourceProbe {
        page_size: platform.page_size(),
        data_limit: platform.data_limit(),
        nofile: platform.raise_descriptor_limit(),
    }
}

/// libc-backed platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

fn get_rlimit(resource: RlimitResource) -> Option<Rlimit> {
    let mut raw = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `raw` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::getrlimit(resource, &mut raw) };
    (rc == 0).then_some(Rlimit {
        rlim_cur: u64::from(raw.rlim_cur),
        rlim_max: u64::from(raw.rlim_max),
    })
}

impl Platform for SystemPlatform {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw)
            .ok()
            .filter(|&p| p > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn data_limit(&self) -> Option<usize> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        get_rlimit(libc::RLIMIT_DATA)
            .and_then(|rlim| res_core::effective_data_limit(rlim.rlim_cur))
    }

    fn raise_descriptor_limit(&self) -> Option<Rlimit> {
        let current = get_rlimit(libc::RLIMIT_NOFILE)?;
        let Some(raised) = res_core::raised_soft_limit(&current) else {
            return Some(current);
        };
        let raw = libc::rlimit {
            rlim_cur: raised.rlim_cur as libc::rlim_t,
            rlim_max: raised.rlim_max as libc::rlim_t,
        };
        // SAFETY: `raw` is a valid, initialized rlimit.
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raw) };
        Some(if rc == 0 { raised } else { current })
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn sys_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc accepts any size.
        NonNull::new(unsafe { libc::malloc(size) }.cast())
    }

    fn sys_calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: calloc checks count * size for overflow itself.
        NonNull::new(unsafe { libc::calloc(count, size) }.cast())
    }

    unsafe fn sys_free(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }

    unsafe fn sys_realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), size) }.cast())
    }

    fn create_swap_file(&self, path: &Path, len: usize) -> io::Result<RawFd> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        let zeros = [0u8; ZERO_CHUNK];
        let mut written = 0;
        while written < len {
            let chunk = ZERO_CHUNK.min(len - written);
            if let Err(err) = file.write_all(&zeros[..chunk]) {
                drop(file);
                let _ = fs::remove_file(path);
                return Err(err);
            }
            written += chunk;
        }
        Ok(file.into_raw_fd())
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn open_readonly(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn map_private(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: a fresh mapping chosen by the kernel aliases no Rust object.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(raw.cast()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn close(&self, fd: RawFd) {
        // SAFETY: the descriptor is owned by the cell being torn down.
        unsafe { libc::close(fd) };
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Call counts observed by an [`InstrumentedPlatform`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCounts {
    pub sys_malloc: usize,
    pub sys_free: usize,
    pub sys_realloc: usize,
    pub swap_files: usize,
    pub files_opened: usize,
    pub maps: usize,
    pub unmaps: usize,
}

/// Counting, fault-injecting wrapper around another platform.
#[derive(Debug, Default)]
pub struct InstrumentedPlatform<P = SystemPlatform> {
    inner: P,
    fail_ram: AtomicBool,
    fail_swap: AtomicBool,
    fail_map: AtomicBool,
    data_limit: Option<usize>,
    sys_malloc: AtomicUsize,
    sys_free: AtomicUsize,
    sys_realloc: AtomicUsize,
    swap_files: AtomicUsize,
    files_opened: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

impl InstrumentedPlatform<SystemPlatform> {
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemPlatform)
    }
}

impl<P: Platform> InstrumentedPlatform<P> {
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            fail_ram: AtomicBool::new(false),
            fail_swap: AtomicBool::new(false),
            fail_map: AtomicBool::new(false),
            data_limit: None,
            sys_malloc: AtomicUsize::new(0),
            sys_free: AtomicUsize::new(0),
            sys_realloc: AtomicUsize::new(0),
            swap_files: AtomicUsize::new(0),
            files_opened: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        }
    }

    /// Report `limit` as the data limit instead of asking the inner platform.
    #[must_use]
    pub fn with_data_limit(mut self, limit: usize) -> Self {
        self.data_limit = Some(limit);
        self
    }

    /// Make the system allocator report exhaustion.
    pub fn set_fail_ram(&self, fail: bool) {
        self.fail_ram.store(fail, Ordering::Relaxed);
    }

    /// Make swap-file creation fail with `ENOSPC`.
    pub fn set_fail_swap(&self, fail: bool) {
        self.fail_swap.store(fail, Ordering::Relaxed);
    }

    /// Make `map_private` fail with `ENOMEM`.
    pub fn set_fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counts(&self) -> PlatformCounts {
        PlatformCounts {
            sys_malloc: self.sys_malloc.load(Ordering::Relaxed),
            sys_free: self.sys_free.load(Ordering::Relaxed),
            sys_realloc: self.sys_realloc.load(Ordering::Relaxed),
            swap_files: self.swap_files.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl<P: Platform> Platform for InstrumentedPlatform<P> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn data_limit(&self) -> Option<usize> {
        self.data_limit.or_else(|| self.inner.data_limit())
    }

    fn raise_descriptor_limit(&self) -> Option<Rlimit> {
        self.inner.raise_descriptor_limit()
    }

    fn pid(&self) -> u32 {
        self.inner.pid()
    }

    fn sys_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        Self::bump(&self.sys_malloc);
        if self.fail_ram.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.sys_malloc(size)
    }

    fn sys_calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        Self::bump(&self.sys_malloc);
        if self.fail_ram.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.sys_calloc(count, size)
    }

    unsafe fn sys_free(&self, ptr: NonNull<u8>) {
        Self::bump(&self.sys_free);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.sys_free(ptr) }
    }

    unsafe fn sys_realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        Self::bump(&self.sys_realloc);
        if self.fail_ram.load(Ordering::Relaxed) {
            return None;
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.sys_realloc(ptr, size) }
    }

    unsafe fn commit_pages(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.commit_pages(ptr, len) }
    }

    fn create_swap_file(&self, path: &Path, len: usize) -> io::Result<RawFd> {
        if self.fail_swap.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        let fd = self.inner.create_swap_file(path, len)?;
        Self::bump(&self.swap_files);
        Ok(fd)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        self.inner.file_len(path)
    }

    fn open_readonly(&self, path: &Path) -> io::Result<File> {
        let file = self.inner.open_readonly(path)?;
        Self::bump(&self.files_opened);
        Ok(file)
    }

    fn map_private(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let ptr = self.inner.map_private(fd, len)?;
        Self::bump(&self.maps);
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        Self::bump(&self.unmaps);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.unmap(ptr, len) }
    }

    fn close(&self, fd: RawFd) {
        self.inner.close(fd);
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
}
