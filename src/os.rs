//! OS page provider: anonymous mapping, unmapping, and the "don't use
//! transparent huge pages" advisory.
//!
//! This is the one module in the crate that is allowed to know it is
//! talking to an actual operating system. Everything above it works in
//! terms of `Option<NonNull<u8>>` / `bool` and never sees an `errno` or a
//! `GetLastError`.

use crate::options;
use log::{debug, warn};
use std::ptr::NonNull;

/// The fixed slab page size this allocator maps for every small-object page.
pub const PAGE_SIZE: usize = 4096;

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round a requested byte length up to a whole number of OS pages.
#[inline]
pub fn good_mmap_len(len: usize) -> usize {
    align_up(len.max(1), PAGE_SIZE)
}

/// Map `len` bytes (already page-size rounded by the caller, typically via
/// [`good_mmap_len`]) of fresh, zeroed, read+write anonymous memory.
///
/// Returns `None` on OS failure; the failure is logged at `warn` level with
/// the requested length and the platform error code, matching the
/// reference design's `os_mem_alloc`.
pub fn map_anonymous(len: usize) -> Option<NonNull<u8>> {
    if len == 0 {
        return None;
    }
    let ptr = imp::mmap(len);
    match NonNull::new(ptr) {
        Some(p) => {
            debug_assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
            Some(p)
        }
        None => {
            warn!(
                "anonymous mapping failed: requested {} bytes, os error: {}",
                len,
                imp::last_os_error()
            );
            None
        }
    }
}

/// Unmap a region previously returned by [`map_anonymous`] with the exact
/// same length it was mapped with.
pub fn unmap(ptr: NonNull<u8>, len: usize) {
    if !imp::munmap(ptr.as_ptr(), len) {
        warn!(
            "unmap failed: addr {:p}, len {}, os error: {}",
            ptr.as_ptr(),
            len,
            imp::last_os_error()
        );
    }
}

/// Advise the OS against backing `len` bytes at `ptr` with a transparent
/// huge page. Best-effort: a failure here is logged but never fatal, since
/// the page remains perfectly usable either way.
pub fn advise_no_huge_pages(ptr: NonNull<u8>, len: usize) {
    if !imp::advise_no_huge_pages(ptr.as_ptr(), len) && options::verbose() {
        debug!(
            "madvise(no huge pages) not honored for addr {:p}, len {}",
            ptr.as_ptr(),
            len
        );
    }
}

#[cfg(unix)]
mod imp {
    use std::ptr::null_mut;

    pub fn mmap(len: usize) -> *mut u8 {
        unsafe {
            let p = libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if p == libc::MAP_FAILED {
                null_mut()
            } else {
                p as *mut u8
            }
        }
    }

    pub fn munmap(ptr: *mut u8, len: usize) -> bool {
        unsafe { libc::munmap(ptr as *mut libc::c_void, len) == 0 }
    }

    pub fn advise_no_huge_pages(ptr: *mut u8, len: usize) -> bool {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_NOHUGEPAGE) == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (ptr, len);
            true // no THP concept to opt out of on this platform
        }
    }

    pub fn last_os_error() -> errno::Errno {
        errno::errno()
    }
}

#[cfg(windows)]
mod imp {
    use std::ptr::null_mut;
    use winapi::shared::minwindef::LPVOID;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    pub fn mmap(len: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(null_mut(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8
        }
    }

    pub fn munmap(ptr: *mut u8, _len: usize) -> bool {
        unsafe { VirtualFree(ptr as LPVOID, 0, MEM_RELEASE) != 0 }
    }

    pub fn advise_no_huge_pages(_ptr: *mut u8, _len: usize) -> bool {
        // VirtualAlloc only opts *into* large pages with MEM_LARGE_PAGES,
        // which this allocator never requests, so there is nothing to
        // advise away here.
        true
    }

    pub fn last_os_error() -> u32 {
        unsafe { GetLastError() }
    }
}
