//! Large-object path: requests larger than the biggest size class bypass
//! the slab machinery entirely. Each call gets its own mapping with the
//! same page-header prefix every slab page carries, so the header
//! recovery trick in `page::header_of` works unmodified on large blocks.

use crate::os;
use crate::page::{self, PageHeader, RemoteFreeList};
use crate::size_class::{round_large, BLOCK_ALIGN};
use crossbeam_utils::CachePadded;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

/// Allocate a dedicated mapping for a request too big for any size class,
/// at the allocator's default 16-byte alignment.
pub fn allocate(len: usize) -> *mut u8 {
    allocate_aligned(len, BLOCK_ALIGN)
}

/// Allocate a dedicated mapping whose returned pointer satisfies `align`.
/// `align` must be strictly less than [`crate::os::PAGE_SIZE`]: the
/// header-recovery mask only looks at the low 12 bits of a pointer, so the
/// first block must stay strictly inside the mapping's first OS page. An
/// `align` of `PAGE_SIZE` or more would push the in-page offset to exactly
/// (or past) a page boundary, landing the block on what masks to a
/// *different* page-aligned address than the header it belongs to — so
/// such a request is rejected (null) rather than silently mis-served.
///
/// `len` should be the raw (unrounded) request; this rounds it up itself
/// before recording it as the header's sentinel `size_index`.
pub fn allocate_aligned(len: usize, align: usize) -> *mut u8 {
    if align >= os::PAGE_SIZE {
        return null_mut();
    }
    let aligned_len = round_large(len);
    // The block must land at an `align`-aligned offset from a page-aligned
    // mapping base, so the offset itself just needs to be a multiple of
    // `align` and large enough to hold the header. Since `align <
    // PAGE_SIZE` here, this offset always lands strictly before the next
    // page boundary.
    let offset = {
        let min = page::blocks_offset();
        (min + align - 1) & !(align - 1)
    };
    debug_assert!(offset < os::PAGE_SIZE);
    let mapped_len = os::good_mmap_len(offset + aligned_len);

    let raw = match os::map_anonymous(mapped_len) {
        Some(raw) => raw,
        None => return null_mut(),
    };

    let header_ptr = raw.as_ptr() as *mut PageHeader;
    unsafe {
        header_ptr.write(PageHeader {
            list_prev: null_mut(),
            list_next: null_mut(),
            local_free_head: null_mut(),
            owner: page::UNOWNED,
            size_index: aligned_len,
            blocks_used: 1,
            total_blocks: 1,
            mapped_len,
            remote: CachePadded::new(Mutex::new(RemoteFreeList::default())),
            remote_frees: AtomicUsize::new(0),
        });
        raw.as_ptr().add(offset)
    }
}

/// Unmap a large object's backing region in full.
///
/// # Safety
/// `header` must point at a page header for which `page::is_large` is
/// true, and must not already have been freed.
pub unsafe fn free(header: *mut PageHeader) {
    let mapped_len = (*header).mapped_len;
    os::unmap(NonNull::new(header as *mut u8).expect("header pointer is never null"), mapped_len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_a_large_object() {
        let ptr = allocate(4000);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % 16, 0);
        unsafe {
            let header = page::header_of(ptr);
            assert!(page::is_large(header));
            assert!((*header).size_index > crate::size_class::MAX_CLASS_SIZE);
            std::ptr::write_bytes(ptr, 0x5a, 4000);
            free(header);
        }
    }

    #[test]
    fn aligned_allocation_just_under_a_page_keeps_header_recoverable() {
        // The largest alignment a caller can still validly ask for here;
        // the returned block must stay strictly inside the mapping's
        // first page so `header_of` recovers the header it was built
        // with, not some address in the next page of zeroed mmap memory.
        let align = os::PAGE_SIZE / 2;
        let ptr = allocate_aligned(100, align);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % align, 0);
        unsafe {
            let header = page::header_of(ptr);
            assert_eq!(header as usize, (ptr as usize) & !(os::PAGE_SIZE - 1));
            assert!(page::is_large(header));
            std::ptr::write_bytes(ptr, 0x5a, 100);
            free(header);
        }
    }

    #[test]
    fn alignment_of_a_full_page_or_more_is_rejected() {
        assert!(allocate_aligned(16, os::PAGE_SIZE).is_null());
        assert!(allocate_aligned(16, os::PAGE_SIZE * 2).is_null());
    }
}
