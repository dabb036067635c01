//! The three core operations the public allocator surface is built from:
//! `allocate`, `free`, and `reallocate`. Each dispatches between the
//! thread-local slab path and the large-object path, using the page
//! header's `size_index` to tell which one a given pointer belongs to.

use crate::large;
use crate::page::{self, PageHeader};
use crate::size_class::{self, SIZE_CLASSES};
use crate::tls;
use std::ptr::null_mut;

/// Allocate at least `len` bytes, 16-byte aligned. Returns a null pointer
/// on OS failure; never panics on an out-of-memory condition.
pub fn allocate(len: usize) -> *mut u8 {
    match size_class::class_for_size(len) {
        Some(class) => tls::allocate_slab(class),
        None => large::allocate(len),
    }
}

/// Free a pointer previously returned by [`allocate`] or [`reallocate`].
/// A null pointer is a no-op, matching the C `free` contract.
///
/// # Safety
/// `ptr` must be either null or a still-live pointer this allocator
/// handed out, not already freed.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let header = page::header_of(ptr);
    if page::is_large(header) {
        large::free(header);
        return;
    }
    if (*header).owner == tls::current_thread_id() {
        tls::free_local(header, ptr);
    } else {
        let blk = ptr as *mut page::FreeBlock;
        page::remote_free_push(header, blk);
    }
}

/// Resize a previously allocated block to `new_size` bytes, preserving its
/// contents up to the smaller of the old and new sizes.
///
/// Stays in place only when `new_size` resolves to exactly the class `ptr`
/// is already in; any other class, smaller or larger, moves to a fresh
/// block (matching the worked shrink example: 200 bytes in the 256-byte
/// class moving to 100 bytes lands in the 128-byte class, a new pointer).
///
/// `ptr` may be null, in which case this behaves exactly like [`allocate`].
/// On allocation failure the original block is left untouched and a null
/// pointer is returned, matching the C `realloc` contract.
///
/// # Safety
/// `ptr` must be either null or a still-live pointer this allocator
/// handed out, not already freed.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(new_size);
    }

    let header = page::header_of(ptr);
    let old_size = current_usable_size(header);

    if !page::is_large(header) {
        if let Some(new_class) = size_class::class_for_size(new_size) {
            if new_class == (*header).size_index {
                // Already in exactly the right class; nothing to move.
                return ptr;
            }
        }
    }

    let new_ptr = allocate(new_size);
    if new_ptr.is_null() {
        return null_mut();
    }
    let copy_len = old_size.min(new_size);
    std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    free(ptr);
    new_ptr
}

/// The usable size of the block `header` currently describes.
unsafe fn current_usable_size(header: *mut PageHeader) -> usize {
    if page::is_large(header) {
        (*header).size_index
    } else {
        SIZE_CLASSES[(*header).size_index]
    }
}
