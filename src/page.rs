//! Page layout: the 4096-byte slab page header, its intrusive free lists,
//! and the pointer-masking trick that recovers a header from any block
//! pointer the allocator ever handed out — slab or large object alike.

use crate::os::PAGE_SIZE;
use crate::size_class::{stride_for_class, NUM_CLASSES};
use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A thread's stable identity token (§9: not a platform thread id, not an
/// address — a small counter-assigned value). `0` is reserved to mean
/// "this page currently has no owner" (it sits in the global pool).
pub type ThreadId = u64;
pub const UNOWNED: ThreadId = 0;

/// An intrusive doubly linked free-list node. When a block is free, these
/// are the only bytes of it the allocator touches; once handed out, every
/// byte belongs to the caller.
#[repr(C)]
pub struct FreeBlock {
    pub prev: *mut FreeBlock,
    pub next: *mut FreeBlock,
}

/// The remote free list, guarded by `PageHeader::remote`. Kept as its own
/// tiny struct (rather than a bare pointer field) so the mutex has
/// something concrete to own.
#[derive(Default)]
pub(crate) struct RemoteFreeList {
    pub head: *mut FreeBlock,
}

// SAFETY: `RemoteFreeList` is only ever reached through `PageHeader::remote`,
// a `Mutex`, so concurrent access is already serialized; the raw pointer
// itself is never dereferenced without holding that lock.
unsafe impl Send for RemoteFreeList {}

/// The page header living at offset 0 of every mapped page, slab or large.
#[repr(C)]
pub struct PageHeader {
    pub list_prev: *mut PageHeader,
    pub list_next: *mut PageHeader,
    /// Free blocks reachable only by this page's current owner. Never
    /// touched by any other thread.
    pub local_free_head: *mut FreeBlock,
    /// The thread whose local cache currently lists this page. `UNOWNED`
    /// while the page sits in the global pool; meaningless for large
    /// objects, which are never queued anywhere.
    pub owner: ThreadId,
    /// For slab pages, the size-class index (`< NUM_CLASSES`). For large
    /// objects, the raw requested-and-aligned byte size (`>= NUM_CLASSES`,
    /// since every size class is far smaller than any large request).
    pub size_index: usize,
    pub blocks_used: usize,
    /// Fixed slot count, computed once at page-creation time.
    pub total_blocks: usize,
    /// The exact length this page's backing mapping was created with —
    /// `PAGE_SIZE` for slab pages, the rounded request for large objects.
    pub mapped_len: usize,
    pub remote: CachePadded<Mutex<RemoteFreeList>>,
    pub remote_frees: AtomicUsize,
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Byte offset from a page's base to its first block. 16-byte aligned
/// (the page itself starts 16-byte aligned, being 4096-byte aligned).
#[inline]
pub fn blocks_offset() -> usize {
    align_up(size_of::<PageHeader>(), 16)
}

/// Recover the page header for any pointer this allocator ever returned.
/// Sound for both slab blocks (header is the start of their containing
/// 4096-byte page) and large-object blocks (the header precedes the block
/// by `blocks_offset()` bytes, always far less than 4096, inside a mapping
/// whose base is itself page-aligned — so masking still lands on the base).
#[inline]
pub unsafe fn header_of(ptr: *mut u8) -> *mut PageHeader {
    ((ptr as usize) & !(PAGE_SIZE - 1)) as *mut PageHeader
}

#[inline]
pub unsafe fn is_large(header: *const PageHeader) -> bool {
    (*header).size_index >= NUM_CLASSES
}

/// How many blocks a fresh slab page of the given class holds.
#[inline]
pub fn total_blocks_for_class(class: usize) -> usize {
    (PAGE_SIZE - blocks_offset()) / stride_for_class(class)
}

/// Build a fresh slab page in `raw` (a freshly mapped, exactly
/// `PAGE_SIZE`-byte, page-aligned region). Returns the header pointer and
/// the first block, already accounted for in `blocks_used` — the caller
/// does not need to pop it off `local_free_head` itself.
pub unsafe fn init_slab_page(
    raw: NonNull<u8>,
    class: usize,
    owner: ThreadId,
) -> (*mut PageHeader, *mut u8) {
    let header_ptr = raw.as_ptr() as *mut PageHeader;
    let stride = stride_for_class(class);
    let offset = blocks_offset();
    let total = total_blocks_for_class(class);
    debug_assert!(total >= 1);

    header_ptr.write(PageHeader {
        list_prev: null_mut(),
        list_next: null_mut(),
        local_free_head: null_mut(),
        owner,
        size_index: class,
        blocks_used: 1,
        total_blocks: total,
        mapped_len: PAGE_SIZE,
        remote: CachePadded::new(Mutex::new(RemoteFreeList { head: null_mut() })),
        remote_frees: AtomicUsize::new(0),
    });

    let base = raw.as_ptr().add(offset);
    let first_block = base;

    // Blocks 1..total are chained into the local free list; block 0 is
    // handed straight to the caller, matching §4.3 step 3.
    let mut head: *mut FreeBlock = null_mut();
    for i in (1..total).rev() {
        let blk = base.add(i * stride) as *mut FreeBlock;
        free_list_push(&mut head, blk);
    }
    (*header_ptr).local_free_head = head;

    (header_ptr, first_block)
}

// ---------------------------------------------------------------------
// Free-block list (local and remote share this shape; the remote variant
// is always manipulated under `PageHeader::remote`'s lock by the caller).
// ---------------------------------------------------------------------

#[inline]
pub unsafe fn free_list_push(head: &mut *mut FreeBlock, blk: *mut FreeBlock) {
    (*blk).prev = null_mut();
    (*blk).next = *head;
    if !(*head).is_null() {
        (**head).prev = blk;
    }
    *head = blk;
}

#[inline]
pub unsafe fn free_list_pop(head: &mut *mut FreeBlock) -> *mut FreeBlock {
    let blk = *head;
    if !blk.is_null() {
        let next = (*blk).next;
        if !next.is_null() {
            (*next).prev = null_mut();
        }
        *head = next;
    }
    blk
}

#[cfg(test)]
pub(crate) unsafe fn free_list_len(head: *mut FreeBlock) -> usize {
    let mut n = 0;
    let mut cur = head;
    while !cur.is_null() {
        n += 1;
        cur = (*cur).next;
    }
    n
}

// ---------------------------------------------------------------------
// Page list (the list a page sits in — a thread's local per-class list,
// or the global per-class pool). `PageHeader::list_prev`/`list_next` are
// reused for both; a page is always in at most one such list at a time.
// ---------------------------------------------------------------------

#[inline]
pub unsafe fn page_list_push_front(head: &mut *mut PageHeader, page: *mut PageHeader) {
    (*page).list_prev = null_mut();
    (*page).list_next = *head;
    if !(*head).is_null() {
        (**head).list_prev = page;
    }
    *head = page;
}

#[inline]
pub unsafe fn page_list_unlink(head: &mut *mut PageHeader, page: *mut PageHeader) {
    let prev = (*page).list_prev;
    let next = (*page).list_next;
    if !prev.is_null() {
        (*prev).list_next = next;
    } else {
        debug_assert_eq!(*head, page);
        *head = next;
    }
    if !next.is_null() {
        (*next).list_prev = prev;
    }
    (*page).list_prev = null_mut();
    (*page).list_next = null_mut();
}

// ---------------------------------------------------------------------
// Remote free list: pushed by any non-owner thread under `remote_lock`,
// drained by the owner (also under `remote_lock`, but only the owner ever
// calls drain).
// ---------------------------------------------------------------------

/// Push `blk` onto `header`'s remote free list and bump `remote_frees`.
/// Safe to call from any thread, including the page's owner (though the
/// owner normally frees locally instead).
pub unsafe fn remote_free_push(header: *mut PageHeader, blk: *mut FreeBlock) {
    {
        let mut guard = (*header).remote.lock().unwrap();
        free_list_push(&mut guard.head, blk);
    }
    (*header).remote_frees.fetch_add(1, Ordering::Release);
}

/// Drain the remote free list onto the local free list, resetting
/// `remote_frees` to zero. Must only be called by the page's current
/// owner (the local free list it merges into is otherwise unsynchronized).
/// Returns the number of blocks drained.
pub unsafe fn drain_remote_into_local(header: *mut PageHeader) -> usize {
    let remote_head = {
        let mut guard = (*header).remote.lock().unwrap();
        std::mem::replace(&mut guard.head, null_mut())
    };
    if remote_head.is_null() {
        (*header).remote_frees.store(0, Ordering::Release);
        return 0;
    }
    let mut tail = remote_head;
    let mut count = 1usize;
    while !(*tail).next.is_null() {
        tail = (*tail).next;
        count += 1;
    }
    let local_head = (*header).local_free_head;
    (*tail).next = local_head;
    if !local_head.is_null() {
        (*local_head).prev = tail;
    }
    (*remote_head).prev = null_mut();
    (*header).local_free_head = remote_head;
    (*header).remote_frees.store(0, Ordering::Release);
    count
}

/// Cheap, lock-free hint of how many blocks are waiting on the remote
/// free list. Paired with the mutex's release/acquire fences, this is
/// enough to decide whether a page is wholly unused (§4.5 step 3, §9).
#[inline]
pub unsafe fn remote_frees_hint(header: *const PageHeader) -> usize {
    (*header).remote_frees.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;
    use proptest::prelude::*;

    unsafe fn fresh_page(class: usize, owner: ThreadId) -> (*mut PageHeader, *mut u8) {
        let raw = os::map_anonymous(os::PAGE_SIZE).unwrap();
        init_slab_page(raw, class, owner)
    }

    #[test]
    fn header_of_masks_to_page_base() {
        unsafe {
            let (header, first) = fresh_page(0, 7);
            assert_eq!(header_of(first), header);
            os::unmap(NonNull::new(header as *mut u8).unwrap(), os::PAGE_SIZE);
        }
    }

    #[test]
    fn block_accounting_identity_on_a_fresh_page() {
        unsafe {
            let (header, _first) = fresh_page(2, 1);
            let total = (*header).total_blocks;
            let local_len = free_list_len((*header).local_free_head);
            // One block (the first) was already handed out.
            assert_eq!((*header).blocks_used + local_len, total);
            os::unmap(NonNull::new(header as *mut u8).unwrap(), os::PAGE_SIZE);
        }
    }

    #[test]
    fn remote_push_then_drain_moves_blocks_to_local() {
        unsafe {
            let (header, first) = fresh_page(0, 1);
            let local_before = free_list_len((*header).local_free_head);
            let blk = first as *mut FreeBlock;
            remote_free_push(header, blk);
            assert_eq!(remote_frees_hint(header), 1);
            let drained = drain_remote_into_local(header);
            assert_eq!(drained, 1);
            assert_eq!(remote_frees_hint(header), 0);
            assert_eq!(free_list_len((*header).local_free_head), local_before + 1);
            os::unmap(NonNull::new(header as *mut u8).unwrap(), os::PAGE_SIZE);
        }
    }

    #[test]
    fn page_list_push_and_unlink_roundtrip() {
        unsafe {
            let (h1, _) = fresh_page(0, 1);
            let (h2, _) = fresh_page(0, 1);
            let mut head: *mut PageHeader = null_mut();
            page_list_push_front(&mut head, h1);
            page_list_push_front(&mut head, h2);
            assert_eq!(head, h2);
            assert_eq!((*h2).list_next, h1);
            page_list_unlink(&mut head, h2);
            assert_eq!(head, h1);
            assert!((*h1).list_prev.is_null());
            os::unmap(NonNull::new(h1 as *mut u8).unwrap(), os::PAGE_SIZE);
            os::unmap(NonNull::new(h2 as *mut u8).unwrap(), os::PAGE_SIZE);
        }
    }

    proptest! {
        /// §8 property 3: for any slab page, blocks_used plus the length of
        /// both free lists always equals the page's fixed block count,
        /// across every class and across an arbitrary mix of local frees
        /// and remote frees pushed back in.
        #[test]
        fn block_accounting_identity_holds_after_local_and_remote_frees(
            class in 0..NUM_CLASSES,
            free_local in proptest::collection::vec(any::<bool>(), 0..8),
        ) {
            unsafe {
                let (header, first) = fresh_page(class, 1);
                let total = (*header).total_blocks;

                // Pop a handful more blocks so there is something to free
                // back, local or remote, without ever exceeding `total`.
                let mut handed_out = vec![first];
                for via_remote in &free_local {
                    if handed_out.len() >= total {
                        break;
                    }
                    let blk = free_list_pop(&mut (*header).local_free_head);
                    if blk.is_null() {
                        break;
                    }
                    (*header).blocks_used += 1;
                    handed_out.push(blk as *mut u8);
                    if *via_remote {
                        let p = handed_out.pop().unwrap();
                        remote_free_push(header, p as *mut FreeBlock);
                        (*header).blocks_used -= 1;
                    }
                }

                let local_len = free_list_len((*header).local_free_head);
                let remote_len = remote_frees_hint(header);
                prop_assert_eq!((*header).blocks_used + local_len + remote_len, total);

                os::unmap(NonNull::new(header as *mut u8).unwrap(), os::PAGE_SIZE);
            }
        }
    }
}
