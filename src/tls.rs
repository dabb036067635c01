//! Thread-local cache: per-thread, per-class lists of pages. This is the
//! allocator's entire fast path — allocate and free against a page this
//! thread already owns never take a lock.

use crate::global;
use crate::options;
use crate::os;
use crate::page::{self, PageHeader, ThreadId};
use crate::size_class::NUM_CLASSES;
use log::debug;
use std::cell::Cell;
use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A stable per-thread identity token, lazily assigned on first use. `0`
/// is reserved for `page::UNOWNED` and is never handed out here.
#[inline]
pub fn current_thread_id() -> ThreadId {
    THREAD_ID.with(|id| {
        let existing = id.get();
        if existing != 0 {
            return existing;
        }
        let assigned = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        id.set(assigned);
        assigned
    })
}

struct ThreadCache {
    /// One local page list per size class; `lists[c]` is the head of the
    /// doubly linked list of pages this thread currently owns for class `c`.
    lists: [*mut PageHeader; NUM_CLASSES],
}

impl ThreadCache {
    const fn new() -> Self {
        ThreadCache {
            lists: [null_mut(); NUM_CLASSES],
        }
    }
}

thread_local! {
    static CACHE: UnsafeCell<ThreadCache> = UnsafeCell::new(ThreadCache::new());
}

/// Run `f` against this thread's cache. There is no reentrancy concern:
/// nothing on this path allocates or otherwise re-enters the allocator.
#[inline]
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    CACHE.with(|cell| unsafe { f(&mut *cell.get()) })
}

/// §4.3: the thread-local allocation fast path for a resolved size class.
pub fn allocate_slab(class: usize) -> *mut u8 {
    let tid = current_thread_id();
    with_cache(|cache| unsafe {
        // Step 1: scan local lists from `class` upward.
        for i in class..NUM_CLASSES {
            let mut page = cache.lists[i];
            while !page.is_null() {
                if let Some(blk) = take_free_block(page) {
                    return blk;
                }
                page = (*page).list_next;
            }
        }

        // Step 2: adopt a page of the exact class from the global pool.
        if let Some(adopted) = global::adopt(class) {
            // Defensive: a page reaches the global pool only once fully
            // reconciled (§4.5 step 3), but re-draining here is cheap and
            // keeps this path correct even if that ever changes.
            page::drain_remote_into_local(adopted);
            (*adopted).owner = tid;
            (*adopted).blocks_used = 1;
            page::page_list_push_front(&mut cache.lists[class], adopted);
            let blk = page::free_list_pop(&mut (*adopted).local_free_head);
            debug_assert!(!blk.is_null(), "an adopted page must have a free block");
            return blk as *mut u8;
        }

        // Step 3: fresh page, mapped straight from the OS.
        let raw = match os::map_anonymous(os::PAGE_SIZE) {
            Some(raw) => raw,
            None => return null_mut(),
        };
        os::advise_no_huge_pages(raw, os::PAGE_SIZE);
        let (header, first) = page::init_slab_page(raw, class, tid);
        if options::verbose() {
            debug!("fresh slab page class={} at {:p}", class, header);
        }
        page::page_list_push_front(&mut cache.lists[class], header);
        first
    })
}

/// Try to satisfy an allocation from a single candidate page: pop a local
/// free block if one is ready, otherwise splice in the remote free list
/// and try again. Returns `None` if the page has nothing to give right now.
unsafe fn take_free_block(page: *mut PageHeader) -> Option<*mut u8> {
    if (*page).local_free_head.is_null() {
        if page::remote_frees_hint(page) == 0 {
            return None;
        }
        page::drain_remote_into_local(page);
        if (*page).local_free_head.is_null() {
            return None;
        }
    }
    let blk = page::free_list_pop(&mut (*page).local_free_head);
    (*page).blocks_used += 1;
    Some(blk as *mut u8)
}

/// §4.5: local free path. `header`'s `owner` must equal the calling
/// thread's id — the caller (the public `free` entry point) has already
/// checked this before routing here.
pub unsafe fn free_local(header: *mut PageHeader, ptr: *mut u8) {
    with_cache(|cache| {
        let blk = ptr as *mut crate::page::FreeBlock;
        page::free_list_push(&mut (*header).local_free_head, blk);
        (*header).blocks_used -= 1;

        // §9's resolved test: wholly unused iff `blocks_used == remote_frees`,
        // since `blocks_used` is only ever decremented by the owner and a
        // pending remote free is still "charged" against it until drained.
        if (*header).blocks_used == page::remote_frees_hint(header) {
            page::drain_remote_into_local(header);
            let class = (*header).size_index;
            page::page_list_unlink(&mut cache.lists[class], header);
            (*header).owner = page::UNOWNED;
            if options::verbose() {
                debug!("page class={} at {:p} returned to global pool", class, header);
            }
            global::release(class, header);
        }
    })
}

/// Test-only peek at whether this thread's local list for `class` is empty.
/// Used to check §8 property 4: a balanced alloc/free sequence leaves no
/// page behind in any thread-local list.
#[cfg(test)]
pub(crate) fn local_list_is_empty(class: usize) -> bool {
    with_cache(|cache| cache.lists[class].is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc;
    use proptest::prelude::*;

    #[test]
    fn thread_ids_are_nonzero_and_stable_within_a_thread() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
        assert_ne!(a, page::UNOWNED);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let mine = current_thread_id();
        let theirs = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, theirs);
    }

    proptest! {
        /// §8 property 4, run on a fresh OS thread so this thread's cache
        /// starts empty: any balanced sequence of allocate/free (every
        /// allocation paired with exactly one free, in arbitrary order)
        /// leaves no page in this thread's local list for the class used.
        #[test]
        fn balanced_sequence_leaves_no_page_locally_retained(
            order in proptest::collection::vec(any::<bool>(), 1..64)
        ) {
            std::thread::spawn(move || unsafe {
                let mut live = Vec::new();
                for grow in order {
                    if grow || live.is_empty() {
                        live.push(alloc::allocate(64));
                    } else {
                        let p = live.pop().unwrap();
                        alloc::free(p);
                    }
                }
                for p in live {
                    alloc::free(p);
                }
                let class = crate::size_class::class_for_size(64).unwrap();
                assert!(local_list_is_empty(class));
            })
            .join()
            .unwrap();
        }
    }
}
