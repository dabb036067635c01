//! Global free-page pool: one process-wide page list per size class, each
//! behind its own mutex, holding fully-empty pages any thread may adopt.
//!
//! The pool itself is created by a one-shot initializer (§4.8) the first
//! time any thread touches it — there is no separate "start up the
//! allocator" call in this design, matching the spec's public surface of
//! exactly three operations.

use crate::page::{self, PageHeader};
use crate::size_class::NUM_CLASSES;
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::{Mutex, Once};

/// A bare page-header pointer, wrapped so the `Mutex` holding it can be
/// `Sync` without declaring the much stronger "this pointer is safe to
/// share unsynchronized" — access only ever happens through the mutex.
struct PagePtr(*mut PageHeader);
unsafe impl Send for PagePtr {}

struct GlobalPageList {
    head: Mutex<PagePtr>,
}

impl GlobalPageList {
    fn new() -> Self {
        GlobalPageList {
            head: Mutex::new(PagePtr(null_mut())),
        }
    }
}

struct GlobalPool {
    lists: [GlobalPageList; NUM_CLASSES],
}

impl GlobalPool {
    fn new() -> Self {
        GlobalPool {
            lists: std::array::from_fn(|_| GlobalPageList::new()),
        }
    }
}

static INIT: Once = Once::new();
static mut POOL: MaybeUninit<GlobalPool> = MaybeUninit::uninit();

/// §4.8: initialize the array of global per-class mutexes exactly once,
/// before any other access to the pool.
fn pool() -> &'static GlobalPool {
    INIT.call_once(|| unsafe {
        POOL.write(GlobalPool::new());
    });
    // SAFETY: `call_once` above guarantees the write happens-before every
    // read that reaches this point, on every thread.
    unsafe { POOL.assume_init_ref() }
}

/// Unlink and return the head page of class `class`'s global list, if any.
/// The caller takes full ownership of reinitializing it as a local page
/// (§4.3 step 2): this function only performs the list surgery.
pub fn adopt(class: usize) -> Option<*mut PageHeader> {
    let mut guard = pool().lists[class].head.lock().unwrap();
    let head = guard.0;
    if head.is_null() {
        return None;
    }
    unsafe {
        page::page_list_unlink(&mut guard.0, head);
    }
    Some(head)
}

/// Insert a wholly-unused page at the front of class `class`'s global
/// list (§4.5 step 3). The caller must have already cleared `owner` and
/// drained any remote frees.
pub fn release(class: usize, page: *mut PageHeader) {
    let mut guard = pool().lists[class].head.lock().unwrap();
    unsafe {
        page::page_list_push_front(&mut guard.0, page);
    }
}
