//! Size-class table and the arithmetic that resolves a request to a class.
//!
//! The table is the canonical 15-entry sequence named in the design: each
//! entry is the *usable* size a block in that class advertises to callers.
//! The on-page stride between consecutive block slots is rounded up
//! independently (see [`stride_for_class`]) so that every block start stays
//! 16-byte aligned even for classes whose nominal size (24, 48, 96, 192,
//! 384, 768) is not itself a multiple of 16.

use crate::page::FreeBlock;
use core::mem::size_of;

/// Minimum block alignment guaranteed to callers.
pub const BLOCK_ALIGN: usize = 16;

/// The canonical size classes, smallest to largest.
pub const SIZE_CLASSES: [usize; 15] = [
    16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

pub const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Any request this large or smaller is "large" per §9's threshold decision.
pub const MAX_CLASS_SIZE: usize = SIZE_CLASSES[NUM_CLASSES - 1];

/// Floor for any request: a free block must be able to hold its own
/// intrusive prev/next link when it is not in use.
#[inline]
pub const fn min_request_size() -> usize {
    size_of::<FreeBlock>()
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The byte stride between consecutive block slots within a page of the
/// given class. Always a multiple of `BLOCK_ALIGN`, always `>= class size`.
#[inline]
pub const fn stride_for_class(class: usize) -> usize {
    align_up(SIZE_CLASSES[class], BLOCK_ALIGN)
}

/// Resolve a request length to a size-class index, or `None` if the
/// request is large (exceeds [`MAX_CLASS_SIZE`]).
#[inline]
pub fn class_for_size(len: usize) -> Option<usize> {
    let len = len.max(min_request_size());
    if len > MAX_CLASS_SIZE {
        return None;
    }
    // The table is short and sorted; a linear scan is both simpler and, for
    // 15 entries, no slower in practice than a binary search.
    SIZE_CLASSES.iter().position(|&size| size >= len)
}

/// Round a large request up to the mapping granularity used for the raw
/// byte size recorded in a large object's header (a multiple of 16, as for
/// slab blocks, so the sentinel stays comparable to slab classes).
#[inline]
pub fn round_large(len: usize) -> usize {
    align_up(len.max(min_request_size()), BLOCK_ALIGN)
}
