//! Error types of the allocator.
//!
//! None of these cross the `alloc` / `release` boundary, which always
//! answers with a null pointer or a silent no-op. They are used internally
//! and by the integrity check exposed for testing.

use thiserror::Error;

/// Reasons why the arena pool could not grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrowError {
    /// The block needed does not fit even in the largest region tier.
    #[error("a block of {0} bytes does not fit in any region tier")]
    TooLarge(usize),

    /// The region source refused to map a new region.
    #[error("region source failed to map {0} bytes")]
    MapFailed(usize),
}

/// Broken heap invariants reported by [`crate::MemAlloc::check`].
/// Addresses are the header addresses of the offending blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("block at {addr:#x} has size {size} which is not word aligned")]
    Misaligned { addr: usize, size: usize },

    #[error("block at {addr:#x} has size {size}, below the minimum block size")]
    Undersized { addr: usize, size: usize },

    #[error("block at {addr:#x} runs past the end of its region")]
    OutOfBounds { addr: usize },

    #[error("free block at {addr:#x} has header {header:#x} but footer {footer:#x}")]
    TagMismatch {
        addr: usize,
        header: usize,
        footer: usize,
    },

    #[error("free blocks at {left:#x} and {right:#x} are adjacent")]
    AdjacentFree { left: usize, right: usize },

    #[error("block at {addr:#x} disagrees with its left neighbour about being free")]
    StaleLeftFlag { addr: usize },

    #[error("free block at {addr:#x} is missing from the free list")]
    NotInFreeList { addr: usize },

    #[error("free list holds {listed} blocks but the heap has {found} free blocks")]
    FreeListMismatch { listed: usize, found: usize },

    #[error("blocks cover {found} bytes but regions provide {expected} usable bytes")]
    Conservation { expected: usize, found: usize },
}
