//! # tagalloc
//!
//! A general purpose memory allocator built straight on top of anonymous
//! memory mappings. Memory is requested from the kernel in big regions and
//! carved into blocks which are managed with an explicit free list:
//!
//! ```text
//!                       Free List
//!            +------------------------------------+
//!            |                                    |
//! +----------|-----------------+      +----------|---------------+
//! | R | F | Free | Block | F |  ---> | R | F | Free | Block | F |
//! +----------------------------+      +--------------------------+
//!
//! R: region header, F: fencepost
//! ```
//!
//! - `alloc` takes the best fitting free block, splitting it when the
//!   leftover is big enough to be a block of its own, and maps a new region
//!   when nothing fits.
//! - `release` merges the freed block with its free neighbours in O(1) by
//!   reading boundary tags (see [`Block`]), so no two adjacent blocks are
//!   ever free at the same time.
//! - `F` are fenceposts, tiny blocks always marked as allocated which keep
//!   coalescing from crossing region edges.
//!
//! The allocator is single threaded. Every [`MemAlloc`] instance owns its own
//! regions and free list and gives its regions back to the kernel on drop.
//!
//! ```rust
//! use tagalloc::MemAlloc;
//!
//! let mut heap = MemAlloc::new();
//!
//! let ptr = heap.alloc(64).expect("out of memory").cast::<u64>();
//! unsafe {
//!     ptr.write(42);
//!     assert_eq!(ptr.read(), 42);
//!     heap.release(ptr.as_ptr().cast());
//! }
//! ```

mod block;
mod error;
mod freelist;
mod inspect;
mod kernel;
mod region;
mod utils;

use std::ptr::NonNull;

use log::{debug, error, warn};

pub use crate::{
    block::{
        ALLOC_METADATA_SIZE, Block, FENCEPOST_SIZE, FREE_METADATA_SIZE, MIN_ALLOCATION_SIZE,
        MIN_BLOCK_SIZE, TAG_SIZE, WORD_SIZE,
    },
    error::{GrowError, HeapError},
    inspect::{Blocks, HeapStats},
    kernel::{Kernel, RegionSource},
    region::{MAX_ALLOCATION_SIZE, REGION_HEADER_SIZE, REGION_OVERHEAD, REGION_TIERS},
    utils::align,
};

use crate::{
    block::{RawBlock, State},
    freelist::{FreeList, required_size},
    region::{ArenaPool, Region},
    utils::is_aligned,
};

/// The allocator state: the pool of mapped regions plus the list of free
/// blocks spread across them.
///
/// Regions come from `S`, which defaults to the operating system.
pub struct MemAlloc<S: RegionSource = Kernel> {
    pool: ArenaPool<S>,
    free_list: FreeList,
}

impl MemAlloc {
    pub const fn new() -> Self {
        Self::with_source(Kernel)
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RegionSource> MemAlloc<S> {
    /// Creates an empty allocator taking its regions from `source`. Nothing
    /// is mapped until the first allocation.
    pub const fn with_source(source: S) -> Self {
        Self {
            pool: ArenaPool::new(source),
            free_list: FreeList::new(),
        }
    }

    /// Returns a pointer to at least `size` writable bytes aligned to
    /// [`WORD_SIZE`], or `None` if `size` is zero, bigger than
    /// [`MAX_ALLOCATION_SIZE`], or no memory could be mapped.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        // Checked before rounding so the rounding cannot overflow.
        if size > MAX_ALLOCATION_SIZE {
            debug!("rejecting allocation of {size} bytes");
            return None;
        }

        let target = align(size.max(MIN_ALLOCATION_SIZE), WORD_SIZE);
        let required = required_size(target);

        if self.free_list.is_empty() {
            self.grow(required)?;
        }

        let block = match self.free_list.search(required) {
            Some(block) => block,
            None => {
                self.grow(required)?;
                self.free_list.search(required)?
            }
        };

        Some(unsafe { self.place(block, required) })
    }

    fn grow(&mut self, required: usize) -> Option<RawBlock> {
        self.pool
            .grow(required, &mut self.free_list)
            .inspect_err(|err| warn!("cannot grow the heap: {err}"))
            .ok()
    }

    /// Takes `block` out of the free list and marks it allocated, giving the
    /// tail back to the free list when it can stand as a block on its own.
    ///
    /// **SAFETY**: `block` must be in the free list and hold `required` bytes.
    unsafe fn place(&mut self, block: RawBlock, required: usize) -> NonNull<u8> {
        unsafe {
            self.free_list.remove(block);

            let size = block.size();
            let leftover = size - required;

            if leftover >= MIN_BLOCK_SIZE {
                block.set_tag(required, State::Allocated, block.left_free());

                // The block after the tail already knows its left side is free.
                let rest = block.right();
                rest.set_tag(leftover, State::Free, false);
                self.free_list.insert_at_head(rest);
            } else {
                // Too small to split, the user gets the sliver too.
                block.set_tag(size, State::Allocated, block.left_free());
                block.right().set_left_free(false);
            }

            block.payload()
        }
    }

    /// Gives back memory obtained from [`MemAlloc::alloc`].
    ///
    /// Null, misaligned and unknown pointers, fenceposts and double frees are
    /// ignored.
    ///
    /// **SAFETY**: `ptr` must be null or a pointer returned by `alloc` on this
    /// same allocator. It must not be used after this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        if !is_aligned(ptr as usize, WORD_SIZE) {
            warn!("ignoring release of misaligned pointer {ptr:p}");
            return;
        }

        if self.pool.is_empty() {
            warn!("ignoring release of {ptr:p}, nothing was ever allocated");
            return;
        }

        let addr = (ptr as usize).wrapping_sub(ALLOC_METADATA_SIZE);
        let Some(region) = self.pool.region_of(addr) else {
            error!("release of {ptr:p} which does not belong to any region");
            return;
        };

        if addr == region.start_fencepost().addr() as usize
            || addr == region.end_fencepost().addr() as usize
        {
            warn!("ignoring release of fencepost at {addr:#x}");
            return;
        }

        if !region.holds_block(addr) {
            error!("release of {ptr:p} which points into a region header");
            return;
        }

        let block = unsafe { RawBlock::from_payload(payload) };

        if block.is_free() {
            warn!("ignoring double free of {ptr:p}");
            return;
        }

        unsafe {
            block.set_tag(block.size(), State::Free, block.left_free());
            block.right().set_left_free(true);
            self.free_list.insert_at_head(block);

            let block = self.coalesce_left(block);
            self.coalesce_right(block);
        }
    }

    /// Merges the free `block` into its left neighbour if that one is free
    /// too. Returns the block that now covers `block`.
    ///
    /// **SAFETY**: `block` must be a free block linked into the free list.
    unsafe fn coalesce_left(&mut self, block: RawBlock) -> RawBlock {
        unsafe {
            let Some(left) = block.left() else {
                return block;
            };

            if left.is_fencepost() || !left.is_free() {
                return block;
            }

            self.free_list.remove(block);
            self.free_list.remove(left);

            left.set_tag(left.size() + block.size(), State::Free, left.left_free());
            self.free_list.insert_at_head(left);

            left
        }
    }

    /// Absorbs the right neighbour of the free `block` if it is free.
    ///
    /// **SAFETY**: `block` must be a free block linked into the free list.
    unsafe fn coalesce_right(&mut self, block: RawBlock) {
        unsafe {
            let right = block.right();

            if right.is_fencepost() || !right.is_free() {
                return;
            }

            self.free_list.remove(right);
            self.free_list.remove(block);

            block.set_tag(block.size() + right.size(), State::Free, block.left_free());
            self.free_list.insert_at_head(block);
        }
    }

    pub fn is_free(&self, block: Block<'_>) -> bool {
        block.is_free()
    }

    /// Total size of `block`, metadata included.
    pub fn block_size(&self, block: Block<'_>) -> usize {
        block.size()
    }

    /// Bytes the user can write to when `block` is allocated.
    pub fn payload_size(&self, block: Block<'_>) -> usize {
        block.size() - ALLOC_METADATA_SIZE
    }

    /// First real block of the most recently mapped region.
    pub fn first_block(&self) -> Option<Block<'_>> {
        self.pool
            .first()
            .map(|region| unsafe { Block::new(region.first_block()) })
    }

    /// Block right after `block` in memory. At the end of a region this
    /// continues with the first block of the next region in the chain, and
    /// returns `None` past the last one or for blocks of another heap.
    pub fn next_block(&self, block: Block<'_>) -> Option<Block<'_>> {
        let block = block.raw();
        let region = self.pool.region_of(block.addr() as usize)?;

        let next = if block == region.start_fencepost() {
            Some(region.first_block())
        } else {
            let right = (block != region.end_fencepost())
                .then(|| unsafe { block.right() })
                .filter(|right| !right.is_fencepost());

            right.or_else(|| region.next().map(Region::first_block))
        };

        next.map(|next| unsafe { Block::new(next) })
    }

    /// Block whose payload starts at `ptr`.
    ///
    /// **SAFETY**: `ptr` must have been returned by [`MemAlloc::alloc`] on
    /// this allocator and not released since.
    pub unsafe fn block_from_payload(&self, ptr: NonNull<u8>) -> Block<'_> {
        unsafe { Block::new(RawBlock::from_payload(ptr)) }
    }

    /// Number of regions mapped so far.
    pub fn region_count(&self) -> usize {
        self.pool.len()
    }

    pub fn source(&self) -> &S {
        self.pool.source()
    }
}
