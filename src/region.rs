use std::{marker::PhantomData, mem, ptr::NonNull};

use log::debug;

use crate::{
    block::{FENCEPOST_SIZE, FREE_METADATA_SIZE, RawBlock, State},
    error::GrowError,
    freelist::FreeList,
    kernel::RegionSource,
    utils::align,
};

/// Sizes a new region can have, smallest first. A new region always takes
/// the smallest tier able to hold the block that triggered the growth.
pub const REGION_TIERS: [usize; 3] = [256 << 20, 512 << 20, 1 << 30];

/// Largest payload a single `alloc` call can ask for.
pub const MAX_ALLOCATION_SIZE: usize = (512 << 20) - FREE_METADATA_SIZE;

/// Overhead in bytes introduced by the header at the start of each region.
pub const REGION_HEADER_SIZE: usize = mem::size_of::<RegionHeader>();

/// Bytes of every region that never belong to a real block.
pub const REGION_OVERHEAD: usize = REGION_HEADER_SIZE + 2 * FENCEPOST_SIZE;

#[repr(C)]
struct RegionHeader {
    /// Size of the whole mapping, header included.
    size: usize,
    /// Region mapped right before this one.
    next: Option<Region>,
}

/// Handle to one mapped region. Every region looks like this:
///
/// ```text
/// +--------+-------+---------------------------------------------+-------+
/// | Header | Fence | Block | Block | ...                 | Block | Fence |
/// +--------+-------+---------------------------------------------+-------+
/// ```
///
/// The fenceposts are one-word blocks marked as allocated, so coalescing
/// and heap walks stop at the region edges without knowing where they are.
/// Regions are not adjacent to each other, they are chained through the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region(NonNull<RegionHeader>);

impl Region {
    #[inline]
    fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline]
    pub fn start(self) -> usize {
        self.base().as_ptr() as usize
    }

    #[inline]
    pub fn size(self) -> usize {
        unsafe { self.0.as_ref().size }
    }

    #[inline]
    pub fn next(self) -> Option<Region> {
        unsafe { self.0.as_ref().next }
    }

    #[inline]
    pub fn start_fencepost(self) -> RawBlock {
        unsafe { RawBlock::at(self.base().add(REGION_HEADER_SIZE)) }
    }

    /// First real block of the region, right after the leading fencepost.
    #[inline]
    pub fn first_block(self) -> RawBlock {
        unsafe { RawBlock::at(self.base().add(REGION_HEADER_SIZE + FENCEPOST_SIZE)) }
    }

    #[inline]
    pub fn end_fencepost(self) -> RawBlock {
        unsafe { RawBlock::at(self.base().add(self.size() - FENCEPOST_SIZE)) }
    }

    /// Whether `addr` falls anywhere in the mapping.
    #[inline]
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.start() && addr < self.start() + self.size()
    }

    /// Whether `addr` falls between the two fenceposts, where real block
    /// headers can live.
    #[inline]
    pub fn holds_block(self, addr: usize) -> bool {
        addr >= self.first_block().addr() as usize && addr < self.end_fencepost().addr() as usize
    }
}

/// Smallest region tier able to hold a block of `required` bytes next to the
/// region overhead, if any.
pub(crate) fn tier_for(required: usize) -> Option<usize> {
    REGION_TIERS
        .iter()
        .copied()
        .find(|&tier| required <= tier - REGION_OVERHEAD)
}

/// Chain of every region ever mapped, most recent first.
///
/// ```text
/// +------------------------------------+      +------------------------------------+
/// |        | +-------+    +-------+    |      |        | +-------+    +-------+    |
/// | Region | | Block | -> | Block | .. | ---> | Region | | Block | -> | Block | .. |
/// |        | +-------+    +-------+    |      |        | +-------+    +-------+    |
/// +------------------------------------+      +------------------------------------+
/// ```
///
/// Regions are never given back while the pool lives. They are all unmapped
/// when the pool is dropped.
pub(crate) struct ArenaPool<S: RegionSource> {
    head: Option<Region>,
    len: usize,
    mapped: usize,
    source: S,
}

pub(crate) struct Regions<'a> {
    current: Option<Region>,
    marker: PhantomData<&'a ()>,
}

impl<S: RegionSource> ArenaPool<S> {
    pub const fn new(source: S) -> Self {
        Self {
            head: None,
            len: 0,
            mapped: 0,
            source,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of regions mapped so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Total bytes mapped across every region.
    #[inline]
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    #[inline]
    pub fn first(&self) -> Option<Region> {
        self.head
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Maps a new region big enough for a block of `required` bytes.
    ///
    /// The region is laid out as two fenceposts around a single free block,
    /// which is pushed at the head of `free_list` and returned.
    pub fn grow(&mut self, required: usize, free_list: &mut FreeList) -> Result<RawBlock, GrowError> {
        let tier = tier_for(required).ok_or(GrowError::TooLarge(required))?;
        let len = align(tier, self.source.page_size());

        let addr = unsafe { self.source.map(len) }.ok_or(GrowError::MapFailed(len))?;

        let region = Region(addr.cast());

        unsafe {
            region.0.as_ptr().write(RegionHeader {
                size: len,
                next: self.head,
            });

            region
                .start_fencepost()
                .set_tag(FENCEPOST_SIZE, State::Allocated, false);

            let block = region.first_block();
            block.set_tag(len - REGION_OVERHEAD, State::Free, false);

            region
                .end_fencepost()
                .set_tag(FENCEPOST_SIZE, State::Allocated, true);

            self.head = Some(region);
            self.len += 1;
            self.mapped += len;

            free_list.insert_at_head(block);

            debug!(
                "mapped region #{} of {} bytes at {:#x} for a {} byte block",
                self.len,
                len,
                region.start(),
                required
            );

            Ok(block)
        }
    }

    /// Region whose mapping contains `addr`.
    pub fn region_of(&self, addr: usize) -> Option<Region> {
        self.iter().find(|region| region.contains(addr))
    }

    pub fn iter(&self) -> Regions<'_> {
        Regions {
            current: self.head,
            marker: PhantomData,
        }
    }
}

impl<S: RegionSource> Drop for ArenaPool<S> {
    fn drop(&mut self) {
        let mut current = self.head.take();

        while let Some(region) = current {
            current = region.next();
            let len = region.size();

            unsafe { self.source.unmap(region.base(), len) };
        }
    }
}

impl<'a> Iterator for Regions<'a> {
    type Item = Region;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.current?;
        self.current = region.next();

        Some(region)
    }
}
