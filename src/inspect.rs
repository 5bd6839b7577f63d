//! Read-only views over the heap: block walks, statistics and the integrity
//! check used to verify the allocator from the outside.

use std::{collections::HashSet, marker::PhantomData};

use crate::{
    MemAlloc,
    block::{Block, MIN_BLOCK_SIZE, RawBlock, WORD_SIZE},
    error::HeapError,
    kernel::RegionSource,
    region::{REGION_OVERHEAD, Region},
    utils::is_aligned,
};

/// Iterator over every real block of every region, in memory order inside a
/// region and most recent region first. Fenceposts are skipped.
pub struct Blocks<'a> {
    current: Option<(Region, RawBlock)>,
    marker: PhantomData<&'a ()>,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(first: Option<Region>) -> Self {
        Self {
            current: first.map(|region| (region, region.first_block())),
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (region, block) = self.current?;
        let right = unsafe { block.right() };

        self.current = if right == region.end_fencepost() {
            region.next().map(|next| (next, next.first_block()))
        } else {
            Some((region, right))
        };

        Some(unsafe { Block::new(block) })
    }
}

/// Snapshot of how the mapped memory is being used.
///
/// `free_bytes + allocated_bytes + overhead_bytes == mapped_bytes` holds for
/// any heap that passes [`MemAlloc::check`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub regions: usize,
    pub mapped_bytes: usize,
    /// Region headers and fenceposts.
    pub overhead_bytes: usize,
    pub free_bytes: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    /// Biggest block the next `alloc` can get without growing the heap.
    pub largest_free: usize,
}

impl<S: RegionSource> MemAlloc<S> {
    /// Walks every real block of the heap. See [`Blocks`].
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.pool.first())
    }

    /// Walks the free list in list order, most recently inserted first.
    pub fn free_blocks(&self) -> impl Iterator<Item = Block<'_>> + '_ {
        self.free_list.iter().map(|block| unsafe { Block::new(block) })
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            regions: self.pool.len(),
            mapped_bytes: self.pool.mapped(),
            overhead_bytes: self.pool.len() * REGION_OVERHEAD,
            ..HeapStats::default()
        };

        for block in self.blocks() {
            let size = block.size();

            if block.is_free() {
                stats.free_bytes += size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(size);
            } else {
                stats.allocated_bytes += size;
                stats.allocated_blocks += 1;
            }
        }

        stats
    }

    /// Verifies every heap invariant, region by region:
    ///
    /// - block sizes are word aligned, at least [`MIN_BLOCK_SIZE`] and stay
    ///   inside their region.
    /// - free blocks carry a footer equal to their header.
    /// - every `LEFT_FREE` bit, fenceposts included, matches its neighbour.
    /// - no two memory-adjacent blocks are free.
    /// - the free list holds exactly the free blocks.
    /// - blocks plus overhead add up to the mapped bytes.
    pub fn check(&self) -> Result<(), HeapError> {
        let listed: HashSet<usize> = self
            .free_list
            .iter()
            .map(|block| block.addr() as usize)
            .collect();

        let mut found = 0;
        let mut covered = 0;

        for region in self.pool.iter() {
            let end = region.end_fencepost();
            let end_addr = end.addr() as usize;

            let mut block = region.first_block();
            let mut left_free = false;

            while block != end {
                let addr = block.addr() as usize;
                let size = block.size();

                if !is_aligned(size, WORD_SIZE) {
                    return Err(HeapError::Misaligned { addr, size });
                }
                if size < MIN_BLOCK_SIZE {
                    return Err(HeapError::Undersized { addr, size });
                }
                if addr + size > end_addr {
                    return Err(HeapError::OutOfBounds { addr });
                }
                if block.left_free() != left_free {
                    return Err(HeapError::StaleLeftFlag { addr });
                }

                if block.is_free() {
                    let header = unsafe { block.addr().cast::<usize>().read() };
                    let footer = block.footer();

                    if header != footer {
                        return Err(HeapError::TagMismatch {
                            addr,
                            header,
                            footer,
                        });
                    }
                    if left_free {
                        let left = unsafe { block.left() }.map_or(0, |left| left.addr() as usize);
                        return Err(HeapError::AdjacentFree { left, right: addr });
                    }
                    if !listed.contains(&addr) {
                        return Err(HeapError::NotInFreeList { addr });
                    }

                    found += 1;
                }

                covered += size;
                left_free = block.is_free();
                block = unsafe { block.right() };
            }

            if end.left_free() != left_free {
                return Err(HeapError::StaleLeftFlag { addr: end_addr });
            }
        }

        if found != listed.len() || found != self.free_list.len() {
            return Err(HeapError::FreeListMismatch {
                listed: self.free_list.len(),
                found,
            });
        }

        let expected = self.pool.mapped() - self.pool.len() * REGION_OVERHEAD;
        if covered != expected {
            return Err(HeapError::Conservation { expected, found: covered });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{ALLOC_METADATA_SIZE, MemAlloc, REGION_OVERHEAD, REGION_TIERS};

    #[test]
    fn empty_heap_has_nothing_to_walk() {
        let heap = MemAlloc::new();

        assert_eq!(heap.blocks().count(), 0);
        assert_eq!(heap.stats(), Default::default());
        assert_eq!(heap.check(), Ok(()));
    }

    #[test]
    fn stats_account_for_every_byte() {
        let mut heap = MemAlloc::new();

        let a = heap.alloc(100).unwrap();
        let _b = heap.alloc(3000).unwrap();
        unsafe { heap.release(a.as_ptr()) };

        let stats = heap.stats();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.mapped_bytes, REGION_TIERS[0]);
        assert_eq!(stats.overhead_bytes, REGION_OVERHEAD);
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 3000 + ALLOC_METADATA_SIZE);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(
            stats.free_bytes + stats.allocated_bytes + stats.overhead_bytes,
            stats.mapped_bytes
        );
        assert_eq!(heap.check(), Ok(()));
    }

    #[test]
    fn walk_is_in_memory_order() {
        let mut heap = MemAlloc::new();

        let pointers: Vec<_> = (0..4).map(|_| heap.alloc(48).unwrap()).collect();

        let walked: Vec<_> = heap.blocks().map(|block| block.payload()).collect();
        assert_eq!(walked.len(), 5);
        assert_eq!(&walked[..4], &pointers[..]);
        assert_eq!(heap.free_blocks().count(), 1);
    }
}
