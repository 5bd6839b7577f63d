use std::marker::PhantomData;

use crate::block::{ALLOC_METADATA_SIZE, Links, MIN_BLOCK_SIZE, RawBlock};

/// Explicit list of every free block across all regions.
///
/// The list does not own any storage. Its links are written into the
/// payload of the free blocks themselves, since that payload is unused while
/// the block is free:
///
/// ```text
///                                     Free List
///
///                     Next free block                Next free block
///                +----------------------+  +--------------------------------------+
///                |                      |  |                                      |
/// +--------------|----------------------|--|----+      +--------------------------|-------------------+
/// |        | +---|--+    +-------+    +-|--|-+  |      |        | +-------+    +--|---+    +-------+  |
/// | Region | | Free | -> | Block | -> | Free |  | ---> | Region | | Block | -> | Free | -> | Block |  |
/// |        | +------+    +-------+    +------+  |      |        | +-------+    +------+    +-------+  |
/// +---------------------------------------------+      +----------------------------------------------+
/// ```
///
/// New blocks are always pushed at the head, so the order is the order of
/// insertion, most recent first. Nothing else is guaranteed about it.
pub(crate) struct FreeList {
    head: Option<RawBlock>,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Option<RawBlock>,
    remaining: usize,
    marker: PhantomData<&'a FreeList>,
}

/// Size of the block needed to serve `payload` bytes: the payload plus its
/// header, never less than [`MIN_BLOCK_SIZE`] so the block can be freed later.
#[inline]
pub(crate) fn required_size(payload: usize) -> usize {
    std::cmp::max(payload + ALLOC_METADATA_SIZE, MIN_BLOCK_SIZE)
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes `block` in front of the list.
    ///
    /// **SAFETY**: `block` must be free, big enough to hold [`Links`] and not
    /// already linked.
    pub unsafe fn insert_at_head(&mut self, block: RawBlock) {
        unsafe {
            block.links().as_ptr().write(Links {
                next: self.head,
                prev: None,
            });

            if let Some(head) = self.head {
                (*head.links().as_ptr()).prev = Some(block);
            }
        }

        self.head = Some(block);
        self.len += 1;
    }

    /// Unlinks `block` in O(1) by patching its neighbours in the list.
    ///
    /// **SAFETY**: `block` must currently be linked into this list.
    pub unsafe fn remove(&mut self, block: RawBlock) {
        unsafe {
            let Links { next, prev } = block.links().as_ptr().read();
            debug_assert!(prev.is_some() || self.head == Some(block));

            match prev {
                Some(prev) => (*prev.links().as_ptr()).next = next,
                None => self.head = next,
            }

            if let Some(next) = next {
                (*next.links().as_ptr()).prev = prev;
            }
        }

        self.len -= 1;
    }

    /// Best fit: the smallest free block of at least `required` bytes. When
    /// several blocks share that size the one closest to the head wins.
    pub fn search(&self, required: usize) -> Option<RawBlock> {
        let mut best: Option<RawBlock> = None;

        for block in self.iter() {
            let size = block.size();

            if size == required {
                // Nothing later on can beat an exact fit.
                return Some(block);
            }

            if size > required && best.is_none_or(|best| size < best.size()) {
                best = Some(block);
            }
        }

        best
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = RawBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            self.current = block.links().as_ref().next;
        }
        self.remaining = self.remaining.saturating_sub(1);

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a FreeList {
    type Item = RawBlock;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::block::{State, WORD_SIZE};

    /// Lays out free blocks of the given sizes (in words) back to back.
    fn carve(buf: &mut [usize], words: &[usize]) -> Vec<RawBlock> {
        let start: NonNull<u8> = NonNull::new(buf.as_mut_ptr()).unwrap().cast();
        let mut offset = 0;

        words
            .iter()
            .map(|&w| unsafe {
                let block = RawBlock::at(start.add(offset));
                block.set_tag(w * WORD_SIZE, State::Free, false);
                offset += w * WORD_SIZE;
                block
            })
            .collect()
    }

    fn build(blocks: &[RawBlock]) -> FreeList {
        let mut list = FreeList::new();
        for &block in blocks.iter().rev() {
            unsafe { list.insert_at_head(block) };
        }
        list
    }

    #[test]
    fn new_list_is_empty() {
        let list = FreeList::new();

        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.iter().next().is_none());
        assert!(list.search(MIN_BLOCK_SIZE).is_none());
    }

    #[test]
    fn insertion_is_lifo() {
        let mut buf = [0usize; 64];
        let blocks = carve(&mut buf, &[5, 6, 7]);
        let mut list = FreeList::new();

        for &block in &blocks {
            unsafe { list.insert_at_head(block) };
        }

        let order: Vec<RawBlock> = list.iter().collect();
        assert_eq!(order, vec![blocks[2], blocks[1], blocks[0]]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut buf = [0usize; 64];
        let blocks = carve(&mut buf, &[5, 5, 5, 5]);
        let mut list = build(&blocks);

        unsafe { list.remove(blocks[1]) };
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![blocks[0], blocks[2], blocks[3]]);

        unsafe { list.remove(blocks[0]) };
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![blocks[2], blocks[3]]);

        unsafe { list.remove(blocks[3]) };
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![blocks[2]]);

        unsafe { list.remove(blocks[2]) };
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn search_picks_smallest_fit() {
        let mut buf = [0usize; 64];
        let blocks = carve(&mut buf, &[12, 6, 9, 7]);
        let list = build(&blocks);

        assert_eq!(list.search(6 * WORD_SIZE), Some(blocks[1]));
        assert_eq!(list.search(8 * WORD_SIZE), Some(blocks[2]));
        assert_eq!(list.search(10 * WORD_SIZE), Some(blocks[0]));
        assert_eq!(list.search(13 * WORD_SIZE), None);
    }

    #[test]
    fn search_ties_keep_earliest() {
        let mut buf = [0usize; 64];
        let blocks = carve(&mut buf, &[9, 7, 7, 7]);
        let list = build(&blocks);

        // Both the inexact and the exact paths favour list order.
        assert_eq!(list.search(6 * WORD_SIZE), Some(blocks[1]));
        assert_eq!(list.search(7 * WORD_SIZE), Some(blocks[1]));
    }

    #[test]
    fn required_size_adds_header_and_respects_minimum() {
        assert_eq!(required_size(WORD_SIZE), MIN_BLOCK_SIZE);
        assert_eq!(required_size(64), 64 + ALLOC_METADATA_SIZE);
    }
}
