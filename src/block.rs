use std::{fmt, marker::PhantomData, mem, ptr::NonNull};

/// A tag is the single machine word every block starts with. It packs the
/// block size together with two flag bits that real sizes never use, since
/// every block size is a multiple of [`WORD_SIZE`].
pub(crate) type Tag = usize;

/// Alignment unit of every block and every payload.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Width of a header or footer tag.
pub const TAG_SIZE: usize = mem::size_of::<Tag>();

/// Smallest payload handed out, requests below this are rounded up.
pub const MIN_ALLOCATION_SIZE: usize = WORD_SIZE;

/// Metadata carried by an allocated block: only its header tag.
pub const ALLOC_METADATA_SIZE: usize = TAG_SIZE;

/// Metadata carried by a free block: header, free list links and footer.
pub const FREE_METADATA_SIZE: usize = 2 * TAG_SIZE + mem::size_of::<Links>();

/// Smallest real block. Any allocated block may be freed later, so it must be
/// able to hold the free block metadata plus one word.
pub const MIN_BLOCK_SIZE: usize = MIN_ALLOCATION_SIZE + FREE_METADATA_SIZE;

/// Size of the sentinel blocks placed at both edges of every region.
pub const FENCEPOST_SIZE: usize = TAG_SIZE;

/// Set when the block is handed out to the user.
const ALLOCATED: Tag = 0b01;
/// Set when the memory-adjacent block on the left is free, which means the
/// word right before this block is a valid footer.
const LEFT_FREE: Tag = 0b10;

const FLAGS: Tag = ALLOCATED | LEFT_FREE;

/// Allocation state written into a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Free,
    Allocated,
}

/// Free list links. They live in the payload of free blocks, right after the
/// header, because that payload is not used by anyone while the block is free.
#[repr(C)]
pub(crate) struct Links {
    pub next: Option<RawBlock>,
    pub prev: Option<RawBlock>,
}

/// Unchecked handle to a block living inside one of the allocator regions.
///
/// Both free and allocated blocks start with a header [`Tag`]. Free blocks
/// also keep their [`Links`] and a footer, which is a copy of the header
/// stored in the last word of the block:
///
/// ```text
///        Allocated block                      Free block
/// +-------------------------+       +-------------------------+
/// |   size | LEFT_FREE | 1  |       |   size | LEFT_FREE | 0  |  <- header
/// +-------------------------+       +-------------------------+
/// |                         |       |        next free        |
/// |         Payload         |       |        prev free        |
/// |                         |       |         (unused)        |
/// |                         |       +-------------------------+
/// |                         |       |   size | LEFT_FREE | 0  |  <- footer
/// +-------------------------+       +-------------------------+
/// ```
///
/// The footer is what makes coalescing O(1): a block whose `LEFT_FREE` bit is
/// set reads the word right before its header to learn where its left
/// neighbour starts. The right neighbour is always `addr + size`.
///
/// Handles are only built by the allocator itself over memory it mapped and
/// carry no lifetime, so they must never outlive the regions. Outside the
/// crate blocks are seen through [`Block`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct RawBlock(NonNull<Tag>);

impl RawBlock {
    /// Builds a handle for the block whose header sits at `addr`.
    ///
    /// **SAFETY**: `addr` must be word aligned and point into memory owned by
    /// the allocator, and any tag read through the handle must have been written.
    #[inline]
    pub(crate) unsafe fn at(addr: NonNull<u8>) -> Self {
        Self(addr.cast())
    }

    /// Inverse of [`RawBlock::payload`].
    ///
    /// **SAFETY**: `ptr` must be a payload pointer previously returned by the allocator.
    #[inline]
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        unsafe { Self::at(ptr.sub(ALLOC_METADATA_SIZE)) }
    }

    /// Address of the header of this block.
    #[inline]
    pub fn addr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline]
    fn tag(self) -> Tag {
        unsafe { self.0.as_ptr().read() }
    }

    /// Total size of the block in bytes, metadata included.
    #[inline]
    pub fn size(self) -> usize {
        self.tag() & !FLAGS
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.tag() & ALLOCATED == 0
    }

    /// Fenceposts are the only blocks smaller than [`MIN_BLOCK_SIZE`].
    #[inline]
    pub fn is_fencepost(self) -> bool {
        self.size() < MIN_BLOCK_SIZE
    }

    #[inline]
    pub(crate) fn left_free(self) -> bool {
        self.tag() & LEFT_FREE != 0
    }

    /// First byte the user can write to.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { self.0.cast::<u8>().add(ALLOC_METADATA_SIZE) }
    }

    /// Footer word of the block. Only meaningful while the block is free.
    #[inline]
    pub(crate) fn footer(self) -> Tag {
        unsafe { self.footer_ptr(self.size()).read() }
    }

    #[inline]
    unsafe fn footer_ptr(self, size: usize) -> *mut Tag {
        unsafe { self.addr().add(size - TAG_SIZE).cast() }
    }

    /// Writes the header of the block and, if the block is free, its footer.
    ///
    /// **SAFETY**: the whole `size` bytes starting at this block must belong
    /// to a single region.
    pub(crate) unsafe fn set_tag(self, size: usize, state: State, left_free: bool) {
        debug_assert_eq!(size & FLAGS, 0, "block size {size} is not word aligned");

        let mut tag = size;
        if state == State::Allocated {
            tag |= ALLOCATED;
        }
        if left_free {
            tag |= LEFT_FREE;
        }

        unsafe {
            self.0.as_ptr().write(tag);
            if state == State::Free {
                self.footer_ptr(size).write(tag);
            }
        }
    }

    /// Updates the `LEFT_FREE` bit, keeping the footer in sync for free blocks.
    ///
    /// **SAFETY**: same as [`RawBlock::set_tag`].
    pub(crate) unsafe fn set_left_free(self, left_free: bool) {
        let state = if self.is_free() { State::Free } else { State::Allocated };
        unsafe { self.set_tag(self.size(), state, left_free) }
    }

    /// Memory-adjacent block on the right. Its header always exists, since
    /// the last block of a region is followed by a fencepost.
    ///
    /// **SAFETY**: `self` must not be the trailing fencepost of a region.
    #[inline]
    pub(crate) unsafe fn right(self) -> RawBlock {
        unsafe { RawBlock(self.0.byte_add(self.size())) }
    }

    /// Memory-adjacent block on the left, found through its footer. Returns
    /// `None` when that block is allocated, because then there is no footer.
    ///
    /// **SAFETY**: `self` must be a real block, never a fencepost.
    #[inline]
    pub(crate) unsafe fn left(self) -> Option<RawBlock> {
        if !self.left_free() {
            return None;
        }

        unsafe {
            let footer = self.0.as_ptr().sub(1).read();
            Some(RawBlock(self.0.byte_sub(footer & !FLAGS)))
        }
    }

    /// Free list links stored right after the header.
    ///
    /// **SAFETY**: the block must be free and at least [`MIN_BLOCK_SIZE`] bytes.
    #[inline]
    pub(crate) unsafe fn links(self) -> NonNull<Links> {
        unsafe { self.0.add(1).cast() }
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:p})", self.0)
    }
}

/// A block of a [`crate::MemAlloc`] heap, borrowed from the allocator.
///
/// The handle keeps the heap borrowed, so it cannot be read once the heap
/// and its regions are gone:
///
/// ```compile_fail
/// use tagalloc::MemAlloc;
///
/// let block = {
///     let mut heap = MemAlloc::new();
///     heap.alloc(64);
///     heap.first_block().unwrap()
/// };
/// block.size();
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    raw: RawBlock,
    marker: PhantomData<&'a ()>,
}

impl<'a> Block<'a> {
    /// **SAFETY**: `raw` must stay mapped for `'a`.
    #[inline]
    pub(crate) unsafe fn new(raw: RawBlock) -> Self {
        Self {
            raw,
            marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn raw(self) -> RawBlock {
        self.raw
    }

    /// Address of the header of this block.
    #[inline]
    pub fn addr(self) -> *mut u8 {
        self.raw.addr()
    }

    /// Total size of the block in bytes, metadata included.
    #[inline]
    pub fn size(self) -> usize {
        self.raw.size()
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.raw.is_free()
    }

    #[inline]
    pub fn is_fencepost(self) -> bool {
        self.raw.is_fencepost()
    }

    /// First byte the user can write to.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.raw.payload()
    }
}

impl fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.raw.addr())
            .field("size", &self.size())
            .field("free", &self.is_free())
            .finish()
    }
}
