//! Helpers that don't belong to any concrete part of the allocator.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. It is used to round block sizes up to
/// [`crate::WORD_SIZE`], so the low bits of every tag stay free for flags, and
/// region lengths up to [`crate::RegionSource::page_size`].
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Whether `addr` is a multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn is_aligned(addr: usize, alignment: usize) -> bool {
    addr & (alignment - 1) == 0
}
