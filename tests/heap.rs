use std::{cell::Cell, ptr::NonNull, rc::Rc};

use tagalloc::{Kernel, MemAlloc, RegionSource, REGION_TIERS};

use test_log::test;

/// Kernel backed source that counts how many regions come and go.
#[derive(Default, Clone)]
struct Counting {
    maps: Rc<Cell<usize>>,
    unmaps: Rc<Cell<usize>>,
    /// Maps allowed before failing, unlimited when `None`.
    limit: Option<usize>,
}

impl RegionSource for Counting {
    unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        if self.limit.is_some_and(|limit| self.maps.get() >= limit) {
            return None;
        }

        let addr = unsafe { Kernel.map(len) }?;
        self.maps.set(self.maps.get() + 1);
        Some(addr)
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
        self.unmaps.set(self.unmaps.get() + 1);
        unsafe { Kernel.unmap(addr, len) }
    }

    fn page_size(&self) -> usize {
        Kernel.page_size()
    }
}

/// Small deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn assert_conserved<S: RegionSource>(heap: &MemAlloc<S>) {
    let stats = heap.stats();
    assert_eq!(
        stats.free_bytes + stats.allocated_bytes + stats.overhead_bytes,
        stats.mapped_bytes
    );
}

#[test]
fn split_remainder_does_not_map_again() {
    let source = Counting::default();
    let maps = source.maps.clone();
    let mut heap = MemAlloc::with_source(source);

    let big = heap.alloc(4096).unwrap();
    unsafe { heap.release(big.as_ptr()) };
    assert!(heap.alloc(64).is_some());

    assert_eq!(maps.get(), 1);
}

#[test]
fn coalesced_blocks_serve_bigger_requests() {
    let source = Counting::default();
    let maps = source.maps.clone();
    let mut heap = MemAlloc::with_source(source);

    let p1 = heap.alloc(64).unwrap();
    let p2 = heap.alloc(64).unwrap();
    unsafe {
        heap.release(p1.as_ptr());
        heap.release(p2.as_ptr());
    }

    let p3 = heap.alloc(140).unwrap();
    assert_eq!(p3, p1);
    assert_eq!(maps.get(), 1);
    assert_eq!(heap.check(), Ok(()));
}

#[test]
fn dropping_the_heap_unmaps_every_region() {
    let source = Counting::default();
    let (maps, unmaps) = (source.maps.clone(), source.unmaps.clone());

    {
        let mut heap = MemAlloc::with_source(source);
        heap.alloc(200 << 20).unwrap();
        heap.alloc(200 << 20).unwrap();
        assert_eq!(heap.region_count(), 2);
    }

    assert_eq!(maps.get(), 2);
    assert_eq!(unmaps.get(), 2);
}

#[test]
fn exhausted_source_returns_null() {
    let source = Counting {
        limit: Some(1),
        ..Counting::default()
    };
    let mut heap = MemAlloc::with_source(source);

    let first = heap.alloc(200 << 20).unwrap();
    unsafe { first.as_ptr().write(7) };

    // Does not fit in what is left of the only region we may map.
    assert!(heap.alloc(200 << 20).is_none());
    assert_eq!(heap.region_count(), 1);

    // Smaller requests still work from the remainder.
    assert!(heap.alloc(1 << 20).is_some());

    unsafe {
        assert_eq!(first.as_ptr().read(), 7);
        heap.release(first.as_ptr());
    }
    assert_eq!(heap.check(), Ok(()));

    let mut never = MemAlloc::with_source(Counting {
        limit: Some(0),
        ..Counting::default()
    });
    assert!(never.alloc(8).is_none());
    assert_eq!(never.region_count(), 0);
}

#[test]
fn allocations_fit_and_never_overlap() {
    let mut heap = MemAlloc::new();
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for size in (1..2048).step_by(37) {
        let ptr = heap.alloc(size).unwrap();
        let block = unsafe { heap.block_from_payload(ptr) };
        assert!(heap.payload_size(block) >= size);

        let start = ptr.as_ptr() as usize;
        for &(other, other_size) in &live {
            let other = other.as_ptr() as usize;
            assert!(start + size <= other || other + other_size <= start);
        }

        live.push((ptr, size));
    }

    assert_conserved(&heap);
    assert_eq!(heap.check(), Ok(()));
}

#[test]
fn random_workload_keeps_invariants() {
    let mut heap = MemAlloc::new();
    let mut rng = Lcg(0x5eed);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..3000 {
        if live.is_empty() || rng.below(3) != 0 {
            let size = match rng.below(10) {
                0 => 1 + rng.below(64 << 10),
                _ => 1 + rng.below(512),
            };
            let pattern = (round % 251) as u8;

            let ptr = heap.alloc(size).unwrap();
            unsafe { ptr.as_ptr().write_bytes(pattern, size) };
            live.push((ptr, size, pattern));
        } else {
            let (ptr, size, pattern) = live.swap_remove(rng.below(live.len()));

            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == pattern), "payload clobbered");

            unsafe { heap.release(ptr.as_ptr()) };
            assert_eq!(heap.check(), Ok(()));
        }

        assert_conserved(&heap);
    }

    for (ptr, _, _) in live.drain(..) {
        unsafe { heap.release(ptr.as_ptr()) };
    }

    // Everything coalesced back into one block per region.
    let stats = heap.stats();
    assert_eq!(heap.check(), Ok(()));
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, stats.regions);
    assert_eq!(stats.regions, 1);
    assert_eq!(stats.mapped_bytes, REGION_TIERS[0]);
}

#[test]
fn independent_heaps_do_not_share_state() {
    let mut a = MemAlloc::new();
    let mut b = MemAlloc::new();

    let pa = a.alloc(64).unwrap();
    let pb = b.alloc(64).unwrap();

    // A pointer from another heap is unknown here and gets ignored.
    unsafe { a.release(pb.as_ptr()) };
    let block = unsafe { b.block_from_payload(pb) };
    assert!(!b.is_free(block));

    unsafe { a.release(pa.as_ptr()) };
    assert_eq!(a.stats().allocated_blocks, 0);
    assert_eq!(b.stats().allocated_blocks, 1);
}
