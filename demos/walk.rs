//! Allocates and frees a few blocks and prints the resulting heap layout.

use tagalloc::MemAlloc;

fn dump(heap: &MemAlloc, title: &str) {
    println!("== {title}");

    let mut current = heap.first_block();
    while let Some(block) = current {
        let state = if heap.is_free(block) { "free" } else { "used" };
        println!("  {:p}  {:>10} bytes  {state}", block.addr(), heap.block_size(block));
        current = heap.next_block(block);
    }

    let stats = heap.stats();
    println!(
        "  regions: {}, free: {} bytes in {} blocks, allocated: {} bytes in {} blocks",
        stats.regions, stats.free_bytes, stats.free_blocks, stats.allocated_bytes, stats.allocated_blocks
    );
}

fn main() {
    env_logger::init();

    let mut heap = MemAlloc::new();

    let blocks: Vec<_> = [64, 64, 64, 128].iter().filter_map(|&size| heap.alloc(size)).collect();
    dump(&heap, "after four allocations");

    unsafe {
        heap.release(blocks[0].as_ptr());
        heap.release(blocks[2].as_ptr());
    }
    dump(&heap, "after releasing the first and third");

    unsafe { heap.release(blocks[1].as_ptr()) };
    dump(&heap, "after releasing the second, which merges all three");

    match heap.check() {
        Ok(()) => println!("heap is consistent"),
        Err(err) => println!("heap is corrupted: {err}"),
    }
}
