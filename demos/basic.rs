use std::ptr::NonNull;

use tagalloc::MemAlloc;

fn log_alloc(addr: Option<NonNull<u8>>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    env_logger::init();

    let mut allocator = MemAlloc::new();

    let addr1 = allocator.alloc(8);
    log_alloc(addr1, 8);

    let addr2 = allocator.alloc(8);
    log_alloc(addr2, 8);

    let addr3 = allocator.alloc(16);
    log_alloc(addr3, 16);

    unsafe {
        for addr in [addr1, addr2, addr3].into_iter().flatten() {
            allocator.release(addr.as_ptr());
        }
    }

    // Freed blocks were merged back, so this lands where the first one was.
    let addr4 = allocator.alloc(24);
    log_alloc(addr4, 24);
    println!("Reused first address: {}", addr4 == addr1);
}
