use std::ptr::NonNull;

use log::warn;

/// Where regions come from. As the allocator, our top level view of memory
/// has nothing to do with the concrete APIs offered by each kernel, so the
/// syscalls are hidden behind this trait.
///
/// Implementations must hand out page aligned, zero filled memory that stays
/// valid until it is given back through [`RegionSource::unmap`].
pub trait RegionSource {
    /// Requests a memory region of `len` bytes. Returns `None` if the
    /// underlying syscall fails.
    ///
    /// **SAFETY**: the returned memory is owned by the caller until unmapped.
    unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Gives the `len` bytes starting at `addr` back to the kernel.
    ///
    /// **SAFETY**: `addr` and `len` must describe a region obtained from
    /// [`RegionSource::map`] on this same source, and nothing may use it afterwards.
    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes. This is usually 4096.
    fn page_size(&self) -> usize;
}

/// [`RegionSource`] backed by the operating system's anonymous mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Kernel, RegionSource, warn};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl RegionSource for Kernel {
        unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            if addr == libc::MAP_FAILED {
                return None;
            }

            NonNull::new(addr.cast::<u8>())
        }

        unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
            if unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } != 0 {
                let err = std::io::Error::last_os_error();
                warn!("munmap of {len} bytes at {addr:p} failed: {err}");
            }
        }

        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, RegionSource, warn};

    use windows::Win32::System::{Memory, SystemInformation};

    impl RegionSource for Kernel {
        unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn unmap(&mut self, addr: NonNull<u8>, _len: usize) {
            let freed =
                unsafe { Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE) };

            if let Err(err) = freed {
                warn!("VirtualFree of {addr:p} failed: {err}");
            }
        }

        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let page = Kernel.page_size();

        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn mapped_memory_is_zeroed_and_writable() {
        let mut kernel = Kernel;
        let len = 4 * kernel.page_size();

        unsafe {
            let addr = kernel.map(len).expect("mmap failed");
            assert_eq!(addr.as_ptr() as usize % kernel.page_size(), 0);

            let bytes = std::slice::from_raw_parts_mut(addr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));

            bytes[len - 1] = 0xAB;
            assert_eq!(bytes[len - 1], 0xAB);

            kernel.unmap(addr, len);
        }
    }

    #[test]
    #[cfg(unix)]
    fn failed_unmap_is_not_fatal() {
        let mut kernel = Kernel;
        let len = kernel.page_size();

        unsafe {
            let addr = kernel.map(len).expect("mmap failed");

            // Not page aligned, so the kernel refuses it and the region survives.
            kernel.unmap(addr.add(1), len);
            addr.as_ptr().write(7);
            assert_eq!(addr.as_ptr().read(), 7);

            kernel.unmap(addr, len);
        }
    }
}
