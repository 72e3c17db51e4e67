//! OS virtual memory interface
//!
//! The reservation heap asks the platform for large zero-filled chunks and
//! hands them back only when it is dropped. Nothing above this layer knows
//! which syscall produced the memory.

use std::ptr::NonNull;

/// Low-level memory operations and syscalls.
pub trait PlatformMemory: Send + Sync {
    /// Request a committed, zero-filled region of `len` bytes. Returns `None`
    /// if the underlying syscall fails.
    fn request_memory(&self, len: usize) -> Option<NonNull<u8>>;

    /// Give the region of size `len` starting at `addr` back to the kernel.
    ///
    /// # Safety
    /// `addr`/`len` must describe a region previously returned by
    /// [`PlatformMemory::request_memory`] on the same platform, and nothing may
    /// reference it afterwards.
    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes.
    fn page_size(&self) -> usize;
}

/// The operating system's virtual memory
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl SystemMemory {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for SystemMemory {
        fn request_memory(&self, len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            // SAFETY: anonymous private mapping, no existing memory is touched.
            let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            match addr {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }

        unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) {
            unsafe {
                munmap(addr.as_ptr().cast::<c_void>(), len as size_t);
            }
        }

        fn page_size(&self) -> usize {
            // SAFETY: sysconf has no preconditions.
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{PlatformMemory, SystemMemory};

    use std::mem::MaybeUninit;
    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemMemory {
        fn request_memory(&self, len: usize) -> Option<NonNull<u8>> {
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // SAFETY: fresh reservation, no existing memory is touched.
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);
                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(&self, addr: NonNull<u8>, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(
                    addr.as_ptr().cast::<c_void>(),
                    0,
                    Memory::MEM_RELEASE,
                );
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
