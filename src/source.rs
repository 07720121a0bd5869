use std::ptr::NonNull;

use crate::utils::align;

/// The memory-extension primitive underneath the heap.
///
/// The allocator never talks to the operating system directly; it sees one
/// contiguous byte region that can only grow at its end. This trait is that
/// seam: [`MmapSource`] backs it with real virtual memory, and tests can
/// substitute a capacity-limited source to force out-of-memory paths.
pub trait MemorySource {
    /// Extends the region by `len` bytes and returns the address of the
    /// first new byte, or `None` when the backing store cannot grow.
    fn grow(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// First byte of the region.
    fn low(&self) -> *mut u8;

    /// One past the last byte handed out by [`MemorySource::grow`].
    fn high(&self) -> *mut u8;
}

/// Production [`MemorySource`]: reserves one fixed virtual address range up
/// front and moves a break pointer through it, so every `grow` returns bytes
/// physically adjacent to the previous ones.
///
/// ```text
///  low                     break                         low + capacity
///   |  bytes owned by heap   |     reserved, untouched       |
///   +------------------------+-------------------------------+
///                            '--> grow(n) bumps this
/// ```
///
/// The reservation is page-granular. On unix the mapping is made with
/// `MAP_NORESERVE`, so the untouched tail costs no physical memory; the
/// windows path commits the whole range up front.
pub struct MmapSource {
    base: NonNull<u8>,
    brk: usize,
    capacity: usize,
}

impl MmapSource {
    /// Address-space cap used by [`crate::SegAlloc`]: 1 GiB.
    pub const DEFAULT_CAPACITY: usize = 1 << 30;

    /// Reserves `capacity` bytes (rounded up to the page size) of virtual
    /// address space. Returns `None` if the platform refuses the mapping.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = align(capacity, platform::page_size());
        let base = unsafe { platform::reserve(capacity)? };
        Some(Self {
            base,
            brk: 0,
            capacity,
        })
    }
}

impl MemorySource for MmapSource {
    fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
        // A refusal must stay silent: the caller may hold the global
        // allocator's lock, and a logger that allocates would re-enter it.
        if len > self.capacity - self.brk {
            return None;
        }

        let addr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk += len;
        Some(addr)
    }

    fn low(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn high(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.brk) }
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        unsafe { platform::release(self.base.as_ptr(), self.capacity) }
    }
}

#[cfg(unix)]
mod platform {
    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    use libc::{mmap, munmap, off_t, size_t};

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }

    pub(super) unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
        // Read-Write only memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        // NORESERVE keeps the unused tail of the reservation out of the
        // commit charge until the break reaches it.
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        unsafe {
            match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                libc::MAP_FAILED => None,
                addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
            }
        }
    }

    pub(super) unsafe fn release(addr: *mut u8, len: usize) {
        unsafe {
            munmap(addr as *mut c_void, len as size_t);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    pub(super) fn page_size() -> usize {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }

    pub(super) unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe {
            let addr = Memory::VirtualAlloc(None, len, flags, protection);

            NonNull::new(addr.cast())
        }
    }

    pub(super) unsafe fn release(addr: *mut u8, _len: usize) {
        unsafe {
            let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
        }
    }
}
