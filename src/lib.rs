//! A general-purpose dynamic memory allocator built on segregated free
//! lists and boundary-tag coalescing.
//!
//! The allocator manages one contiguous heap that only ever grows at its
//! end. Every block carries its size and allocation state in a header word
//! (and, while free, in a duplicate footer word), so physical neighbors can
//! be reached in both directions without any external metadata:
//!
//! ```text
//!            Heap
//!  +------------------------------------------------------------------+
//!  | prologue | alloc | free | alloc |      free      | ... | terminal |
//!  +------------------------------------------------------------------+
//!                ^        \                  ^
//!                |         \                 |
//!     payload handed        \  chained into one of 20 size-class
//!     to the caller          \ buckets through its payload words
//!                             \
//!                       +-------------+
//!                       |   SegList   |  bucket k holds free blocks
//!                       | 20 buckets  |  with floor(log2(size)) == k
//!                       +-------------+
//! ```
//!
//! Free blocks are indexed by a segregated free list: 20 buckets on a
//! log2 size scale, each a doubly linked chain ordered by size. An
//! allocation searches its bucket and every larger one, extends the heap
//! only on a complete miss, and splits oversized blocks; a free merges the
//! block with any free physical neighbor and re-indexes the result.
//!
//! # Usage
//!
//! Either drive a [`Heap`] directly:
//!
//! ```
//! use segalloc::{Heap, MmapSource};
//!
//! let source = MmapSource::new(1 << 20).unwrap();
//! let mut heap = Heap::init(source).unwrap();
//!
//! let ptr = heap.alloc(64);
//! assert!(!ptr.is_null());
//! unsafe { heap.free(ptr) };
//! ```
//!
//! or install [`SegAlloc`] as the process allocator:
//!
//! ```rust,ignore
//! use segalloc::SegAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: SegAlloc = SegAlloc::new();
//! ```
//!
//! The heap itself is strictly single-threaded; [`SegAlloc`] serializes
//! every public call behind one coarse lock, which is the only locking
//! granularity that is safe here (coalescing and splitting rewrite the
//! metadata of neighboring blocks).

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    hint, ptr,
    sync::atomic::{AtomicBool, Ordering},
};

mod block;
mod check;
mod heap;
mod seglist;
mod source;
mod utils;

pub use check::CheckError;
pub use heap::{Heap, InitError};
pub use source::{MemorySource, MmapSource};

use block::ALIGNMENT;

struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Process-lifetime allocator: one [`Heap`] over an [`MmapSource`], built
/// lazily on first use and serialized behind a single spin lock.
///
/// Const-constructible, so it can back a `#[global_allocator]` static. The
/// heap reserves [`MmapSource::DEFAULT_CAPACITY`] bytes of address space up
/// front; if the reservation or the initial layout fails, every allocation
/// reports out-of-memory by returning null.
///
/// No log record is ever emitted while the lock is held: as the process
/// allocator, any logger that formats a message allocates through this very
/// type, and a log call inside the locked region would deadlock against
/// itself.
pub struct SegAlloc {
    lock: SpinLock,
    heap: UnsafeCell<Option<Heap<MmapSource>>>,
    init_failure_logged: AtomicBool,
}

// The spin lock serializes all access to the inner heap.
unsafe impl Sync for SegAlloc {}

impl SegAlloc {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            heap: UnsafeCell::new(None),
            init_failure_logged: AtomicBool::new(false),
        }
    }

    fn bootstrap() -> Result<Heap<MmapSource>, InitError> {
        let source = MmapSource::new(MmapSource::DEFAULT_CAPACITY).ok_or(InitError)?;
        Heap::init(source)
    }

    /// Runs `operation` on the lazily initialized heap under the lock.
    fn with<R>(&self, fallback: R, operation: impl FnOnce(&mut Heap<MmapSource>) -> R) -> R {
        self.lock.lock();

        let slot = unsafe { &mut *self.heap.get() };
        let heap = match slot {
            Some(heap) => heap,
            None => match Self::bootstrap() {
                Ok(heap) => slot.insert(heap),
                Err(error) => {
                    // Unlock before logging: a logger that allocates
                    // re-enters this allocator. Report the failure once,
                    // or a logger hitting the same failure would recurse.
                    self.lock.unlock();
                    if !self.init_failure_logged.swap(true, Ordering::Relaxed) {
                        log::error!("allocator initialization failed: {error}");
                    }
                    return fallback;
                }
            },
        };

        let result = operation(heap);
        self.lock.unlock();
        result
    }

    /// See [`Heap::alloc`].
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.with(ptr::null_mut(), |heap| heap.alloc(size))
    }

    /// See [`Heap::calloc`].
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        self.with(ptr::null_mut(), |heap| heap.calloc(count, size))
    }

    /// See [`Heap::free`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live address obtained from this allocator.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        self.with((), |heap| unsafe { heap.free(ptr) })
    }

    /// See [`Heap::realloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live address obtained from this allocator.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.with(ptr::null_mut(), |heap| unsafe { heap.realloc(ptr, size) })
    }

    /// Runs the full consistency check, logging any violation. Returns
    /// whether the heap passed.
    pub fn check(&self) -> bool {
        match self.with(Ok(()), |heap| heap.check()) {
            Ok(()) => true,
            Err(violation) => {
                log::error!("heap check failed: {violation}");
                false
            }
        }
    }
}

impl Default for SegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for SegAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The heap only guarantees the 16-byte unit.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.deallocate(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        unsafe { self.reallocate(ptr, new_size) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate_zeroed(1, layout.size())
    }
}
