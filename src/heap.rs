use std::ptr::{self, NonNull};

use thiserror::Error;

use crate::{
    block::{ALIGNMENT, BlockPtr, DOUBLE_WORD, MIN_BLOCK, WORD, pack},
    seglist::SegList,
    source::MemorySource,
    utils::align,
};

/// Bytes asked from the source by the first extension `init` performs.
const INITIAL_CHUNK: usize = 1 << 6;

/// Adjusted requests at or above this many bytes take the upper half of a
/// split, leaving the free remainder at the lower address. Keeping large
/// allocations near the freshly extended end of the heap avoids shaving the
/// same big free block down from the front over and over.
const SPLIT_HIGH_THRESHOLD: usize = 100;

/// The memory source could not provide the bytes `init` needs for the
/// prologue, terminal marker and first free chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory source exhausted while laying out the initial heap")]
pub struct InitError;

/// A segregated-fit heap over one growable byte region.
///
/// The region is framed by a fixed prologue block at the low end and a
/// zero-size, always-allocated terminal marker at the high end, so neighbor
/// lookups never need a bounds test:
///
/// ```text
///  low                                                          high
///   | pad | prologue hdr | prologue ftr | block | block | ... | terminal |
///   +-----+--------------+--------------+-------+-------+-----+----------+
///    8 B        8 B            8 B           blocks, 16-aligned     8 B
/// ```
///
/// Every mutating operation runs to completion synchronously; the heap has
/// no internal synchronization and assumes a single logical thread of
/// control (see [`crate::SegAlloc`] for the shared wrapper).
pub struct Heap<S: MemorySource> {
    pub(crate) source: S,
    index: SegList,
    pub(crate) base: NonNull<u8>,
}

impl<S: MemorySource> Heap<S> {
    /// Lays out the prologue and terminal marker, then performs one heap
    /// extension of [`INITIAL_CHUNK`] bytes so the first allocation has a
    /// free block to look at.
    pub fn init(mut source: S) -> Result<Self, InitError> {
        let base = source.grow(4 * WORD).ok_or(InitError)?;

        unsafe {
            let words = base.cast::<usize>().as_ptr();
            words.write(0); // padding, keeps payloads 16-aligned
            words.add(1).write(pack(DOUBLE_WORD, true)); // prologue header
            words.add(2).write(pack(DOUBLE_WORD, true)); // prologue footer
            words.add(3).write(pack(0, true)); // terminal marker
        }

        let mut heap = Self {
            source,
            index: SegList::new(),
            base,
        };

        if heap.extend(INITIAL_CHUNK).is_none() {
            return Err(InitError);
        }

        heap.debug_check();
        Ok(heap)
    }

    /// Allocates at least `size` bytes and returns the 16-aligned payload
    /// address, or null when `size` is 0 or the source cannot grow anymore.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        // Requests this close to the address-space limit cannot even be
        // padded without wrapping.
        if size > usize::MAX - 2 * MIN_BLOCK {
            return ptr::null_mut();
        }

        // Header and footer ride along with every request.
        let adjusted = align(size + DOUBLE_WORD, ALIGNMENT);

        unsafe {
            let candidate = match self.index.find(adjusted) {
                Some(block) => block,
                None => match self.extend(adjusted) {
                    Some(block) => block,
                    None => return ptr::null_mut(),
                },
            };

            let block = self.place(candidate, adjusted);
            self.debug_check();
            block.payload()
        }
    }

    /// Returns a block to the heap and merges it with free neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an address previously returned by this heap's
    /// `alloc`/`realloc`/`calloc` and not freed since. Anything else is
    /// undefined behavior; the heap keeps no registry of live blocks.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(block) = BlockPtr::from_raw(ptr) else {
            return;
        };

        unsafe {
            let size = block.size();

            // A deferred release from an earlier in-place resize attempt.
            block.next().clear_pending();

            block.set_header(size, false);
            block.set_footer(size, false);
            self.index.insert(block);
            self.coalesce(block);
        }

        self.debug_check();
    }

    /// Resizes a block by allocating a new one, copying the payload over
    /// and freeing the old block. On allocation failure the old block is
    /// left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`] for non-null `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if size == 0 {
                self.free(ptr);
                return ptr::null_mut();
            }

            let Some(old) = BlockPtr::from_raw(ptr) else {
                return self.alloc(size);
            };

            let new = self.alloc(size);
            if new.is_null() {
                return ptr::null_mut();
            }

            // The old payload spans at most block size minus the two
            // boundary words; never read past it.
            let preserved = size.min(old.size() - DOUBLE_WORD);
            ptr::copy_nonoverlapping(old.payload(), new, preserved);

            self.free(old.payload());
            new
        }
    }

    /// Allocates `count * size` zero-filled bytes. A product that overflows
    /// `usize` is reported as out-of-memory.
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let ptr = self.alloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) }
        }
        ptr
    }

    /// Asks the source for `size` more bytes (rounded up to the alignment
    /// unit) and frames them as one free block. The new block's header
    /// lands on the previous terminal marker, and a fresh terminal marker
    /// is written after it. The block is indexed and immediately coalesced,
    /// since a free block may have been bordering the old heap end.
    fn extend(&mut self, size: usize) -> Option<BlockPtr> {
        let extent = align(size, ALIGNMENT);
        let addr = self.source.grow(extent)?;

        unsafe {
            let block = BlockPtr::new(addr);
            block.init_header(extent, false);
            block.init_footer(extent, false);
            block.next().init_header(0, true); // new terminal marker

            self.index.insert(block);
            Some(self.coalesce(block))
        }
    }

    /// Merges `block` with whichever physical neighbors are free and
    /// returns the merged block's (possibly relocated) handle. `block` must
    /// already be free and indexed. A predecessor carrying the
    /// realloc-pending flag counts as allocated: a pending block must not
    /// move while its resize is in flight.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        unsafe {
            let prev = block.prev();
            let next = block.next();
            let prev_busy = prev.is_allocated() || prev.is_pending();
            let next_busy = next.is_allocated();
            let mut size = block.size();

            let merged = match (prev_busy, next_busy) {
                (true, true) => return block,
                (true, false) => {
                    self.index.remove(block);
                    self.index.remove(next);
                    size += next.size();
                    block.set_header(size, false);
                    block.set_footer(size, false);
                    block
                }
                (false, true) => {
                    self.index.remove(block);
                    self.index.remove(prev);
                    size += prev.size();
                    // This block's old footer becomes the merged footer.
                    block.set_footer(size, false);
                    prev.set_header(size, false);
                    prev
                }
                (false, false) => {
                    self.index.remove(block);
                    self.index.remove(prev);
                    self.index.remove(next);
                    size += prev.size() + next.size();
                    prev.set_header(size, false);
                    // The successor's old footer becomes the merged footer.
                    next.set_footer(size, false);
                    prev
                }
            };

            self.index.insert(merged);
            merged
        }
    }

    /// Carves an `adjusted`-byte allocation out of a free `block` taken
    /// from the index. Remainders too small to stand alone stay attached;
    /// otherwise the request lands in the lower or upper half depending on
    /// [`SPLIT_HIGH_THRESHOLD`]. Returns the allocated block.
    unsafe fn place(&mut self, block: BlockPtr, adjusted: usize) -> BlockPtr {
        unsafe {
            let total = block.size();
            let remainder = total - adjusted;

            self.index.remove(block);

            if remainder < MIN_BLOCK {
                // The caller absorbs the slack.
                block.set_header(total, true);
                block.set_footer(total, true);
                block
            } else if adjusted >= SPLIT_HIGH_THRESHOLD {
                block.set_header(remainder, false);
                block.set_footer(remainder, false);
                let upper = block.next();
                upper.init_header(adjusted, true);
                upper.init_footer(adjusted, true);
                self.index.insert(block);
                upper
            } else {
                block.set_header(adjusted, true);
                block.set_footer(adjusted, true);
                let rest = block.next();
                rest.init_header(remainder, false);
                rest.init_footer(remainder, false);
                self.index.insert(rest);
                block
            }
        }
    }

    /// First real block: right after the prologue.
    pub(crate) fn first_block(&self) -> BlockPtr {
        BlockPtr::new(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(2 * DOUBLE_WORD)) })
    }

    /// Walks the heap from the first real block up to (excluding) the
    /// terminal marker.
    ///
    /// **Safety**: the iterator reads boundary words; the heap must stay
    /// unmodified for the iterator's lifetime.
    #[cfg(test)]
    pub(crate) unsafe fn blocks(&self) -> Blocks {
        Blocks {
            current: self.first_block(),
        }
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self) {
        if let Err(violation) = self.check() {
            panic!("heap invariant violated: {violation}");
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self) {}
}

/// Linear block walk, terminated by the zero-size terminal marker.
#[cfg(test)]
pub(crate) struct Blocks {
    current: BlockPtr,
}

#[cfg(test)]
impl Iterator for Blocks {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<BlockPtr> {
        unsafe {
            if self.current.size() == 0 {
                return None;
            }
            let block = self.current;
            self.current = block.next();
            Some(block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MmapSource;

    fn heap() -> Heap<MmapSource> {
        Heap::init(MmapSource::new(1 << 20).unwrap()).unwrap()
    }

    /// (free block count, free bytes) from a linear heap scan.
    fn free_summary(heap: &Heap<MmapSource>) -> (usize, usize) {
        unsafe {
            heap.blocks()
                .filter(|block| !block.is_allocated())
                .fold((0, 0), |(count, bytes), block| {
                    (count + 1, bytes + block.size())
                })
        }
    }

    #[test]
    fn zero_size_request_returns_null() {
        let mut heap = heap();
        assert!(heap.alloc(0).is_null());
    }

    #[test]
    fn unpaddable_request_returns_null() {
        let mut heap = heap();
        assert!(heap.alloc(usize::MAX).is_null());
    }

    #[test]
    fn payloads_are_aligned_and_disjoint() {
        let mut heap = heap();
        let sizes = [1usize, 8, 24, 100, 500, 3000];
        let mut live: Vec<(usize, usize)> = Vec::new();

        for (fill, &size) in sizes.iter().enumerate() {
            let ptr = heap.alloc(size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % ALIGNMENT, 0);

            unsafe { ptr::write_bytes(ptr, fill as u8 + 1, size) };
            live.push((ptr as usize, size));
        }

        let mut ranges = live.clone();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "payloads overlap");
        }

        // Every fill byte survived all later allocations.
        for (fill, &(addr, size)) in live.iter().enumerate() {
            let payload = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
            assert!(payload.iter().all(|&byte| byte == fill as u8 + 1));
        }
    }

    #[test]
    fn freed_block_is_reused() {
        let mut heap = heap();

        let first = heap.alloc(16);
        let _second = heap.alloc(16);

        unsafe { heap.free(first) };
        let again = heap.alloc(16);

        assert_eq!(first, again);
    }

    #[test]
    fn small_requests_take_the_lower_half_of_a_split() {
        let mut heap = heap();

        // The initial 64-byte chunk splits in two; the allocation must sit
        // below the free remainder.
        let ptr = heap.alloc(16);
        let blocks: Vec<(usize, bool, usize)> = unsafe {
            heap.blocks()
                .map(|block| (block.addr(), block.is_allocated(), block.size()))
                .collect()
        };

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], (ptr as usize, true, 32));
        assert_eq!(blocks[1], (ptr as usize + 32, false, 32));
    }

    #[test]
    fn large_requests_take_the_upper_half_of_a_split() {
        let mut heap = heap();

        // Adjusted size 224 extends the heap and merges with the initial
        // 64-byte chunk; the free remainder must stay at the lower address.
        let ptr = heap.alloc(200);
        let blocks: Vec<(usize, bool, usize)> = unsafe {
            heap.blocks()
                .map(|block| (block.addr(), block.is_allocated(), block.size()))
                .collect()
        };

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], (ptr as usize - 64, false, 64));
        assert_eq!(blocks[1], (ptr as usize, true, 224));
    }

    #[test]
    fn coalescing_three_adjacent_blocks() {
        let mut heap = heap();

        let a = heap.alloc(16);
        let b = heap.alloc(16);
        let c = heap.alloc(16);
        assert_eq!(b as usize, a as usize + 32);
        assert_eq!(c as usize, b as usize + 32);

        unsafe { heap.free(b) };
        assert_eq!(free_summary(&heap), (1, 32));

        unsafe { heap.free(a) };
        assert_eq!(free_summary(&heap), (1, 64));

        unsafe { heap.free(c) };
        // One free block spanning all three extents.
        assert_eq!(free_summary(&heap), (1, 96));

        let merged = unsafe { heap.blocks().find(|block| !block.is_allocated()) }.unwrap();
        assert_eq!(merged.payload(), a);
    }

    #[test]
    fn pending_predecessor_is_never_merged() {
        let mut heap = heap();

        let a = heap.alloc(16);
        let b = heap.alloc(16);
        let _c = heap.alloc(16);

        unsafe { heap.free(a) };

        // Tag the freed block as if a resize of it were still in flight.
        let tagged = BlockPtr::from_raw(a).unwrap();
        unsafe {
            let header = tagged.header();
            header.write(header.read() | 0x2);

            heap.free(b);

            // The tagged block counts as busy, so the two free neighbors
            // stay separate.
            assert_eq!(free_summary(&heap), (2, 64));
            assert!(tagged.is_pending());
        }
    }

    #[test]
    fn freeing_a_block_clears_its_successors_pending_tag() {
        let mut heap = heap();

        let p = heap.alloc(16);
        let q = heap.alloc(16);

        let tagged = BlockPtr::from_raw(q).unwrap();
        unsafe {
            let header = tagged.header();
            header.write(header.read() | 0x2);
            assert!(tagged.is_pending());

            heap.free(p);

            assert!(!tagged.is_pending());
            assert!(tagged.is_allocated());
            assert_eq!(tagged.size(), 32);
        }
    }

    #[test]
    fn realloc_preserves_the_old_payload() {
        let mut heap = heap();

        let old = heap.alloc(64);
        for offset in 0..64 {
            unsafe { old.add(offset).write(offset as u8 ^ 0xA5) };
        }

        let new = unsafe { heap.realloc(old, 256) };
        assert!(!new.is_null());
        assert_ne!(new, old);

        for offset in 0..64 {
            assert_eq!(unsafe { new.add(offset).read() }, offset as u8 ^ 0xA5);
        }
    }

    #[test]
    fn realloc_to_zero_behaves_as_free() {
        let mut heap = heap();

        let ptr = heap.alloc(32);
        assert!(unsafe { heap.realloc(ptr, 0) }.is_null());

        // The block went back to the heap and is handed out again.
        assert_eq!(heap.alloc(32), ptr);
    }

    #[test]
    fn realloc_null_behaves_as_alloc() {
        let mut heap = heap();

        let ptr = unsafe { heap.realloc(ptr::null_mut(), 48) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % ALIGNMENT, 0);
    }

    #[test]
    fn failed_realloc_leaves_the_old_block_intact() {
        // A one-page source: large growth requests must be refused.
        let mut heap = Heap::init(MmapSource::new(1).unwrap()).unwrap();

        let old = heap.alloc(100);
        assert!(!old.is_null());
        unsafe { ptr::write_bytes(old, 0x7E, 100) };

        let new = unsafe { heap.realloc(old, 1 << 20) };
        assert!(new.is_null());

        let payload = unsafe { std::slice::from_raw_parts(old, 100) };
        assert!(payload.iter().all(|&byte| byte == 0x7E));
        let block = BlockPtr::from_raw(old).unwrap();
        assert!(unsafe { block.is_allocated() });
    }

    #[test]
    fn calloc_zero_fills() {
        let mut heap = heap();

        let ptr = heap.calloc(10, 7);
        assert!(!ptr.is_null());
        let payload = unsafe { std::slice::from_raw_parts(ptr, 70) };
        assert!(payload.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn calloc_checks_the_product() {
        let mut heap = heap();

        assert!(heap.calloc(usize::MAX, 2).is_null());
        assert!(heap.calloc(0, 16).is_null());
    }

    #[test]
    fn checker_passes_after_arbitrary_operations() {
        let mut heap = heap();

        let a = heap.alloc(24);
        let b = heap.alloc(500);
        unsafe { heap.free(a) };
        let c = unsafe { heap.realloc(b, 1200) };
        let d = heap.calloc(3, 64);
        unsafe {
            heap.free(c);
            heap.free(d);
        }

        assert!(heap.check().is_ok());
    }

    #[test]
    fn checker_detects_a_corrupted_header() {
        let mut heap = heap();

        // Splitting the initial chunk leaves a free block behind the
        // allocation; inflate its stored size.
        let ptr = heap.alloc(16);
        let free_block = BlockPtr::from_raw(unsafe { ptr.add(32) }).unwrap();
        unsafe {
            assert!(!free_block.is_allocated());
            let header = free_block.header();
            header.write(header.read() + 16);
        }

        assert!(heap.check().is_err());
    }

    #[test]
    fn randomized_churn_never_corrupts_live_blocks() {
        let mut heap = heap();
        let mut rng: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };

        let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

        for round in 0..400u64 {
            match next() % 3 {
                0 => {
                    let size = (next() % 256 + 1) as usize;
                    let fill = (round % 251) as u8;
                    let ptr = heap.alloc(size);
                    assert!(!ptr.is_null());
                    unsafe { ptr::write_bytes(ptr, fill, size) };
                    live.push((ptr, size, fill));
                }
                1 if !live.is_empty() => {
                    let victim = next() as usize % live.len();
                    let (ptr, _, _) = live.swap_remove(victim);
                    unsafe { heap.free(ptr) };
                }
                2 if !live.is_empty() => {
                    let victim = next() as usize % live.len();
                    let (ptr, size, fill) = live[victim];
                    let new_size = (next() % 256 + 1) as usize;
                    let new_ptr = unsafe { heap.realloc(ptr, new_size) };
                    assert!(!new_ptr.is_null());

                    let preserved = size.min(new_size);
                    let payload =
                        unsafe { std::slice::from_raw_parts(new_ptr, preserved) };
                    assert!(payload.iter().all(|&byte| byte == fill));

                    unsafe { ptr::write_bytes(new_ptr, fill, new_size) };
                    live[victim] = (new_ptr, new_size, fill);
                }
                _ => {}
            }

            // No operation may have touched any other live payload.
            for &(ptr, size, fill) in &live {
                let payload = unsafe { std::slice::from_raw_parts(ptr, size) };
                assert!(payload.iter().all(|&byte| byte == fill), "round {round}");
            }
        }

        for (ptr, _, _) in live {
            unsafe { heap.free(ptr) };
        }

        // Everything coalesced back into a single free block.
        assert_eq!(free_summary(&heap).0, 1);
        assert!(heap.check().is_ok());
    }
}
