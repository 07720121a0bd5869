use crate::block::BlockPtr;

/// Number of size-class buckets in the index.
pub(crate) const BUCKETS: usize = 20;

/// Bucket key for a block of `size` bytes: `min(BUCKETS - 1, floor(log2(size)))`,
/// computed by repeated halving.
pub(crate) fn bucket_of(mut size: usize) -> usize {
    let mut index = 0;
    while index < BUCKETS - 1 && size > 1 {
        size >>= 1;
        index += 1;
    }
    index
}

/// Segregated free-list index: one doubly linked chain of free blocks per
/// size class, threaded through the first two payload words of each member
/// (see [`BlockPtr::link_prev`]).
///
/// ```text
///  buckets[5]  ->  [32]  <->  [48]                      sizes 32..63
///  buckets[6]  ->  [64]  <->  [64]  <->  [112]          sizes 64..127
///      ...
///  buckets[19] ->  [1 MiB]                              everything above
/// ```
///
/// Chains are kept in ascending order of the raw stored size, so the first
/// chain hit that satisfies a request is also the tightest in-bucket fit.
/// The index owns no memory; it only threads blocks that the heap owns, and
/// every free block is a member of exactly one chain.
pub(crate) struct SegList {
    buckets: [Option<BlockPtr>; BUCKETS],
}

impl SegList {
    pub const fn new() -> Self {
        Self {
            buckets: [None; BUCKETS],
        }
    }

    /// Splices `block` into the chain for its stored size, keeping the
    /// chain ascending. Exactly one of four splice shapes applies, keyed on
    /// whether a neighbor exists on either side of the insertion point.
    ///
    /// **Safety**: `block` must be a free block whose header is valid and
    /// which is not currently a member of any chain.
    pub unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            let size = block.size();
            let index = bucket_of(size);

            let mut before: Option<BlockPtr> = None;
            let mut after = self.buckets[index];
            while let Some(current) = after {
                if current.size() >= size {
                    break;
                }
                before = Some(current);
                after = current.link_next();
            }

            match (before, after) {
                // Mid-chain: both neighbors exist.
                (Some(before), Some(after)) => {
                    block.set_link_prev(Some(before));
                    block.set_link_next(Some(after));
                    before.set_link_next(Some(block));
                    after.set_link_prev(Some(block));
                }
                // Tail: everything in the chain is smaller.
                (Some(before), None) => {
                    block.set_link_prev(Some(before));
                    block.set_link_next(None);
                    before.set_link_next(Some(block));
                }
                // Head: the chain starts with a larger block.
                (None, Some(after)) => {
                    block.set_link_prev(None);
                    block.set_link_next(Some(after));
                    after.set_link_prev(Some(block));
                    self.buckets[index] = Some(block);
                }
                // Empty bucket.
                (None, None) => {
                    block.set_link_prev(None);
                    block.set_link_next(None);
                    self.buckets[index] = Some(block);
                }
            }
        }
    }

    /// Unlinks `block` from its chain, found through the bucket its
    /// *current* stored size maps to. The same four structural shapes as
    /// [`SegList::insert`], in reverse.
    ///
    /// **Safety**: `block` must currently be a member of the index.
    pub unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let index = bucket_of(block.size());

            match (block.link_prev(), block.link_next()) {
                (Some(prev), Some(next)) => {
                    prev.set_link_next(Some(next));
                    next.set_link_prev(Some(prev));
                }
                (Some(prev), None) => {
                    prev.set_link_next(None);
                }
                (None, Some(next)) => {
                    next.set_link_prev(None);
                    self.buckets[index] = Some(next);
                }
                (None, None) => {
                    self.buckets[index] = None;
                }
            }
        }
    }

    /// Finds the first free block able to hold `size` bytes, scanning the
    /// matching bucket and every larger one. Blocks carrying the
    /// realloc-pending flag are skipped within the chain rather than ending
    /// the scan.
    ///
    /// **Safety**: every chain member must be a valid free block.
    pub unsafe fn find(&self, size: usize) -> Option<BlockPtr> {
        unsafe {
            for index in bucket_of(size)..BUCKETS {
                let mut current = self.buckets[index];
                while let Some(block) = current {
                    if block.size() >= size && !block.is_pending() {
                        return Some(block);
                    }
                    current = block.link_next();
                }
            }
            None
        }
    }
}
