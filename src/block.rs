use std::{mem, ptr::NonNull};

/// Machine word, the unit of every boundary tag.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Two words: prologue size, header+footer overhead of one block.
pub(crate) const DOUBLE_WORD: usize = 2 * WORD;

/// Every payload address handed out by the allocator is a multiple of this.
pub(crate) const ALIGNMENT: usize = 16;

/// Smallest block we ever carve out: header + footer + the two link words
/// a free block needs for its chain.
pub(crate) const MIN_BLOCK: usize = 2 * ALIGNMENT;

pub(crate) const ALLOC_BIT: usize = 0x1;
pub(crate) const PENDING_BIT: usize = 0x2;
pub(crate) const SIZE_MASK: usize = !(ALIGNMENT - 1);

const _: () = assert!(ALIGNMENT == 2 * WORD);
const _: () = assert!(MIN_BLOCK >= 2 * DOUBLE_WORD);
const _: () = assert!(ALIGNMENT.is_power_of_two());

/// Packs a block size and its allocation state into one boundary word.
/// The size occupies the high bits (it is always a multiple of
/// [`ALIGNMENT`]), bit 0 is the allocated flag and bit 1 is reserved for
/// the realloc-pending flag.
pub(crate) const fn pack(size: usize, allocated: bool) -> usize {
    size | allocated as usize
}

/// Writes a boundary word while preserving the realloc-pending bit that may
/// already be stored there.
unsafe fn write_keeping_tag(word: *mut usize, value: usize) {
    unsafe { word.write(value | (word.read() & PENDING_BIT)) }
}

/// View over one heap block, addressed by its payload pointer.
///
/// The block itself lives inside the heap's byte region; this type is only a
/// navigation handle and owns nothing. All metadata sits in the two boundary
/// words around the payload:
///
/// ```text
///           +---------------------+
/// header -> | size | tag | alloc  |  1 word
///           +---------------------+ <- payload address (16-aligned)
///           |  chain prev (free)  |  \
///           +---------------------+   } payload; the first two words are
///           |  chain next (free)  |  /  overloaded as links while free
///           |         ...         |
///           +---------------------+
/// footer -> | size | tag | alloc  |  1 word (valid while the block is free)
///           +---------------------+
/// ```
///
/// Methods that read or write through the handle are `unsafe`: the caller
/// must guarantee the payload address points into a heap whose boundary
/// words have been initialized, and that link accessors are only used while
/// the block is free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    pub fn new(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    pub fn from_raw(payload: *mut u8) -> Option<Self> {
        NonNull::new(payload).map(Self)
    }

    #[inline]
    pub fn payload(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The boundary word one word before the payload.
    #[inline]
    pub unsafe fn header(self) -> *mut usize {
        unsafe { self.payload().sub(WORD).cast() }
    }

    /// The boundary word at the end of the block. Its position depends on
    /// the size currently stored in the header.
    #[inline]
    pub unsafe fn footer(self) -> *mut usize {
        unsafe { self.payload().add(self.size() - DOUBLE_WORD).cast() }
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header().read() & SIZE_MASK }
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().read() & ALLOC_BIT != 0 }
    }

    #[inline]
    pub unsafe fn is_pending(self) -> bool {
        unsafe { self.header().read() & PENDING_BIT != 0 }
    }

    /// Drops the realloc-pending flag from the header, keeping size and
    /// allocation state untouched.
    pub unsafe fn clear_pending(self) {
        unsafe {
            let header = self.header();
            header.write(header.read() & !PENDING_BIT);
        }
    }

    /// Rewrites the header, preserving an already present pending flag.
    pub unsafe fn set_header(self, size: usize, allocated: bool) {
        unsafe { write_keeping_tag(self.header(), pack(size, allocated)) }
    }

    /// Rewrites the footer, preserving an already present pending flag.
    /// Call this before the header when the footer of the *old* extent is
    /// meant, after it when the footer of the new extent is meant.
    pub unsafe fn set_footer(self, size: usize, allocated: bool) {
        unsafe { write_keeping_tag(self.footer(), pack(size, allocated)) }
    }

    /// Writes a fresh header word, clearing any stale bits. Used for
    /// boundary words that have never described a block before (heap
    /// growth, the allocated half of a split).
    pub unsafe fn init_header(self, size: usize, allocated: bool) {
        unsafe { self.header().write(pack(size, allocated)) }
    }

    pub unsafe fn init_footer(self, size: usize, allocated: bool) {
        unsafe { self.footer().write(pack(size, allocated)) }
    }

    /// Payload address of the physically next block.
    #[inline]
    pub unsafe fn next(self) -> BlockPtr {
        unsafe { BlockPtr(NonNull::new_unchecked(self.payload().add(self.size()))) }
    }

    /// Payload address of the physically previous block, found through its
    /// footer word sitting right before this block's header.
    #[inline]
    pub unsafe fn prev(self) -> BlockPtr {
        unsafe {
            let prev_size = self.payload().sub(DOUBLE_WORD).cast::<usize>().read() & SIZE_MASK;
            BlockPtr(NonNull::new_unchecked(self.payload().sub(prev_size)))
        }
    }

    // While a block is free, its first two payload words thread it into one
    // seglist bucket. They mean nothing once the block is allocated.

    #[inline]
    unsafe fn link_word(self, index: usize) -> *mut usize {
        unsafe { self.payload().cast::<usize>().add(index) }
    }

    /// Previous entry in the bucket chain (smaller or equal size).
    pub unsafe fn link_prev(self) -> Option<BlockPtr> {
        unsafe { BlockPtr::from_raw(self.link_word(0).read() as *mut u8) }
    }

    /// Next entry in the bucket chain (greater or equal size).
    pub unsafe fn link_next(self) -> Option<BlockPtr> {
        unsafe { BlockPtr::from_raw(self.link_word(1).read() as *mut u8) }
    }

    pub unsafe fn set_link_prev(self, link: Option<BlockPtr>) {
        unsafe { self.link_word(0).write(link.map_or(0, BlockPtr::addr)) }
    }

    pub unsafe fn set_link_next(self, link: Option<BlockPtr>) {
        unsafe { self.link_word(1).write(link.map_or(0, BlockPtr::addr)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A slab of raw words the tests can lay fake blocks into.
    #[repr(align(16))]
    struct Slab([u8; 256]);

    fn block_at(slab: &mut Slab, payload_offset: usize) -> BlockPtr {
        assert_eq!(payload_offset % ALIGNMENT, 0);
        BlockPtr::from_raw(unsafe { slab.0.as_mut_ptr().add(payload_offset) }).unwrap()
    }

    #[test]
    fn pack_keeps_size_and_alloc_bit_apart() {
        assert_eq!(pack(64, false), 64);
        assert_eq!(pack(64, true), 65);
        assert_eq!(pack(64, true) & SIZE_MASK, 64);
    }

    #[test]
    fn header_roundtrip() {
        let mut slab = Slab([0; 256]);
        let block = block_at(&mut slab, 16);

        unsafe {
            block.init_header(48, true);
            assert_eq!(block.size(), 48);
            assert!(block.is_allocated());
            assert!(!block.is_pending());

            block.set_header(48, false);
            assert!(!block.is_allocated());
            assert_eq!(block.size(), 48);
        }
    }

    #[test]
    fn set_header_preserves_pending_tag() {
        let mut slab = Slab([0; 256]);
        let block = block_at(&mut slab, 16);

        unsafe {
            block.header().write(pack(48, false) | 0x2);
            assert!(block.is_pending());

            block.set_header(48, true);
            assert!(block.is_pending());

            block.clear_pending();
            assert!(!block.is_pending());
            assert_eq!(block.size(), 48);
            assert!(block.is_allocated());
        }
    }

    #[test]
    fn footer_follows_header_size() {
        let mut slab = Slab([0; 256]);
        let block = block_at(&mut slab, 16);

        unsafe {
            block.init_header(32, false);
            block.init_footer(32, false);
            assert_eq!(block.footer() as usize, block.addr() + 32 - DOUBLE_WORD);
            assert_eq!(block.footer().read() & SIZE_MASK, 32);
        }
    }

    #[test]
    fn physical_navigation() {
        let mut slab = Slab([0; 256]);
        let first = block_at(&mut slab, 16);

        unsafe {
            first.init_header(32, true);
            first.init_footer(32, true);

            let second = first.next();
            assert_eq!(second.addr(), first.addr() + 32);

            second.init_header(48, false);
            second.init_footer(48, false);

            assert_eq!(second.prev(), first);
            assert_eq!(second.next().addr(), second.addr() + 48);
        }
    }

    #[test]
    fn chain_links_live_in_the_payload() {
        let mut slab = Slab([0; 256]);
        let a = block_at(&mut slab, 16);
        let b = block_at(&mut slab, 64);

        unsafe {
            a.init_header(32, false);
            a.set_link_prev(None);
            a.set_link_next(Some(b));
            b.set_link_prev(Some(a));
            b.set_link_next(None);

            assert_eq!(a.link_next(), Some(b));
            assert_eq!(b.link_prev(), Some(a));
            assert_eq!(a.link_prev(), None);
            assert_eq!(b.link_next(), None);
        }
    }
}
