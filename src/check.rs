use std::ptr::NonNull;

use thiserror::Error;

use crate::{
    block::{ALIGNMENT, ALLOC_BIT, BlockPtr, DOUBLE_WORD, SIZE_MASK, WORD},
    heap::Heap,
    source::MemorySource,
};

/// A violated heap invariant, with the payload address it was found at.
///
/// Any of these indicates a bug in the allocator itself (or a caller
/// scribbling over boundary words), never an ordinary failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("heap does not start at the source's low bound (base {base:#x}, low {low:#x})")]
    BaseMismatch { base: usize, low: usize },

    #[error("prologue boundary words are corrupt at {addr:#x}")]
    PrologueCorrupt { addr: usize },

    #[error("block at {addr:#x} is not aligned to the 16-byte unit")]
    Misaligned { addr: usize },

    #[error("block at {addr:#x} reaches outside the heap bounds")]
    OutOfBounds { addr: usize },

    #[error("header and footer of block at {addr:#x} are the same word")]
    HeaderIsFooter { addr: usize },

    #[error("free block at {addr:#x} has mismatched header and footer")]
    BoundaryMismatch { addr: usize },

    #[error("terminal marker at {addr:#x} is corrupt")]
    BadTerminal { addr: usize },
}

impl<S: MemorySource> Heap<S> {
    /// Walks the whole heap and verifies every structural invariant:
    /// the heap starts at the source's low bound, the prologue frames the
    /// low end, every block is aligned and inside the bounds with distinct
    /// header and footer words, free blocks carry matching boundary words,
    /// and the terminal marker sits at the high end with size 0 and the
    /// allocated bit set.
    ///
    /// Diagnostics only; nothing on the allocation path depends on it, and
    /// release builds never call it implicitly.
    pub fn check(&self) -> Result<(), CheckError> {
        let low = self.source.low() as usize;
        let high = self.source.high() as usize;
        let base = self.base.as_ptr() as usize;

        if base != low {
            return Err(CheckError::BaseMismatch { base, low });
        }

        unsafe {
            let prologue =
                BlockPtr::new(NonNull::new_unchecked((base + DOUBLE_WORD) as *mut u8));
            if prologue.size() != DOUBLE_WORD || !prologue.is_allocated() {
                return Err(CheckError::PrologueCorrupt {
                    addr: prologue.addr(),
                });
            }
            let prologue_footer = prologue.footer().read();
            if prologue_footer & SIZE_MASK != DOUBLE_WORD || prologue_footer & ALLOC_BIT == 0 {
                return Err(CheckError::PrologueCorrupt {
                    addr: prologue.addr(),
                });
            }

            let mut block = self.first_block();
            loop {
                let addr = block.addr();
                let size = block.size();
                if size == 0 {
                    break;
                }

                if addr % ALIGNMENT != 0 {
                    return Err(CheckError::Misaligned { addr });
                }
                // Bounds come before any footer access: a corrupt size must
                // not send the walk reading outside the mapping.
                if addr < low || addr + size > high {
                    return Err(CheckError::OutOfBounds { addr });
                }
                if addr - WORD == addr + size - DOUBLE_WORD {
                    return Err(CheckError::HeaderIsFooter { addr });
                }
                if !block.is_allocated() {
                    let footer = block.footer().read();
                    if footer & SIZE_MASK != size || footer & ALLOC_BIT != 0 {
                        return Err(CheckError::BoundaryMismatch { addr });
                    }
                }

                block = block.next();
            }

            // The walk ended on a zero-size word; it must be the terminal
            // marker itself, allocated, at the very end of the heap.
            if block.header() as usize != high - WORD || !block.is_allocated() {
                return Err(CheckError::BadTerminal { addr: block.addr() });
            }
        }

        Ok(())
    }
}
