//! Helper functions for the allocator. These are functions that don't
//! particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// This method is used to round adjusted block sizes up to a multiple of
/// [`crate::block::ALIGNMENT`] and heap extension requests up to the same
/// unit, because every payload address we hand out has to keep the heap's
/// alignment invariant.
pub(crate) const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}
