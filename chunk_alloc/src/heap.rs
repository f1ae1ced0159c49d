use super::OutOfMemory;
use core::ptr::NonNull;
use memory_units::Bytes;

/// A source of fresh memory that an [`Allocator`](crate::Allocator) carves
/// blocks out of.
///
/// Heaps only ever grow. Nothing is handed back to the operating system while
/// the heap is alive.
///
/// # Safety
///
/// Every region returned by `grow` must be writable for `size` bytes, aligned
/// to [`ALIGNMENT`](crate::ALIGNMENT), disjoint from every region returned
/// before, and stay valid for as long as the heap value lives.
pub unsafe trait Heap {
    /// Extend the heap by `size` bytes and return the start of the new
    /// region.
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory>;
}

unsafe impl<H: Heap + ?Sized> Heap for &mut H {
    #[inline]
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory> {
        (**self).grow(size)
    }
}
