use crate::block::{assert_local_block_invariants, write_free_pattern, BlockHeader, HEADER_SIZE};
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use memory_units::Bytes;

/// A singly linked list of free blocks, threaded through their headers and
/// kept sorted by ascending block address.
///
/// The list never owns the blocks it links; the heap does.
pub(crate) struct FreeList {
    head: *mut BlockHeader,
}

impl FreeList {
    pub(crate) const fn new() -> FreeList {
        FreeList {
            head: ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut BlockHeader {
        self.head
    }

    /// Return the first block in address order whose total size is at least
    /// `size`.
    pub(crate) unsafe fn first_fit(&self, size: Bytes) -> Option<*mut BlockHeader> {
        let mut current = self.head;
        while !current.is_null() {
            if (*current).size() >= size {
                return Some(current);
            }
            current = (*current).next_free();
        }
        None
    }

    /// Find the node whose link points at `block`.
    ///
    /// `block` must be on the list and must not be the head.
    unsafe fn predecessor_of(&self, block: *mut BlockHeader) -> *mut BlockHeader {
        extra_assert!(block != self.head);

        let mut current = self.head;
        while !current.is_null() {
            if (*current).next_free() == block {
                break;
            }
            current = (*current).next_free();
        }

        extra_assert!(!current.is_null(), "{:p} is not on the free list", block);
        current
    }

    /// Find the node that a block at `addr` has to be linked in after: the
    /// first node whose successor lies above `addr`, or the tail.
    ///
    /// The list must be non-empty and its head must lie below `addr`.
    unsafe fn predecessor_for(&self, addr: *mut BlockHeader) -> *mut BlockHeader {
        extra_assert!(!self.head.is_null());
        extra_assert!(self.head < addr);

        let mut current = self.head;
        loop {
            let next = (*current).next_free();
            if next.is_null() || next > addr {
                return current;
            }
            current = next;
        }
    }

    /// Put `new` where `old` currently sits in the list, taking over `old`'s
    /// successor. `old` is unlinked.
    ///
    /// `new` must lie strictly between `old` and `old`'s successor.
    pub(crate) unsafe fn replace(&mut self, old: *mut BlockHeader, new: *mut BlockHeader) {
        extra_assert!(old < new);
        extra_assert!((*old).next_free().is_null() || new < (*old).next_free());

        (*new).set_next_free((*old).next_free());
        if old == self.head {
            self.head = new;
        } else {
            let previous = self.predecessor_of(old);
            (*previous).set_next_free(new);
        }
        (*old).set_next_free(ptr::null_mut());

        assert_is_valid_free_list(self);
    }

    /// Unlink `block`, which must be on the list.
    pub(crate) unsafe fn remove(&mut self, block: *mut BlockHeader) {
        if block == self.head {
            self.head = (*block).next_free();
        } else {
            let previous = self.predecessor_of(block);
            (*previous).set_next_free((*block).next_free());
        }
        (*block).set_next_free(ptr::null_mut());

        assert_is_valid_free_list(self);
    }

    /// Link `block` in at the position its address dictates.
    ///
    /// `block` must not be on the list already.
    pub(crate) unsafe fn insert(&mut self, block: *mut BlockHeader) {
        assert_local_block_invariants(block);
        assert_not_on_list(self, block);

        if self.head.is_null() {
            (*block).set_next_free(ptr::null_mut());
            self.head = block;
        } else if block < self.head {
            (*block).set_next_free(self.head);
            self.head = block;
        } else {
            let previous = self.predecessor_for(block);
            (*block).set_next_free((*previous).next_free());
            (*previous).set_next_free(block);
        }

        assert_is_valid_free_list(self);
    }

    /// Merge every run of physically adjacent free blocks into one block.
    ///
    /// Each merge restarts the walk from the head, so this is quadratic in
    /// the worst case.
    pub(crate) unsafe fn coalesce(&mut self) {
        let mut current = self.head;
        while !current.is_null() {
            let next = (*current).next_free();
            if !next.is_null() && (*current).end() == next as usize {
                (*current).set_size((*current).size() + (*next).size());
                (*current).set_next_free((*next).next_free());
                write_free_pattern(current);
                current = self.head;
                continue;
            }
            current = next;
        }

        assert_is_valid_free_list(self);
        assert_no_adjacent_free_blocks(self);
    }

    pub(crate) fn iter(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            next: self.head,
            _list: PhantomData,
        }
    }
}

extra_only! {
    fn assert_not_on_list(list: &FreeList, block: *mut BlockHeader) {
        assert!(
            list.iter().all(|free| free.header != block),
            "double free of the block at {:p}",
            block
        );
    }
}

extra_only! {
    // Assert global invariants of the given free list:
    //
    // - The free list does not have cycles, which follows from it being
    //   strictly ascending by address.
    //
    // - Every block on the list is well formed and still carries the free
    //   pattern, i.e. there has not been any use-after-free.
    //
    // This is O(size of free list) and can be pretty slow, so try to restrict
    // its usage to verifying that a free list is still valid after mutation.
    pub(crate) fn assert_is_valid_free_list(list: &FreeList) {
        unsafe {
            let mut current = list.head;
            while !current.is_null() {
                assert_local_block_invariants(current);
                crate::block::assert_is_poisoned_with_free_pattern(current);

                let next = (*current).next_free();
                assert!(
                    next.is_null() || current < next,
                    "free list is not sorted by address: {:p} links to {:p}",
                    current,
                    next
                );
                assert!(
                    next.is_null() || (*current).end() <= next as usize,
                    "free blocks {:p} and {:p} overlap",
                    current,
                    next
                );
                current = next;
            }
        }
    }
}

extra_only! {
    fn assert_no_adjacent_free_blocks(list: &FreeList) {
        unsafe {
            let mut current = list.head;
            while !current.is_null() {
                let next = (*current).next_free();
                assert!(
                    next.is_null() || (*current).end() < next as usize,
                    "{:p} and {:p} are still adjacent after coalescing",
                    current,
                    next
                );
                current = next;
            }
        }
    }
}

/// A block on an allocator's free list.
///
/// This is a read-only view; it is only valid while the allocator it came
/// from is not mutated, which the borrow enforces.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock<'a> {
    header: *mut BlockHeader,
    _list: PhantomData<&'a FreeList>,
}

impl<'a> FreeBlock<'a> {
    /// The address of the first byte of the block, header included.
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        // Safety: blocks on the free list are never null.
        unsafe { NonNull::new_unchecked(self.header as *mut u8) }
    }

    /// The block's total size, header included.
    #[inline]
    pub fn size(&self) -> Bytes {
        unsafe { (*self.header).size() }
    }

    /// The number of payload bytes this block could hand out as-is.
    #[inline]
    pub fn capacity(&self) -> Bytes {
        self.size() - HEADER_SIZE
    }

    /// The address one past the block's last byte.
    #[inline]
    pub fn end(&self) -> usize {
        unsafe { (*self.header).end() }
    }

    /// The next free block in address order.
    #[inline]
    pub fn next(&self) -> Option<FreeBlock<'a>> {
        let next = unsafe { (*self.header).next_free() };
        if next.is_null() {
            None
        } else {
            Some(FreeBlock {
                header: next,
                _list: PhantomData,
            })
        }
    }

    pub(crate) fn first(list: &'a FreeList) -> Option<FreeBlock<'a>> {
        if list.head.is_null() {
            None
        } else {
            Some(FreeBlock {
                header: list.head,
                _list: PhantomData,
            })
        }
    }
}

impl fmt::Debug for FreeBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBlock")
            .field("address", &self.address())
            .field("size", &self.size().0)
            .finish()
    }
}

/// An iterator over an allocator's free blocks in ascending address order.
pub struct FreeBlocks<'a> {
    next: *mut BlockHeader,
    _list: PhantomData<&'a FreeList>,
}

impl<'a> Iterator for FreeBlocks<'a> {
    type Item = FreeBlock<'a>;

    fn next(&mut self) -> Option<FreeBlock<'a>> {
        if self.next.is_null() {
            return None;
        }
        let block = FreeBlock {
            header: self.next,
            _list: PhantomData,
        };
        self.next = unsafe { (*self.next).next_free() };
        Some(block)
    }
}

impl FusedIterator for FreeBlocks<'_> {}
