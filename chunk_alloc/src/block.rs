use core::mem;
use core::ptr::{self, NonNull};
use memory_units::Bytes;

/// The unit every payload is rounded up to.
pub const ALIGNMENT: Bytes = Bytes(8);

/// The number of bytes in front of every payload, free or allocated.
pub const HEADER_SIZE: Bytes = Bytes(mem::size_of::<BlockHeader>());

/// Requests for more than this many bytes (header included) get their own
/// region from the heap. Everything else is carved out of a chunk this size.
pub const CHUNK_SIZE: Bytes = Bytes(8192);

const _: () = assert!(ALIGNMENT.0.is_power_of_two());
const _: () = assert!(HEADER_SIZE.0 % ALIGNMENT.0 == 0);
const _: () = assert!(mem::align_of::<BlockHeader>() <= ALIGNMENT.0);
const _: () = assert!(CHUNK_SIZE.0 % ALIGNMENT.0 == 0);

/// Round `size` up to the next multiple of `ALIGNMENT`, or `None` on
/// overflow.
#[inline]
pub(crate) fn align_up(size: Bytes) -> Option<Bytes> {
    let mask = ALIGNMENT.0 - 1;
    size.0.checked_add(mask).map(|n| Bytes(n & !mask))
}

/// The full block size (header included) needed to hand out `size` payload
/// bytes.
#[inline]
pub(crate) fn total_size_for(size: Bytes) -> Option<Bytes> {
    align_up(size)?.0.checked_add(HEADER_SIZE.0).map(Bytes)
}

#[cfg(feature = "extra_assertions")]
impl BlockHeader {
    // Whenever a block goes onto the free list we write this pattern over its
    // payload, and check it is still intact when the block is handed out
    // again.
    //
    // If you see unexpected `0x57575757` values, then either (a) you have a
    // use-after-free, or (b) there is a bug in the free list.
    const FREE_PATTERN: u8 = 0x57;
}

/// The metadata in front of every block.
///
/// `size` counts the header itself plus the payload. `next_free` is only
/// meaningful while the block sits on the free list.
#[repr(C)]
pub(crate) struct BlockHeader {
    size: usize,
    next_free: *mut BlockHeader,
}

impl BlockHeader {
    /// Write a fresh header with the given total size and no free-list link
    /// at `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be `ALIGNMENT`-aligned and writable for `size` bytes.
    pub(crate) unsafe fn write(raw: *mut u8, size: Bytes) -> *mut BlockHeader {
        extra_assert!(!raw.is_null());
        extra_assert!(size >= HEADER_SIZE);

        let raw = raw as *mut BlockHeader;
        ptr::write(
            raw,
            BlockHeader {
                size: size.0,
                next_free: ptr::null_mut(),
            },
        );
        assert_local_block_invariants(raw);
        raw
    }

    /// Recover the header of the block whose payload starts at `payload`.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> *mut BlockHeader {
        let block = payload.as_ptr().sub(HEADER_SIZE.0) as *mut BlockHeader;
        assert_local_block_invariants(block);
        block
    }

    #[inline]
    pub(crate) fn payload(block: *mut BlockHeader) -> NonNull<u8> {
        extra_assert!(!block.is_null());
        // Safety: headers live strictly inside a heap region, so the byte
        // after one is still in bounds and non-null.
        unsafe { NonNull::new_unchecked((block as *mut u8).add(HEADER_SIZE.0)) }
    }

    #[inline]
    pub(crate) fn size(&self) -> Bytes {
        Bytes(self.size)
    }

    #[inline]
    pub(crate) fn set_size(&mut self, size: Bytes) {
        self.size = size.0;
    }

    #[inline]
    pub(crate) fn next_free(&self) -> *mut BlockHeader {
        self.next_free
    }

    #[inline]
    pub(crate) fn set_next_free(&mut self, next: *mut BlockHeader) {
        self.next_free = next;
    }

    /// The address one past this block's last byte.
    #[inline]
    pub(crate) fn end(&self) -> usize {
        self as *const BlockHeader as usize + self.size
    }

    /// Shrink `block` to exactly `size` bytes and build a new block out of
    /// the rest. The new block inherits `block`'s free-list successor.
    ///
    /// # Safety
    ///
    /// `block` must be valid, and its slack past `size` must hold at least a
    /// header.
    pub(crate) unsafe fn split(block: *mut BlockHeader, size: Bytes) -> *mut BlockHeader {
        assert_local_block_invariants(block);
        let orig_size = (*block).size();
        extra_assert!(size >= HEADER_SIZE);
        extra_assert!(orig_size - size >= HEADER_SIZE);

        let remainder = BlockHeader::write((block as *mut u8).add(size.0), orig_size - size);
        (*remainder).next_free = (*block).next_free;
        (*block).size = size.0;

        extra_assert_eq!((*block).size() + (*remainder).size(), orig_size);
        extra_assert_eq!((*block).end(), remainder as usize);
        assert_local_block_invariants(block);
        assert_local_block_invariants(remainder);
        remainder
    }

    // Derived from the raw block pointer: a `&self` only covers the header.
    #[cfg(feature = "extra_assertions")]
    unsafe fn payload_bytes<'a>(block: *mut BlockHeader) -> &'a mut [u8] {
        let len = (*block).size - HEADER_SIZE.0;
        let data = BlockHeader::payload(block);
        core::slice::from_raw_parts_mut(data.as_ptr(), len)
    }
}

extra_only! {
    pub(crate) fn assert_local_block_invariants(block: *mut BlockHeader) {
        assert!(!block.is_null());
        assert_eq!(
            block as usize % ALIGNMENT.0,
            0,
            "{:p} is not aligned to {} bytes",
            block,
            ALIGNMENT.0
        );
        let size = unsafe { (*block).size() };
        assert!(size >= HEADER_SIZE, "block smaller than its own header");
        assert_eq!(
            (size - HEADER_SIZE).0 % ALIGNMENT.0,
            0,
            "block payload is not a multiple of the alignment"
        );
    }
}

extra_only! {
    pub(crate) fn write_free_pattern(block: *mut BlockHeader) {
        unsafe {
            BlockHeader::payload_bytes(block).fill(BlockHeader::FREE_PATTERN);
        }
    }
}

extra_only! {
    pub(crate) fn assert_is_poisoned_with_free_pattern(block: *mut BlockHeader) {
        unsafe {
            assert!(
                BlockHeader::payload_bytes(block)
                    .iter()
                    .all(|byte| *byte == BlockHeader::FREE_PATTERN),
                "free block at {:p} was written to after being freed",
                block
            );
        }
    }
}

#[test]
fn header_layout() {
    assert_eq!(
        HEADER_SIZE.0,
        mem::size_of::<usize>() + mem::size_of::<*mut u8>(),
        "a header is exactly a size word and a link"
    );
    assert_eq!(HEADER_SIZE.0 % ALIGNMENT.0, 0);
}

#[test]
fn align_up_rounds_to_the_alignment_unit() {
    assert_eq!(align_up(Bytes(0)), Some(Bytes(0)));
    for size in 1..=8 {
        assert_eq!(align_up(Bytes(size)), Some(Bytes(8)));
    }
    assert_eq!(align_up(Bytes(9)), Some(Bytes(16)));
    assert_eq!(align_up(Bytes(9000)), Some(Bytes(9000)));
    assert_eq!(align_up(Bytes(9001)), Some(Bytes(9008)));
    assert_eq!(align_up(Bytes(usize::MAX)), None);
}

#[test]
fn total_size_adds_one_header() {
    assert_eq!(total_size_for(Bytes(16)), Some(HEADER_SIZE + Bytes(16)));
    assert_eq!(total_size_for(Bytes(0)), Some(HEADER_SIZE));
    assert_eq!(total_size_for(Bytes(usize::MAX - 3)), None);
}

#[test]
fn split_carves_a_trailing_block() {
    #[repr(align(8))]
    struct Buf([u8; 256]);
    let mut buf = Buf([0; 256]);

    unsafe {
        let block = BlockHeader::write(buf.0.as_mut_ptr(), Bytes(256));
        let sentinel = 0x1000 as *mut BlockHeader;
        (*block).set_next_free(sentinel);

        let first = HEADER_SIZE + Bytes(24);
        let rest = BlockHeader::split(block, first);

        assert_eq!((*block).size(), first);
        assert_eq!((*rest).size(), Bytes(256) - first);
        assert_eq!(rest as usize, (*block).end());
        assert_eq!((*rest).next_free(), sentinel);
        assert_eq!(BlockHeader::from_payload(BlockHeader::payload(rest)), rest);
    }
}

#[test]
#[cfg(feature = "extra_assertions")]
fn free_pattern_covers_the_whole_payload() {
    #[repr(align(8))]
    struct Buf([u8; 128]);
    let mut buf = Buf([0; 128]);

    unsafe {
        let block = BlockHeader::write(buf.0.as_mut_ptr(), Bytes(96));
        write_free_pattern(block);
        assert_is_poisoned_with_free_pattern(block);
    }
    assert!(buf.0[HEADER_SIZE.0..96]
        .iter()
        .all(|b| *b == BlockHeader::FREE_PATTERN));
    assert!(buf.0[96..].iter().all(|b| *b == 0));
}
