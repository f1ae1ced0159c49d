/*!

`chunk_alloc`: a first-fit, address-ordered free list allocator that carves
blocks out of a heap that only ever grows.

- **Small and explicit:** every block carries one fixed header (its size and a
  free-list link). There are no size classes, no per-block tags and no
  background work.

- **Explicit defragmentation:** freeing a block never merges it with its
  neighbors. Adjacent free blocks are merged only when you call
  [`Allocator::coalesce`].

- **Pluggable heap growth:** the memory comes from any [`Heap`]. `sbrk` on
  unix, a private `mmap` reservation per allocator, WebAssembly linear memory,
  or a fixed static array.

- [Using `chunk_alloc` directly](#using-chunk_alloc-directly)
- [Using `chunk_alloc` as the Global Allocator](#using-chunk_alloc-as-the-global-allocator)
- [`cargo` Features](#cargo-features)
- [Implementation Notes and Constraints](#implementation-notes-and-constraints)

## Using `chunk_alloc` directly

```ignore
use chunk_alloc::{Allocator, MmapRegion};
use memory_units::Bytes;

let region = MmapRegion::reserve(Bytes(1 << 20))?;
let mut alloc = Allocator::new(region);

let a = alloc.allocate(16)?;
let b = alloc.allocate(16)?;
unsafe {
    alloc.deallocate(a);
    alloc.deallocate(b);
}
alloc.coalesce();

for block in alloc.free_blocks() {
    println!("{:?}", block);
}
```

## Using `chunk_alloc` as the Global Allocator

```ignore
#[global_allocator]
static ALLOC: chunk_alloc::LockedAllocator<chunk_alloc::Sbrk> =
    chunk_alloc::LockedAllocator::new(chunk_alloc::Sbrk);
```

The [`LockedAllocator`] takes one spin lock around every call. On
`OutOfMemory` it coalesces the free list and tries once more before handing
back null. Layouts aligned to more than [`ALIGNMENT`] are refused.

## `cargo` Features

- **extra_assertions**: Enable various extra, expensive integrity assertions and
  defensive mechanisms, such as poisoning freed memory, checking the free list
  after every mutation and catching double frees. This incurs a large runtime
  overhead. It is useful when debugging a use-after-free or `chunk_alloc`
  itself.

- **static_array_backend**: Make [`DefaultHeap`] a fixed-size static array
  instead of the target's native heap. Its size comes from the
  `CHUNK_ALLOC_STATIC_ARRAY_BACKEND_BYTES` environment variable at build time.

## Implementation Notes and Constraints

- Every block starts with a [`HEADER_SIZE`]-byte header. Payloads are rounded
  up to a multiple of [`ALIGNMENT`].

- Requests whose block (header included) fits in [`CHUNK_SIZE`] are carved
  out of a `CHUNK_SIZE` chunk grown from the heap; the rest of the chunk goes
  onto the free list. Larger requests get a region of exactly their size,
  which only reaches the free list once it is freed.

- Allocation is first-fit over a list sorted by address, so it is *O(n)*.
  Freeing is *O(n)* too, since it has to find the block's place in that
  order.

- When the first fitting block has more than one header's worth of slack,
  it is split and the tail stays free. Otherwise the whole block is handed
  out.

- Memory is never returned to the heap, and the heap never returns it to the
  operating system.

- An `Allocator` is not thread-safe. Wrap it in a [`LockedAllocator`] to share
  it.

*/

#![deny(missing_docs)]
#![cfg_attr(
    not(any(test, feature = "use_std_for_test_debugging")),
    no_std
)]

#[cfg(all(unix, not(target_arch = "wasm32")))]
extern crate libc;

extern crate memory_units;

#[macro_use]
extern crate cfg_if;

#[macro_use]
mod extra_assert;

mod block;
mod free_list;
mod global;
mod heap;

cfg_if! {
    if #[cfg(target_arch = "wasm32")] {
        mod imp_wasm32;
        pub use imp_wasm32::WasmMemory;
    } else if #[cfg(unix)] {
        mod imp_unix;
        pub use imp_unix::{MmapRegion, Sbrk};
    }
}

#[cfg(feature = "static_array_backend")]
mod imp_static_array;
#[cfg(feature = "static_array_backend")]
pub use imp_static_array::StaticArray;

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        /// The heap backend used when nothing more specific is asked for.
        pub type DefaultHeap = StaticArray;

        /// Construct the [`DefaultHeap`].
        pub const fn default_heap() -> DefaultHeap {
            StaticArray
        }
    } else if #[cfg(target_arch = "wasm32")] {
        /// The heap backend used when nothing more specific is asked for.
        pub type DefaultHeap = WasmMemory;

        /// Construct the [`DefaultHeap`].
        pub const fn default_heap() -> DefaultHeap {
            WasmMemory::new()
        }
    } else if #[cfg(unix)] {
        /// The heap backend used when nothing more specific is asked for.
        pub type DefaultHeap = Sbrk;

        /// Construct the [`DefaultHeap`].
        pub const fn default_heap() -> DefaultHeap {
            Sbrk
        }
    } else {
        compile_error! {
            "There is no `chunk_alloc` heap for this target; enable the `static_array_backend` feature"
        }
    }
}

pub use block::{ALIGNMENT, CHUNK_SIZE, HEADER_SIZE};
pub use free_list::{FreeBlock, FreeBlocks};
pub use global::LockedAllocator;
pub use heap::Heap;

use block::{assert_is_poisoned_with_free_pattern, write_free_pattern, BlockHeader};
use core::fmt;
use core::ptr::NonNull;
use free_list::FreeList;
use memory_units::Bytes;

/// The heap could not grow to satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory {
    /// The number of bytes that were asked for.
    pub request: Bytes,
}

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory: could not grow the heap by {} bytes", self.request.0)
    }
}

impl core::error::Error for OutOfMemory {}

/// A snapshot of an allocator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the heap so far.
    pub heap_size: Bytes,
    /// Bytes sitting on the free list, headers included.
    pub free_bytes: Bytes,
    /// Number of blocks on the free list.
    pub free_blocks: usize,
    /// Size of the largest free block, header included.
    pub largest_free: Bytes,
}

/// A first-fit free list allocator over the heap `H`.
///
/// The allocator owns the head of its free list and the heap it grows. It is
/// not thread-safe; see [`LockedAllocator`].
pub struct Allocator<H> {
    heap: H,
    free: FreeList,
    heap_size: Bytes,
}

// The allocator exclusively owns every block it links; nothing is tied to the
// creating thread.
unsafe impl<H: Send> Send for Allocator<H> {}

impl<H: Heap> Allocator<H> {
    /// An allocator with an empty free list that has not grown `heap` yet.
    pub const fn new(heap: H) -> Self {
        Allocator {
            heap,
            free: FreeList::new(),
            heap_size: Bytes(0),
        }
    }

    /// Allocate a payload of at least `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Zero-byte requests get a header-only block and a unique pointer.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let total = block::total_size_for(Bytes(size)).ok_or(OutOfMemory {
            request: Bytes(size),
        })?;

        unsafe {
            let block = match self.free.first_fit(total) {
                Some(block) => self.take_free_block(block, total),
                None => self.grow_for(total)?,
            };
            extra_assert!((*block).size() >= total);
            Ok(BlockHeader::payload(block))
        }
    }

    /// Like [`allocate`](Allocator::allocate), but on `OutOfMemory` coalesce
    /// the free list and try exactly once more.
    pub fn allocate_or_coalesce(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.allocate(size).or_else(|_| {
            self.coalesce();
            self.allocate(size)
        })
    }

    /// Return a payload to the free list.
    ///
    /// Nothing is merged; see [`coalesce`](Allocator::coalesce). Freeing the
    /// block that currently heads the free list a second time is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](Allocator::allocate) on this
    /// allocator and must not have been freed since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = BlockHeader::from_payload(ptr);
        self.release(block);
    }

    /// Merge every pair of free blocks that are adjacent in memory.
    pub fn coalesce(&mut self) {
        unsafe { self.free.coalesce() }
    }

    /// The free block at the lowest address, if any.
    pub fn free_list_begin(&self) -> Option<FreeBlock<'_>> {
        FreeBlock::first(&self.free)
    }

    /// The free block after `block` in address order, if any.
    pub fn free_list_next<'a>(&'a self, block: FreeBlock<'a>) -> Option<FreeBlock<'a>> {
        block.next()
    }

    /// Iterate over the free list in ascending address order.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        self.free.iter()
    }

    /// The number of bytes grown from the heap so far.
    pub fn heap_size(&self) -> Bytes {
        self.heap_size
    }

    /// The total size, header included, of the live block behind `ptr`.
    ///
    /// The payload can hold `block_size(ptr) - HEADER_SIZE` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> Bytes {
        (*BlockHeader::from_payload(ptr)).size()
    }

    /// Summarize the heap and the free list.
    pub fn stats(&self) -> Stats {
        self.free_blocks().fold(
            Stats {
                heap_size: self.heap_size,
                free_bytes: Bytes(0),
                free_blocks: 0,
                largest_free: Bytes(0),
            },
            |mut stats, block| {
                stats.free_bytes = stats.free_bytes + block.size();
                stats.free_blocks += 1;
                if block.size() > stats.largest_free {
                    stats.largest_free = block.size();
                }
                stats
            },
        )
    }

    /// The heap this allocator grows.
    pub fn heap(&self) -> &H {
        &self.heap
    }

    // Hand out `block`, found on the free list, for a request of `total`
    // bytes. Its tail stays free if it is bigger than a header.
    unsafe fn take_free_block(&mut self, block: *mut BlockHeader, total: Bytes) -> *mut BlockHeader {
        assert_is_poisoned_with_free_pattern(block);

        if (*block).size() - total > HEADER_SIZE {
            let remainder = BlockHeader::split(block, total);
            self.free.replace(block, remainder);
        } else {
            self.free.remove(block);
        }
        block
    }

    unsafe fn grow_for(&mut self, total: Bytes) -> Result<*mut BlockHeader, OutOfMemory> {
        if total > CHUNK_SIZE {
            return self.grow(total);
        }

        let chunk = self.grow(CHUNK_SIZE)?;
        if CHUNK_SIZE - total > HEADER_SIZE {
            let remainder = BlockHeader::split(chunk, total);
            self.release(remainder);
        }
        Ok(chunk)
    }

    unsafe fn grow(&mut self, size: Bytes) -> Result<*mut BlockHeader, OutOfMemory> {
        let raw = self.heap.grow(size)?;
        self.heap_size = self.heap_size + size;
        Ok(BlockHeader::write(raw.as_ptr(), size))
    }

    unsafe fn release(&mut self, block: *mut BlockHeader) {
        // The only double free caught without `extra_assertions`.
        if block == self.free.head() {
            extra_assert!(false, "double free of the block at {:p}", block);
            return;
        }
        write_free_pattern(block);
        self.free.insert(block);
    }
}

impl<H> fmt::Debug for Allocator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("heap_size", &self.heap_size.0)
            .field("free", &DebugFreeList(&self.free))
            .finish()
    }
}

struct DebugFreeList<'a>(&'a FreeList);

impl fmt::Debug for DebugFreeList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}
