use super::{Allocator, Heap, ALIGNMENT};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use spin::{Mutex, MutexGuard};

/// An [`Allocator`] behind a spin lock, usable as the `#[global_allocator]`.
///
/// Every operation takes the one lock, so allocation is serialized across
/// threads.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: chunk_alloc::LockedAllocator<chunk_alloc::Sbrk> =
///     chunk_alloc::LockedAllocator::new(chunk_alloc::Sbrk);
/// ```
pub struct LockedAllocator<H> {
    inner: Mutex<Allocator<H>>,
}

impl<H: Heap> LockedAllocator<H> {
    /// Wrap a fresh allocator over `heap`.
    pub const fn new(heap: H) -> Self {
        LockedAllocator {
            inner: Mutex::new(Allocator::new(heap)),
        }
    }

    /// Get exclusive access to the inner allocator, e.g. to run
    /// [`Allocator::coalesce`] or inspect its free list.
    ///
    /// Allocating through the global allocator while holding the guard
    /// deadlocks.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Allocator<H>> {
        self.inner.lock()
    }
}

unsafe impl<H: Heap + Send> GlobalAlloc for LockedAllocator<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are only ever aligned to the allocator's fixed unit.
        if layout.align() > ALIGNMENT.0 {
            return ptr::null_mut();
        }

        match self.inner.lock().allocate_or_coalesce(layout.size()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.inner.lock().deallocate(ptr);
        }
    }
}
