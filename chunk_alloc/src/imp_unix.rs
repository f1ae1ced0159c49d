use super::{Heap, OutOfMemory, ALIGNMENT};
use core::ptr::{self, NonNull};
use memory_units::{Bytes, Pages, RoundUpTo};

fn sbrk(increment: usize) -> Option<*mut u8> {
    let increment = libc::intptr_t::try_from(increment).ok()?;
    let addr = unsafe { libc::sbrk(increment) };
    if addr as usize == usize::MAX {
        None
    } else {
        Some(addr as *mut u8)
    }
}

/// Grows the process's data segment with `sbrk(2)`.
///
/// The program break is process-wide, so there should only ever be one
/// allocator using this heap, and nothing else should be moving the break
/// underneath it in a way that matters to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sbrk;

unsafe impl Heap for Sbrk {
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory> {
        let oom = OutOfMemory { request: size };

        // Someone else may have left the break misaligned.
        let brk = sbrk(0).ok_or(oom)? as usize;
        let misalignment = brk % ALIGNMENT.0;
        if misalignment != 0 {
            sbrk(ALIGNMENT.0 - misalignment).ok_or(oom)?;
        }

        let addr = sbrk(size.0).ok_or(oom)?;
        extra_assert_eq!(addr as usize % ALIGNMENT.0, 0);
        NonNull::new(addr).ok_or(oom)
    }
}

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE;

/// A fixed-capacity region reserved with a single `mmap(2)`, grown by moving
/// a private break through it.
///
/// Every region is an independent heap, which makes it possible to run any
/// number of allocators side by side. The mapping is released when the region
/// is dropped, so it must outlive every block carved from it.
#[derive(Debug)]
pub struct MmapRegion {
    base: *mut u8,
    brk: Bytes,
    capacity: Bytes,
}

// The region is exclusively owned; its memory is not tied to a thread.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Reserve a region of at least `capacity` bytes, rounded up to whole
    /// target pages (`memory_units::Pages`).
    pub fn reserve(capacity: Bytes) -> Result<MmapRegion, OutOfMemory> {
        let mut region = MmapRegion::lazy(capacity);
        region.map()?;
        Ok(region)
    }

    /// A region that is only mapped on its first `grow`, so that it can
    /// initialize a `static`.
    pub const fn lazy(capacity: Bytes) -> MmapRegion {
        MmapRegion {
            base: ptr::null_mut(),
            brk: Bytes(0),
            capacity,
        }
    }

    fn map(&mut self) -> Result<(), OutOfMemory> {
        let oom = OutOfMemory {
            request: self.capacity,
        };
        let pages: Pages = self.capacity.round_up_to();
        let capacity: Bytes = pages.into();
        if capacity.0 == 0 {
            return Err(oom);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity.0,
                libc::PROT_WRITE | libc::PROT_READ,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED || addr.is_null() {
            return Err(oom);
        }

        self.base = addr as *mut u8;
        self.capacity = capacity;
        Ok(())
    }

    /// The number of bytes handed out so far.
    pub fn used(&self) -> Bytes {
        self.brk
    }

    /// The total number of bytes this region can hand out.
    pub fn capacity(&self) -> Bytes {
        self.capacity
    }

    /// Whether `ptr` lies inside the part of the region handed out so far.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base as usize;
        let addr = ptr as usize;
        !self.base.is_null() && start <= addr && addr < start + self.brk.0
    }
}

unsafe impl Heap for MmapRegion {
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory> {
        if self.base.is_null() {
            self.map()?;
        }
        if size > self.capacity - self.brk {
            return Err(OutOfMemory { request: size });
        }
        let addr = unsafe { self.base.add(self.brk.0) };
        self.brk = self.brk + size;
        extra_assert_eq!(addr as usize % ALIGNMENT.0, 0);
        Ok(unsafe { NonNull::new_unchecked(addr) })
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        let code = unsafe { libc::munmap(self.base as *mut libc::c_void, self.capacity.0) };
        extra_assert_eq!(code, 0, "munmap should run OK");
    }
}

#[cfg(test)]
fn page() -> Bytes {
    Pages(1).into()
}

#[test]
fn sbrk_grows_aligned_and_upwards() {
    let mut heap = Sbrk;
    let a = heap.grow(Bytes(24)).unwrap();
    let b = heap.grow(Bytes(40)).unwrap();
    assert_eq!(a.as_ptr() as usize % ALIGNMENT.0, 0);
    assert_eq!(b.as_ptr() as usize % ALIGNMENT.0, 0);
    // Other threads may move the break in between, but never backwards.
    assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 24);
}

#[test]
fn region_grows_contiguously_until_exhausted() {
    let mut region = MmapRegion::reserve(Bytes(1)).unwrap();
    assert_eq!(region.capacity(), page());

    let mut region = MmapRegion::reserve(Bytes(65536)).unwrap();
    assert_eq!(region.capacity(), Bytes(65536));

    let a = region.grow(Bytes(8192)).unwrap();
    let b = region.grow(Bytes(24)).unwrap();
    assert_eq!(a.as_ptr() as usize + 8192, b.as_ptr() as usize);
    assert!(region.contains(b.as_ptr()));
    assert_eq!(region.used(), Bytes(8216));

    let rest = region.capacity() - region.used();
    assert_eq!(
        region.grow(rest + Bytes(8)),
        Err(OutOfMemory {
            request: rest + Bytes(8)
        })
    );
    assert!(region.grow(rest).is_ok());
    assert!(region.grow(Bytes(8)).is_err());
}

#[test]
fn regions_are_independent() {
    let mut one = MmapRegion::reserve(Bytes(65536)).unwrap();
    let mut two = MmapRegion::reserve(Bytes(65536)).unwrap();
    let a = one.grow(Bytes(64)).unwrap();
    let b = two.grow(Bytes(64)).unwrap();
    assert!(one.contains(a.as_ptr()));
    assert!(!one.contains(b.as_ptr()));
    assert!(two.contains(b.as_ptr()));
}

#[test]
fn lazy_region_maps_on_first_grow() {
    let mut region = MmapRegion::lazy(Bytes(100_000));
    assert_eq!(region.used(), Bytes(0));
    let a = region.grow(Bytes(64)).unwrap();
    assert!(region.contains(a.as_ptr()));

    let capacity = region.capacity().0;
    assert_eq!(capacity % page().0, 0);
    assert!(capacity >= 100_000 && capacity < 100_000 + page().0);
}
