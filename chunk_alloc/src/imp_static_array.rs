use super::{Heap, OutOfMemory};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use memory_units::Bytes;
use spin::Mutex;

const SCRATCH_LEN_BYTES: usize = include!(concat!(
    env!("OUT_DIR"),
    "/chunk_alloc_static_array_backend_size_bytes.txt"
));

#[repr(C, align(16))]
struct Scratch(UnsafeCell<[u8; SCRATCH_LEN_BYTES]>);

// Every byte of the scratch space is handed out at most once, under `OFFSET`.
unsafe impl Sync for Scratch {}

static SCRATCH_HEAP: Scratch = Scratch(UnsafeCell::new([0; SCRATCH_LEN_BYTES]));
static OFFSET: Mutex<usize> = Mutex::new(0);

/// Hands out memory from one fixed-size static array shared by the whole
/// process.
///
/// The size is fixed at build time by the
/// `CHUNK_ALLOC_STATIC_ARRAY_BACKEND_BYTES` environment variable (32 MiB by
/// default).
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticArray;

impl StaticArray {
    /// The number of scratch bytes not handed out yet.
    pub fn remaining() -> Bytes {
        Bytes(SCRATCH_LEN_BYTES - *OFFSET.lock())
    }
}

unsafe impl Heap for StaticArray {
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory> {
        let oom = OutOfMemory { request: size };
        let mut offset = OFFSET.lock();
        let end = offset.checked_add(size.0).ok_or(oom)?;
        if end > SCRATCH_LEN_BYTES {
            return Err(oom);
        }
        let ptr = unsafe { (SCRATCH_HEAP.0.get() as *mut u8).add(*offset) };
        *offset = end;
        NonNull::new(ptr).ok_or(oom)
    }
}
