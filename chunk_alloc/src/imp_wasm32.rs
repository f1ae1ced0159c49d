use super::{Heap, OutOfMemory};
use core::arch::wasm32;
use core::ptr::NonNull;
use memory_units::{Bytes, Pages, RoundUpTo};

/// Grows WebAssembly linear memory a page at a time and hands out bytes from
/// a break inside the grown pages.
#[derive(Debug, Default)]
pub struct WasmMemory {
    brk: usize,
    end: usize,
}

impl WasmMemory {
    /// A heap that has not grown memory yet.
    pub const fn new() -> WasmMemory {
        WasmMemory { brk: 0, end: 0 }
    }
}

unsafe impl Heap for WasmMemory {
    fn grow(&mut self, size: Bytes) -> Result<NonNull<u8>, OutOfMemory> {
        let oom = OutOfMemory { request: size };

        while self.end - self.brk < size.0 {
            let missing = Bytes(size.0 - (self.end - self.brk));
            let pages: Pages = missing.round_up_to();
            let previous = wasm32::memory_grow(0, pages.0);
            if previous == usize::MAX {
                return Err(oom);
            }

            let start: Bytes = Pages(previous).into();
            // Somebody else grew memory since we last did; abandon our tail.
            if start.0 != self.end {
                self.brk = start.0;
            }
            let grown: Bytes = pages.into();
            self.end = start.0 + grown.0;
        }

        let addr = self.brk as *mut u8;
        self.brk += size.0;
        NonNull::new(addr).ok_or(oom)
    }
}
