// Adopted from
// https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/global.rs

extern crate chunk_alloc;
extern crate memory_units;

use chunk_alloc::{LockedAllocator, MmapRegion, ALIGNMENT};
use memory_units::Bytes;
use std::alloc::{GlobalAlloc, Layout};
use std::collections::HashMap;
use std::thread;

#[global_allocator]
static A: LockedAllocator<MmapRegion> = LockedAllocator::new(MmapRegion::lazy(Bytes(256 << 20)));

#[test]
fn foo() {
    println!("hello");
}

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    drop(m);
}

#[test]
fn strings() {
    format!("foo, bar, {}", "baz");
}

#[test]
fn threads() {
    assert!(thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn many_threads_share_the_heap() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let v: Vec<Vec<u64>> = (0..200).map(|j| vec![i * j; (j % 50) as usize]).collect();
                v.iter().map(|inner| inner.len()).sum::<usize>()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
}

#[test]
fn boxes_are_word_aligned() {
    for size in [1usize, 3, 8, 13, 100, 9000] {
        let b = vec![7u8; size].into_boxed_slice();
        assert_eq!(b.as_ptr() as usize % ALIGNMENT.0, 0);
        assert!(b.iter().all(|x| *x == 7));
    }
}

#[test]
fn larger_than_word_alignment_is_refused() {
    unsafe {
        let layout = Layout::from_size_align(16, 32).unwrap();
        assert!(A.alloc(layout).is_null());
    }
}

#[test]
fn coalescing_the_global_heap() {
    let blocks: Vec<Box<[u8; 64]>> = (0..64).map(|_| Box::new([1; 64])).collect();
    drop(blocks);

    // Nothing may allocate while the lock is held.
    let (before, after, conserved) = {
        let mut a = A.lock();
        let before = a.free_blocks().count();
        a.coalesce();
        let stats = a.stats();
        (before, stats.free_blocks, stats.free_bytes <= a.heap_size())
    };
    assert!(after <= before);
    assert!(conserved);
}
