//! This is a very minimal example to show a heap growing over an mmap
//! segment.

use boundary_alloc::{Heap, HeapConfig, MmapSegment, Policy, SegmentProvider};

fn main() {
    env_logger::init();

    let mut segment = MmapSegment::reserve(1 << 20).expect("could not reserve address space");
    println!(
        "Reserved {} bytes, page size {}",
        segment.capacity(),
        segment.page_size()
    );
    let (start, _) = segment.bounds();
    let old = unsafe { segment.grow(8).expect("could not grow the segment") };
    println!("Grew at {:p} (start {:p}), now {} bytes", old, start, segment.len());
    unsafe { segment.shrink(segment.len()).expect("could not shrink the segment") };

    let mut heap = Heap::init(
        segment,
        HeapConfig::default()
            .with_policy(Policy::Explicit)
            .with_chunk_size(4096)
            .with_log_level(1),
    );
    let ptr = heap.allocate(64 * 1024).expect("out of memory");
    println!(
        "Allocated {} bytes at {:p}; the segment grew {} times",
        heap.usable_size(ptr),
        ptr,
        heap.segment().growths()
    );
    heap.free(ptr);
    println!("{}", heap.report());
    assert!(heap.check().is_coherent());
}
