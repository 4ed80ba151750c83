//! The process-wide heap.
//!
//! One [`Heap`] over an [`MmapSegment`], set up once by [`init`] and shared
//! by everything in the process. Calls are serialized with a spin lock; the
//! heap itself is single-threaded.
//!
//! Using the heap before [`init`], or calling [`init`] twice, panics.

use core::ptr::NonNull;

use spin::Mutex;

use crate::check::Coherence;
use crate::config::{HeapConfig, Policy};
use crate::heap::{Heap, HeapStats};
use crate::unix::MmapSegment;

/// Address space reserved for the process-wide heap. Only the part below the
/// break is ever touched.
pub const SEGMENT_CAPACITY: usize = 256 << 20;

static HEAP: Mutex<Option<Heap<MmapSegment>>> = Mutex::new(None);

/// Set up the process-wide heap with the given tracking policy and default
/// tunables.
///
/// # Panics
///
/// Panics if the heap is already initialized, or if the address space for
/// it cannot be reserved.
pub fn init(policy: Policy) {
    init_with(HeapConfig::default().with_policy(policy))
}

/// Set up the process-wide heap.
///
/// # Panics
///
/// See [`init`].
pub fn init_with(config: HeapConfig) {
    let mut heap = HEAP.lock();
    if heap.is_some() {
        panic!("heap already initialized");
    }

    let segment = match MmapSegment::reserve(SEGMENT_CAPACITY) {
        Ok(segment) => segment,
        Err(err) => panic!("Data segment not initialized: {}", err),
    };
    *heap = Some(Heap::init(segment, config));
}

pub fn is_initialized() -> bool {
    HEAP.lock().is_some()
}

fn with_heap<R>(f: impl FnOnce(&mut Heap<MmapSegment>) -> R) -> R {
    let mut heap = HEAP.lock();
    match heap.as_mut() {
        Some(heap) => f(heap),
        None => panic!("heap used before init"),
    }
}

pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.allocate(size))
}

pub fn zero_allocate(count: usize, size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.zero_allocate(count, size))
}

pub fn reallocate(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.reallocate(ptr, size))
}

pub fn free(ptr: NonNull<u8>) {
    with_heap(|heap| heap.free(ptr))
}

pub fn usable_size(ptr: NonNull<u8>) -> usize {
    with_heap(|heap| heap.usable_size(ptr))
}

pub fn set_log_level(level: u8) {
    with_heap(|heap| heap.set_log_level(level))
}

/// Run the consistency checker; `true` if the heap is coherent.
pub fn check() -> bool {
    coherence().is_coherent()
}

/// Run the consistency checker and return everything it found.
pub fn coherence() -> Coherence {
    with_heap(|heap| heap.check())
}

pub fn stats() -> HeapStats {
    with_heap(|heap| heap.stats())
}
