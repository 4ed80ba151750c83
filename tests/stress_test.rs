use core::ptr::NonNull;

use boundary_alloc::{Heap, HeapConfig, Policy, SegmentProvider, ToyHeap};

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

const SLOTS: usize = 128;
const STEPS: usize = 1024 * 10;
// Header and footer of every block.
const TAGS: usize = 2 * core::mem::size_of::<usize>();

#[derive(Copy, Clone)]
struct Live {
    ptr: NonNull<u8>,
    len: usize,
    fill: u8,
}

unsafe fn write_pattern(live: Live) {
    for i in 0..live.len {
        *live.ptr.as_ptr().add(i) = live.fill.wrapping_add(i as u8);
    }
}

unsafe fn assert_pattern(live: Live, len: usize) {
    for i in 0..len {
        assert_eq!(
            *live.ptr.as_ptr().add(i),
            live.fill.wrapping_add(i as u8),
            "payload of {:p} changed at byte {}",
            live.ptr,
            i
        );
    }
}

fn validate<P: SegmentProvider>(heap: &Heap<P>, slots: &[Option<Live>]) {
    let coherence = heap.check();
    assert!(coherence.is_coherent(), "{:?}\n{}", coherence, heap.report());

    let stats = heap.stats();
    let live: Vec<Live> = slots.iter().flatten().copied().collect();
    assert_eq!(stats.allocated_blocks, live.len());
    let expected: usize = live.iter().map(|l| heap.usable_size(l.ptr) + TAGS).sum();
    assert_eq!(stats.allocated_bytes, expected);
    assert_eq!(stats.allocated_bytes + stats.free_bytes, stats.heap_bytes);
    log::debug!("Stats: {:?}", stats);
}

fn stress(config: HeapConfig) {
    let mut buf = vec![0u8; 4 << 20];
    let mut heap = Heap::init(ToyHeap::new(&mut buf), config);
    let mut slots: [Option<Live>; SLOTS] = [None; SLOTS];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = Uniform::new_inclusive(1usize, 40);

    for _ in 0..STEPS {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        let len = range.sample(&mut rng) * range.sample(&mut rng);
        let fill: u8 = rng.gen();

        match *chosen {
            None if rng.gen_bool(0.2) => {
                let count = range.sample(&mut rng);
                let size = len / count + 1;
                log::info!("Zero-allocating {} x {}", count, size);
                let ptr = heap.zero_allocate(count, size).unwrap();
                let zeroed = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), count * size) };
                assert!(zeroed.iter().all(|&b| b == 0));
                let live = Live {
                    ptr,
                    len: count * size,
                    fill,
                };
                unsafe { write_pattern(live) };
                *chosen = Some(live);
            }
            None => {
                log::info!("Allocating {}", len);
                let ptr = heap.allocate(len).unwrap();
                let live = Live { ptr, len, fill };
                unsafe { write_pattern(live) };
                *chosen = Some(live);
            }
            Some(live) if rng.gen_bool(0.3) => {
                log::info!("Reallocating {:p} from {} to {}", live.ptr, live.len, len);
                let ptr = heap.reallocate(Some(live.ptr), len).unwrap();
                let moved = Live { ptr, ..live };
                unsafe { assert_pattern(moved, live.len.min(len)) };
                let resized = Live { ptr, len, fill };
                unsafe { write_pattern(resized) };
                *chosen = Some(resized);
            }
            Some(live) => {
                log::info!("Freeing {:p} ({} bytes)", live.ptr, live.len);
                unsafe { assert_pattern(live, live.len) };
                heap.free(live.ptr);
                *chosen = None;
            }
        }

        validate(&heap, &slots);
    }

    for slot in slots.iter_mut() {
        if let Some(live) = slot.take() {
            unsafe { assert_pattern(live, live.len) };
            heap.free(live.ptr);
        }
    }
    validate(&heap, &slots);

    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, stats.heap_bytes);
}

#[test]
fn test_stress_implicit() {
    stress(
        HeapConfig::default()
            .with_policy(Policy::Implicit)
            .with_chunk_size(4096),
    );
}

#[test]
fn test_stress_explicit() {
    stress(
        HeapConfig::default()
            .with_policy(Policy::Explicit)
            .with_chunk_size(4096),
    );
}

#[test]
fn test_stress_shrinking() {
    for &policy in &[Policy::Implicit, Policy::Explicit] {
        stress(
            HeapConfig::default()
                .with_policy(policy)
                .with_chunk_size(4096)
                .with_shrink_threshold(2048),
        );
    }
}

// Page-aligned backing memory, so that two heaps get identical layouts.
#[derive(Copy, Clone)]
#[repr(C, align(64))]
struct Page([u8; 64]);

fn pages(count: usize) -> Vec<Page> {
    vec![Page([0; 64]); count]
}

fn as_bytes(pages: &mut [Page]) -> &mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(pages.as_mut_ptr() as *mut u8, pages.len() * 64) }
}

#[test]
fn test_policies_place_identically() {
    let (mut implicit_mem, mut explicit_mem) = (pages(16 * 1024), pages(16 * 1024));
    let config = HeapConfig::default().with_chunk_size(4096);
    let mut implicit = Heap::init(
        ToyHeap::new(as_bytes(&mut implicit_mem)),
        config.clone().with_policy(Policy::Implicit),
    );
    let mut explicit = Heap::init(
        ToyHeap::new(as_bytes(&mut explicit_mem)),
        config.with_policy(Policy::Explicit),
    );
    let offset = |heap: &Heap<ToyHeap<'_>>, ptr: NonNull<u8>| {
        ptr.as_ptr() as usize - heap.arena().start.as_ptr() as usize
    };

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = Uniform::new_inclusive(1usize, 32);
    let mut slots: [Option<(NonNull<u8>, NonNull<u8>)>; 64] = [None; 64];

    for _ in 0..4096 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        match *chosen {
            None => {
                let size = range.sample(&mut rng) * range.sample(&mut rng);
                let a = implicit.allocate(size).unwrap();
                let b = explicit.allocate(size).unwrap();
                assert_eq!(offset(&implicit, a), offset(&explicit, b));
                *chosen = Some((a, b));
            }
            Some((a, b)) => {
                implicit.free(a);
                explicit.free(b);
                *chosen = None;
            }
        }

        assert!(implicit.blocks().eq(explicit.blocks()));
    }
    assert!(implicit.check().is_coherent());
    assert!(explicit.check().is_coherent());
}
