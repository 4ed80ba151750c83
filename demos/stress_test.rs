//! An example program that drives the process-wide heap, creates and destroys
//! a large number of objects, and checks coherence along the way.

use core::ptr::NonNull;

use boundary_alloc::{global, HeapConfig, Policy};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// Minimum number of allocations before we start deallocating
const MIN_ALLOCATIONS: usize = 1024;
// Total number of allocations / deallocations
const ALLOCATIONS: usize = 64 * 1024;
// Log_2 of the maximum sized object to allocate
const LOG2_MAX_SIZE: usize = 12;

struct RandomObjects {
    allocated: Vec<(NonNull<u8>, usize)>,
    log2_max_size: usize,
}

impl RandomObjects {
    fn new(log2_max_size: usize) -> Self {
        let max = if log2_max_size < 8 { 8 } else { log2_max_size };

        RandomObjects {
            allocated: Vec::new(),
            log2_max_size: max,
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        let range = Uniform::new_inclusive(1usize, self.log2_max_size);
        let size = 1usize << range.sample(rng);
        let size = rng.gen_range(size / 2..=size);
        let ptr = match global::allocate(size) {
            Some(ptr) => ptr,
            None => panic!("Out of memory allocating {} bytes", size),
        };
        unsafe { ptr.as_ptr().write_bytes(size as u8, size) };
        self.allocated.push((ptr, size));
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let range = Uniform::new(0, self.allocated.len());
        let ix = range.sample(rng);
        let (ptr, size) = self.allocated.swap_remove(ix);

        let data = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(data.iter().all(|&b| b == size as u8));
        global::free(ptr);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!(
            "USAGE: {} [implicit|explicit] [ALLOCATIONS] [MIN_ALLOCATIONS] [LOG2_MAX_SIZE]",
            args[0]
        );
        return;
    }
    let policy: Policy = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    let mut allocations: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ALLOCATIONS);
    let min_allocations: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MIN_ALLOCATIONS);
    if allocations < min_allocations {
        allocations = min_allocations;
    }
    let log2_max_size: usize = args
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    env_logger::init();
    println!("Running Stress Test.\n\nParameters:");
    println!("    {} free list policy", policy);
    println!("    {} total allocations", allocations);
    println!(
        "    {} allocations before any deallocations",
        min_allocations
    );
    println!("    2^{} max allocated object size", log2_max_size);

    global::init_with(
        HeapConfig::default()
            .with_policy(policy)
            .with_shrink_threshold(boundary_alloc::config::DEFAULT_SHRINK_THRESHOLD),
    );

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = RandomObjects::new(log2_max_size);

    let mut allocation_run: isize = min_allocations as isize;

    for i in 1..=allocations {
        // Decide if we should allocate some new objects, or destroy an old one.
        while allocation_run == 0 {
            let mut max_allocations = objects.allocated.len();
            if max_allocations < min_allocations {
                max_allocations = min_allocations;
            }
            let max_deallocations = objects.allocated.len() as isize;
            let range = Uniform::new(-max_deallocations, max_allocations as isize);
            allocation_run = range.sample(&mut rng);
        }

        if allocation_run > 0 {
            objects.create(&mut rng);
            allocation_run -= 1;
        } else {
            objects.destroy(&mut rng);
            allocation_run += 1;
        }

        if i % 1024 == 0 {
            println!("Step {} / {}", i, allocations);
            let count = objects.allocated.len();
            let total_size: usize = objects.allocated.iter().map(|&(_, size)| size).sum();
            println!("    Allocated objects: {}, size: {}", count, total_size);
            println!("    Heap stats: {:?}", global::stats());
            println!("    Allocations in progress: {}", allocation_run);
            assert!(global::check());
        }
    }

    while !objects.allocated.is_empty() {
        objects.destroy(&mut rng);
    }

    println!("\nFinished.");
    println!("    Stats:    {:?}", global::stats());
    assert!(global::check());
}
