#![no_std]

//! A boundary-tag heap manager.
//!
//! A [`Heap`] carves one contiguous segment of memory into blocks, each
//! framed by a header and a footer tag holding its size and status. Free
//! blocks are found best fit, either by scanning every block
//! ([`Policy::Implicit`]) or from an explicit doubly linked free list
//! ([`Policy::Explicit`]); freed blocks are merged with their free neighbours
//! straight away. The segment comes from a [`SegmentProvider`]: a borrowed
//! buffer ([`ToyHeap`]), an anonymous memory mapping ([`MmapSegment`]), or
//! anything else with a movable break.
//!
//! With the `use_libc` feature (on by default), [`global`] offers one
//! process-wide heap over an `MmapSegment`.

#[cfg(test)]
#[macro_use]
extern crate std;

// Log through `log`, but only at or below the heap's own verbosity.
macro_rules! heap_log {
    ($heap:expr, $level:expr, $($arg:tt)+) => {
        if $level <= $heap.verbosity {
            log::log!($level, $($arg)+);
        }
    };
}

pub mod block;
pub mod blocklist;
pub mod check;
pub mod config;
#[cfg(feature = "use_libc")]
pub mod global;
pub mod heap;
pub mod segment;
pub mod tracker;
#[cfg(feature = "use_libc")]
pub mod unix;

pub use crate::block::{Status, MIN_BLOCK_SIZE};
pub use crate::check::{Coherence, HeapReport};
pub use crate::config::{HeapConfig, Policy};
pub use crate::heap::{AllocError, BlockInfo, Heap, HeapStats};
pub use crate::segment::{Segment, SegmentProvider, ToyHeap};
#[cfg(feature = "use_libc")]
pub use crate::unix::MmapSegment;
