//! Free-space tracking.
//!
//! The allocator core only ever talks to a [`FreeSpace`]: it asks for a
//! best-fitting block, and tells the tracker when blocks start or stop being
//! free. Two implementations exist:
//!
//! - [`ImplicitScan`] keeps no state at all. The boundary tags already say
//!   which blocks are free, so a search walks every block in the heap.
//! - [`BlockList`] threads the free blocks on a doubly linked list stored in
//!   their own payloads, so a search only visits free blocks.
//!
//! Both choose the same block for the same heap: the smallest one that is
//! large enough, and among equals the one with the lowest address.

use crate::block::{Arena, Block};
use crate::blocklist::BlockList;
use crate::config::Policy;

pub trait FreeSpace {
    /// Find the best-fitting free block of at least `min_size` bytes.
    ///
    /// # Safety
    ///
    /// `arena` must describe a coherent heap that this tracker follows.
    unsafe fn find(&self, arena: Arena, min_size: usize) -> Option<Block>;

    /// Start tracking a block that has just become free.
    ///
    /// # Safety
    ///
    /// `block` must be formed, free, and not yet tracked.
    unsafe fn insert(&mut self, block: Block);

    /// Stop tracking a free block, right before it is allocated or merged
    /// away.
    ///
    /// # Safety
    ///
    /// `block` must be tracked and still carry its free tags.
    unsafe fn remove(&mut self, block: Block);

    /// Count the ways this tracker disagrees with the boundary tags, given
    /// the number of free blocks a physical walk found.
    ///
    /// # Safety
    ///
    /// `arena` must describe a heap whose block structure is intact.
    unsafe fn audit(&self, _arena: Arena, _free_blocks: usize) -> usize {
        0
    }
}

/// Best fit over `candidates`: smallest qualifying free block, lowest address
/// on ties. Allocated candidates are skipped.
pub(crate) unsafe fn best_fit<I>(candidates: I, min_size: usize) -> Option<Block>
where
    I: IntoIterator<Item = Block>,
{
    let mut best: Option<(usize, Block)> = None;
    for block in candidates {
        let tag = block.header();
        if !tag.is_free() || tag.size() < min_size {
            continue;
        }
        let better = match best {
            None => true,
            Some((size, chosen)) => tag.size() < size || (tag.size() == size && block < chosen),
        };
        if better {
            best = Some((tag.size(), block));
        }
    }

    best.map(|(_, block)| block)
}

/// The stateless tracker: every search is a scan of the whole heap.
#[derive(Default, Debug)]
pub struct ImplicitScan;

impl FreeSpace for ImplicitScan {
    unsafe fn find(&self, arena: Arena, min_size: usize) -> Option<Block> {
        best_fit(arena.blocks(), min_size)
    }

    unsafe fn insert(&mut self, _block: Block) {}

    unsafe fn remove(&mut self, _block: Block) {}
}

/// The tracker selected for a heap.
pub enum Tracker {
    Implicit(ImplicitScan),
    Explicit(BlockList),
}

impl Tracker {
    pub fn new(policy: Policy) -> Tracker {
        match policy {
            Policy::Implicit => Tracker::Implicit(ImplicitScan),
            Policy::Explicit => Tracker::Explicit(BlockList::default()),
        }
    }

    pub fn policy(&self) -> Policy {
        match self {
            Tracker::Implicit(_) => Policy::Implicit,
            Tracker::Explicit(_) => Policy::Explicit,
        }
    }

    /// The explicit free list, if that is what this heap keeps.
    pub fn free_list(&self) -> Option<&BlockList> {
        match self {
            Tracker::Implicit(_) => None,
            Tracker::Explicit(list) => Some(list),
        }
    }
}

impl FreeSpace for Tracker {
    unsafe fn find(&self, arena: Arena, min_size: usize) -> Option<Block> {
        match self {
            Tracker::Implicit(scan) => scan.find(arena, min_size),
            Tracker::Explicit(list) => list.find(arena, min_size),
        }
    }

    unsafe fn insert(&mut self, block: Block) {
        match self {
            Tracker::Implicit(scan) => scan.insert(block),
            Tracker::Explicit(list) => list.insert(block),
        }
    }

    unsafe fn remove(&mut self, block: Block) {
        match self {
            Tracker::Implicit(scan) => scan.remove(block),
            Tracker::Explicit(list) => list.remove(block),
        }
    }

    unsafe fn audit(&self, arena: Arena, free_blocks: usize) -> usize {
        match self {
            Tracker::Implicit(scan) => scan.audit(arena, free_blocks),
            Tracker::Explicit(list) => list.audit(arena, free_blocks),
        }
    }
}
