//! The consistency checker.
//!
//! The checker walks the heap through its boundary tags alone, so it works
//! the same whichever tracker is in use. A header that disagrees with its
//! footer means the heap's metadata has been overwritten, and the checker
//! panics rather than report it. Everything else it finds is counted in a
//! [`Coherence`].

use core::fmt;
use core::ptr::NonNull;

use log::Level;

use crate::block::{Block, Tag, MIN_BLOCK_SIZE, WORD};
use crate::heap::Heap;
use crate::segment::SegmentProvider;
use crate::tracker::FreeSpace;

/// Coherence contains a representation of all invalid states found in a
/// heap walk.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Coherence {
    /// Number of sentinels that are not a zero-sized allocated tag.
    pub bad_sentinels: usize,

    /// Number of blocks whose size is zero or not a multiple of the block
    /// granularity.
    ///
    /// A zero-sized block stops the walk, so this may undercount.
    pub misaligned: usize,

    /// Number of free blocks directly following another free block. This
    /// shouldn't happen, but isn't corrupt.
    pub uncoalesced: usize,

    /// The walk did not land exactly on the end sentinel.
    pub overrun: bool,
}

impl Coherence {
    /// Returns a boolean - a simple check if nothing was found
    pub fn is_coherent(&self) -> bool {
        self.bad_sentinels == 0 && self.misaligned == 0 && self.uncoalesced == 0 && !self.overrun
    }
}

impl From<Coherence> for bool {
    fn from(c: Coherence) -> bool {
        c.is_coherent()
    }
}

impl<P: SegmentProvider> Heap<P> {
    /// Walk the heap and verify its block structure.
    ///
    /// # Panics
    ///
    /// Panics if a block's footer disagrees with its header, or if the
    /// explicit free list disagrees with the boundary tags.
    pub fn check(&self) -> Coherence {
        let mut coherence = Coherence::default();
        let start = self.arena.start.as_ptr();
        let end = self.arena.end.as_ptr();

        unsafe {
            if Tag::read(self.arena.initial_sentinel()) != Tag::SENTINEL {
                coherence.bad_sentinels += 1;
            }
            if Tag::read(end) != Tag::SENTINEL {
                coherence.bad_sentinels += 1;
            }
        }

        let mut cursor = start;
        let mut free_blocks = 0;
        let mut previous_free = false;
        while cursor < end {
            let header = unsafe { Tag::read(cursor) };
            let size = header.size();
            if size == 0 {
                coherence.misaligned += 1;
                break;
            }
            if size % MIN_BLOCK_SIZE != 0 {
                coherence.misaligned += 1;
            }
            if size > end as usize - cursor as usize {
                break;
            }

            let footer = unsafe { Tag::read(cursor.add(size - WORD)) };
            if footer != header {
                log::error!("{}", self.report());
                panic!(
                    "heap corruption: block {:p} has header {:?} but footer {:?}",
                    cursor, header, footer
                );
            }

            if header.is_free() {
                free_blocks += 1;
                if previous_free {
                    coherence.uncoalesced += 1;
                }
            }
            previous_free = header.is_free();
            cursor = cursor.wrapping_add(size);
        }
        coherence.overrun = cursor != end;

        // The free list can only be held against a complete walk.
        if cursor == end {
            let issues = unsafe { self.tracker.audit(self.arena, free_blocks) };
            if issues > 0 {
                log::error!("{}", self.report());
                panic!(
                    "heap corruption: free list disagrees with the heap in {} places",
                    issues
                );
            }
        }

        heap_log!(self, Level::Debug, "{}", self.report());
        if coherence.is_coherent() {
            heap_log!(self, Level::Info, "Block structure coherent.");
        } else {
            heap_log!(self, Level::Warn, "Block structure incoherent: {:?}", coherence);
        }
        coherence
    }

    /// A table of the heap's blocks, for people.
    pub fn report(&self) -> HeapReport<'_, P> {
        HeapReport { heap: self }
    }
}

/// The display form of a heap, returned by [`Heap::report`].
pub struct HeapReport<'a, P> {
    heap: &'a Heap<P>,
}

struct Link(Option<Block>);

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(block) => write!(f, "{:<14?}", block),
            None => f.pad("-"),
        }
    }
}

impl<P: SegmentProvider> fmt::Display for HeapReport<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;
        let arena = heap.arena;
        let start = arena.start.as_ptr();
        let end = arena.end.as_ptr();
        let explicit = heap.tracker.free_list().is_some();

        writeln!(f, "---------------------------------- heap report ----------------------------------")?;
        writeln!(f, "  segment start:      {:p}", heap.segment.start())?;
        writeln!(f, "  segment break:      {:p}", heap.segment.brk())?;
        writeln!(f, "  heap start:         {:p}", start)?;
        writeln!(f, "  heap end:           {:p}", end)?;
        writeln!(f, "  free list policy:   {}", heap.policy())?;
        writeln!(f)?;

        let (first, last) = unsafe { (Tag::read(arena.initial_sentinel()), Tag::read(end)) };
        for (name, at, tag) in [
            ("initial sentinel", arena.initial_sentinel(), first),
            ("end sentinel", end, last),
        ] {
            writeln!(
                f,
                "  {:<18}  {:p}: size: {:#6x} ({:7}), status: {}",
                name,
                at,
                tag.size(),
                tag.size(),
                tag.status()
            )?;
        }
        writeln!(f)?;

        if explicit {
            writeln!(
                f,
                "    {:<14}  {:>8}  {:>10}  {:>10}  {:>8}  {:<14}  {:<14}  status",
                "address", "offset", "size (hex)", "size (dec)", "payload", "next", "prev"
            )?;
        } else {
            writeln!(
                f,
                "    {:<14}  {:>8}  {:>10}  {:>10}  {:>8}  status",
                "address", "offset", "size (hex)", "size (dec)", "payload"
            )?;
        }

        let mut cursor = start;
        while cursor < end {
            let header = unsafe { Tag::read(cursor) };
            let size = header.size();
            if size == 0 {
                writeln!(f, "    WARNING: size 0 detected, aborting traversal.")?;
                break;
            }
            if size > end as usize - cursor as usize {
                writeln!(
                    f,
                    "    WARNING: block at {:p} of size {:#x} overruns the heap end.",
                    cursor, size
                )?;
                break;
            }

            let offset = cursor as usize - start as usize;
            write!(
                f,
                "    {:<14?}  {:>#8x}  {:>#10x}  {:>10}  {:>8}  ",
                cursor,
                offset,
                size,
                size,
                size.saturating_sub(2 * WORD)
            )?;
            let footer = unsafe { Tag::read(cursor.add(size - WORD)) };
            if explicit {
                if header.is_free() && footer == header {
                    let links = unsafe { Block::from_header(NonNull::new_unchecked(cursor)).links() };
                    write!(f, "{:<14}  {:<14}  ", Link(links.next), Link(links.prev))?;
                } else {
                    write!(f, "{:<14}  {:<14}  ", "", "")?;
                }
            }
            writeln!(f, "{}", header.status())?;

            if footer != header {
                writeln!(
                    f,
                    "    --> ERROR: footer at {:p} with different properties: size: {:#x}, status: {}",
                    unsafe { cursor.add(size - WORD) },
                    footer.size(),
                    footer.status()
                )?;
            }
            cursor = cursor.wrapping_add(size);
        }

        writeln!(f)?;
        if cursor == end {
            writeln!(f, "  Block structure walked to the end.")?;
        }
        write!(f, "---------------------------------------------------------------------------------")
    }
}
