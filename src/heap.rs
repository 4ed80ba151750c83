//! The allocator core.
//!
//! A [`Heap`] owns one segment of memory and carves it into blocks framed by
//! boundary tags. Requests are served best fit from the free-space tracker,
//! large blocks are split at block granularity, and freed blocks are merged
//! with their free neighbours straight away. When nothing fits, the heap asks
//! its segment provider for more memory; optionally, it hands a large free
//! tail back.
//!
//! Violated invariants (a footer that disagrees with its header, a double
//! free, a pointer the heap never handed out) are not recoverable and panic.

use core::cmp;
use core::fmt;
use core::ptr::{self, NonNull};

use log::{Level, LevelFilter};

use crate::block::{self, Arena, Block, Status, Tag, MIN_BLOCK_SIZE, WORD};
use crate::config::{self, HeapConfig, Policy};
use crate::segment::{Segment, SegmentProvider};
use crate::tracker::{FreeSpace, Tracker};

/// Recoverable allocation failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The segment provider has no more memory to give.
    OutOfMemory,
    /// A zero-sized request, or a size computation that overflowed.
    InvalidRequest,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::InvalidRequest => write!(f, "invalid allocation request"),
        }
    }
}

/// One block as seen from outside the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the logical start of the heap.
    pub offset: usize,
    /// Total size, tags included.
    pub size: usize,
    pub status: Status,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub largest_free: usize,
    /// Bytes between the two sentinels.
    pub heap_bytes: usize,
}

/// A boundary-tag heap over the segment of a [`SegmentProvider`].
///
/// This is single-threaded: every operation takes `&mut self`. The
/// process-wide instance in [`global`](../global/index.html) serializes
/// callers with a lock.
pub struct Heap<P> {
    pub(crate) segment: Segment<P>,
    pub(crate) arena: Arena,
    pub(crate) tracker: Tracker,
    pub(crate) config: HeapConfig,
    pub(crate) verbosity: LevelFilter,
}

// All the raw pointers a heap holds point into its own segment, which moves
// with it.
unsafe impl<P: Send> Send for Heap<P> {}

// A pointer to `addr`, derived from `base` so that it stays inside the
// segment's allocation.
fn at(base: *mut u8, addr: usize) -> *mut u8 {
    base.wrapping_add(addr.wrapping_sub(base as usize))
}

impl<P: SegmentProvider> Heap<P> {
    /// Take ownership of a fresh segment and lay out an empty heap in its
    /// first chunk.
    ///
    /// # Panics
    ///
    /// Panics if the segment has already been grown, reports a page size of
    /// 0, or cannot supply an initial chunk large enough for one block.
    pub fn init(provider: P, config: HeapConfig) -> Heap<P> {
        let mut segment = Segment::new(provider);
        let verbosity = config::verbosity(config.log_level);

        let (start, brk) = (segment.start(), segment.brk());
        if start.is_null() {
            panic!("Data segment not initialized.");
        }
        if start != brk {
            panic!("Heap not clean: segment starts at {:p} but its break is {:p}.", start, brk);
        }
        if segment.page_size() == 0 {
            panic!("Reported pagesize == 0.");
        }

        let chunk = match chunk_size(&config) {
            Some(chunk) => chunk,
            None => panic!("Chunk size {} is too large.", config.chunk_size),
        };
        if let Err(err) = segment.grow(chunk) {
            panic!("Failed to claim the initial {} byte chunk: {:?}", chunk, err);
        }

        let brk = segment.brk();
        let first = block::align_up(start as usize + WORD, MIN_BLOCK_SIZE);
        let last = block::align_down((brk as usize).saturating_sub(WORD), MIN_BLOCK_SIZE);
        let (first, last) = match first {
            Some(first) if last >= first + MIN_BLOCK_SIZE => (first, last),
            _ => panic!("An initial chunk of {} bytes cannot hold a block.", chunk),
        };

        let arena = unsafe {
            Arena {
                start: NonNull::new_unchecked(at(start, first)),
                end: NonNull::new_unchecked(at(start, last)),
            }
        };

        let mut tracker = Tracker::new(config.policy);
        unsafe {
            Tag::SENTINEL.write(arena.initial_sentinel());
            Tag::SENTINEL.write(arena.end.as_ptr());
            let block = Block::format(arena.start, arena.size(), Status::Free);
            tracker.insert(block);
        }

        let heap = Heap {
            segment,
            arena,
            tracker,
            config,
            verbosity,
        };
        heap_log!(
            heap,
            Level::Info,
            "heap initialized: {} free list, heap {:p}..{:p} in segment {:p}..{:p}",
            heap.policy(),
            heap.arena.start,
            heap.arena.end,
            heap.segment.start(),
            heap.segment.brk(),
        );
        heap
    }

    pub fn policy(&self) -> Policy {
        self.tracker.policy()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn segment(&self) -> &Segment<P> {
        &self.segment
    }

    /// The logical heap bounds.
    pub fn arena(&self) -> Arena {
        self.arena
    }

    /// 0 silences the heap; higher levels trace more. No effect on behaviour.
    pub fn set_log_level(&mut self, level: u8) {
        self.config.log_level = level;
        self.verbosity = config::verbosity(level);
    }

    /// Blocks in physical order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let start = self.arena.start.as_ptr() as usize;
        unsafe { self.arena.blocks() }.map(move |block| {
            let tag = unsafe { block.header() };
            BlockInfo {
                offset: block.addr() as usize - start,
                size: tag.size(),
                status: tag.status(),
            }
        })
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_bytes: self.arena.size(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.blocks += 1;
            match block.status {
                Status::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                    stats.largest_free = cmp::max(stats.largest_free, block.size);
                }
                Status::Allocated => {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += block.size;
                }
            }
        }
        stats
    }

    /// Payload bytes available behind a live allocation.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe {
            let block = self.owned_block(ptr);
            if block.header().is_free() {
                panic!("usable_size of freed pointer {:p}", ptr);
            }
            block.capacity()
        }
    }

    ////////////////////////////////////////////////////////////
    // Allocation API

    /// Allocate at least `size` bytes. Returns `None` for a zero-sized
    /// request or when memory runs out.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok()
    }

    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        heap_log!(self, Level::Debug, "allocate({:#x} ({}))", size, size);
        if size == 0 {
            return Err(AllocError::InvalidRequest);
        }
        let needed = block::block_size_for(size).ok_or(AllocError::OutOfMemory)?;

        unsafe {
            let block = match self.tracker.find(self.arena, needed) {
                Some(block) => block,
                None => self.extend(needed)?,
            };
            let block = self.place(block, needed);
            heap_log!(
                self,
                Level::Trace,
                "  placed {} bytes at {:?} ({} byte block)",
                size,
                block,
                block.size()
            );
            Ok(block.payload())
        }
    }

    /// Allocate room for `count` elements of `size` bytes, zeroed. An
    /// overflowing product is rejected like a zero-sized request.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        heap_log!(self, Level::Debug, "zero_allocate({:#x}, {:#x})", count, size);
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => {
                heap_log!(self, Level::Info, "  {} * {} overflows", count, size);
                return None;
            }
        };

        let ptr = self.allocate(total)?;
        unsafe {
            let capacity = Block::from_payload(ptr).capacity();
            ptr::write_bytes(ptr.as_ptr(), 0, capacity);
        }
        Some(ptr)
    }

    /// Resize an allocation, moving it if it cannot grow in place.
    ///
    /// `None` allocates; a zero `size` frees and returns `None`. If a move is
    /// needed and the new allocation fails, the old one is left untouched and
    /// `None` is returned.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this heap.
    pub fn reallocate(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        heap_log!(self, Level::Debug, "reallocate({:?}, {:#x} ({}))", ptr, size, size);
        let ptr = match ptr {
            None => return self.allocate(size),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.free(ptr);
            return None;
        }

        unsafe {
            let block = self.owned_block(ptr);
            if block.header().is_free() {
                panic!("reallocate of freed pointer {:p}", ptr);
            }
            let needed = block::block_size_for(size)?;

            if self.resize_in_place(block, needed) {
                heap_log!(self, Level::Trace, "  resized {:?} in place", block);
                self.shrink_if_needed();
                return Some(ptr);
            }

            let keep = cmp::min(block.capacity(), size);
            let moved = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), keep);
            self.free(ptr);
            Some(moved)
        }
    }

    /// Give an allocation back.
    ///
    /// # Panics
    ///
    /// Panics on a double free, or if `ptr` was not handed out by this heap.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        heap_log!(self, Level::Debug, "free({:p})", ptr);
        unsafe {
            let block = self.owned_block(ptr);
            if block.header().is_free() {
                panic!("double free of {:p}", ptr);
            }
            block.set_status(Status::Free);
            let merged = self.coalesce(block);
            self.tracker.insert(merged);
            self.shrink_if_needed();
        }
    }

    ////////////////////////////////////////////////////////////
    // Internals

    fn chunk_size(&self) -> usize {
        chunk_size(&self.config).unwrap_or(MIN_BLOCK_SIZE)
    }

    // The block behind a payload pointer, after making sure it could be one
    // of ours.
    unsafe fn owned_block(&self, ptr: NonNull<u8>) -> Block {
        let addr = (ptr.as_ptr() as usize).wrapping_sub(WORD);
        let start = self.arena.start.as_ptr() as usize;
        let end = self.arena.end.as_ptr() as usize;
        if addr < start || addr >= end || (addr - start) % MIN_BLOCK_SIZE != 0 {
            panic!("{:p} is not a payload pointer owned by this heap", ptr);
        }

        let block = Block::from_payload(ptr);
        let header = block.header();
        if header.size() < MIN_BLOCK_SIZE || header.size() > end - addr {
            panic!(
                "{:p} is not a payload pointer owned by this heap (header {:?})",
                ptr, header
            );
        }
        // A freed block may since have been merged into its predecessor, so
        // its old footer can belong to a larger block. Leave it to the caller.
        if header.is_free() {
            return block;
        }
        let footer = block.footer();
        if footer != header {
            log::error!("{}", self.report());
            panic!(
                "heap corruption: block {:?} has header {:?} but footer {:?}",
                block, header, footer
            );
        }
        block
    }

    // Allocate `needed` bytes out of a tracked free block, splitting off the
    // tail when it can stand as a block of its own.
    unsafe fn place(&mut self, block: Block, needed: usize) -> Block {
        self.tracker.remove(block);
        let size = block.size();
        debug_assert!(size >= needed);

        if size - needed < MIN_BLOCK_SIZE {
            block.set_status(Status::Allocated);
            return block;
        }

        let placed = Block::format(block.ptr(), needed, Status::Allocated);
        let rest = Block::format(
            NonNull::new_unchecked(block.addr().add(needed)),
            size - needed,
            Status::Free,
        );
        heap_log!(
            self,
            Level::Trace,
            "  split {} bytes off {:?}, leaving {:?} ({} bytes)",
            needed,
            block,
            rest,
            size - needed
        );
        self.tracker.insert(rest);
        placed
    }

    // Grow the heap so that a free block of at least `needed` bytes exists
    // at its end, and return that block (tracked).
    unsafe fn extend(&mut self, needed: usize) -> Result<Block, AllocError> {
        let request = block::align_up(cmp::max(needed, self.chunk_size()), MIN_BLOCK_SIZE)
            .ok_or(AllocError::OutOfMemory)?;
        heap_log!(self, Level::Info, "extending heap by {:#x} ({}) bytes", request, request);

        // The new break must still be an address.
        if (self.segment.brk() as usize).checked_add(request).is_none() {
            heap_log!(self, Level::Info, "  {:#x} bytes do not fit in the address space", request);
            return Err(AllocError::OutOfMemory);
        }
        if let Err(err) = self.segment.grow(request) {
            heap_log!(self, Level::Info, "  segment provider refused: {:?}", err);
            return Err(AllocError::OutOfMemory);
        }

        let old_end = self.arena.end;
        let new_end = self.logical_end();
        let size = (new_end as usize).saturating_sub(old_end.as_ptr() as usize);
        if size < needed {
            heap_log!(
                self,
                Level::Info,
                "  segment provider grew by too little: {:p} to {:p}",
                old_end,
                new_end
            );
            return Err(AllocError::OutOfMemory);
        }

        // The new block starts where the old end sentinel was.
        let block = Block::format(old_end, size, Status::Free);
        Tag::SENTINEL.write(new_end);
        self.arena.end = NonNull::new_unchecked(new_end);

        let block = self.coalesce(block);
        self.tracker.insert(block);
        Ok(block)
    }

    // Where the end sentinel belongs for the current break.
    fn logical_end(&self) -> *mut u8 {
        let brk = self.segment.brk();
        at(brk, block::align_down(brk as usize - WORD, MIN_BLOCK_SIZE))
    }

    // Merge a block that has just become free with its free physical
    // neighbours. Absorbed neighbours leave the tracker; the returned block is
    // untracked.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let size = block.size();
        let prev_free = block.prev_footer().is_free();
        let next = block.next();
        let next_free = next.header().is_free();

        let merged = match (prev_free, next_free) {
            (false, false) => return block,
            (false, true) => {
                self.tracker.remove(next);
                Block::format(block.ptr(), size + next.size(), Status::Free)
            }
            (true, false) => {
                let prev = block.prev();
                self.tracker.remove(prev);
                Block::format(prev.ptr(), prev.size() + size, Status::Free)
            }
            (true, true) => {
                let prev = block.prev();
                self.tracker.remove(prev);
                self.tracker.remove(next);
                Block::format(prev.ptr(), prev.size() + size + next.size(), Status::Free)
            }
        };

        heap_log!(
            self,
            Level::Trace,
            "  coalesced {:?} into {:?} ({} bytes)",
            block,
            merged,
            merged.size()
        );
        merged
    }

    // Resize an allocated block without moving it, if that is possible.
    unsafe fn resize_in_place(&mut self, block: Block, needed: usize) -> bool {
        let size = block.size();
        if needed <= size {
            self.trim(block, needed);
            return true;
        }

        let next = block.next();
        let next_tag = next.header();
        if !next_tag.is_free() || size + next_tag.size() < needed {
            return false;
        }

        self.tracker.remove(next);
        let grown = Block::format(block.ptr(), size + next_tag.size(), Status::Allocated);
        self.trim(grown, needed);
        true
    }

    // Cut an allocated block down to `needed` bytes, freeing the tail if it
    // is large enough to be a block.
    unsafe fn trim(&mut self, block: Block, needed: usize) {
        let size = block.size();
        if size - needed < MIN_BLOCK_SIZE {
            return;
        }

        Block::format(block.ptr(), needed, Status::Allocated);
        let rest = Block::format(
            NonNull::new_unchecked(block.addr().add(needed)),
            size - needed,
            Status::Free,
        );
        let rest = self.coalesce(rest);
        self.tracker.insert(rest);
    }

    // Hand a large free tail back to the segment provider.
    unsafe fn shrink_if_needed(&mut self) {
        let threshold = match self.config.shrink_threshold {
            Some(threshold) => threshold,
            None => return,
        };

        let end = self.arena.end.as_ptr();
        let last = Tag::read(end.sub(WORD));
        if !last.is_free() || last.size() <= threshold {
            return;
        }

        // Release whole pages, and keep the end sentinel block aligned.
        let granule = cmp::max(self.segment.page_size(), MIN_BLOCK_SIZE);
        if granule % MIN_BLOCK_SIZE != 0 {
            return;
        }
        let release = (last.size() - threshold) / granule * granule;
        if release == 0 {
            return;
        }

        let trailing = Block::from_header(NonNull::new_unchecked(end.sub(last.size())));
        self.tracker.remove(trailing);
        if let Err(err) = self.segment.shrink(release) {
            heap_log!(self, Level::Info, "segment provider refused to shrink: {:?}", err);
            self.tracker.insert(trailing);
            return;
        }

        let new_end = end.sub(release);
        let remaining = last.size() - release;
        if remaining > 0 {
            let rest = Block::format(trailing.ptr(), remaining, Status::Free);
            self.tracker.insert(rest);
        }
        Tag::SENTINEL.write(new_end);
        self.arena.end = NonNull::new_unchecked(new_end);

        heap_log!(
            self,
            Level::Info,
            "shrank heap by {:#x} ({}) bytes, end now {:p}",
            release,
            release,
            new_end
        );
    }
}

fn chunk_size(config: &HeapConfig) -> Option<usize> {
    block::align_up(cmp::max(config.chunk_size, MIN_BLOCK_SIZE), MIN_BLOCK_SIZE)
}
