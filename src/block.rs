//! Boundary tags and the block layout built on them.
//!
//! Every block begins with a header word and ends with a footer word, and
//! both hold the same [`Tag`]: the block size (header and footer included)
//! with the allocation status packed into its low bits. The heap is framed by
//! two zero-sized, allocated sentinel tags so that a walk in either direction
//! always stops on an allocated tag without needing a bounds check.
//!
//! ```text
//!     initial sentinel                                      end sentinel
//!           |                                                     |
//!       +---+---+-------------------------+---+---+-----------+---+---+
//!       |???| S | h : n : p :           : f | H :   ...   : F | S |???|
//!       +---+---+-------------------------+---+---+-----------+---+---+
//!               ^                                             ^
//!             start                                          end
//!      (MIN_BLOCK_SIZE aligned)                    (MIN_BLOCK_SIZE aligned)
//! ```
//!
//! `h`/`f` are the tags of a free block and `n`/`p` its free-list links, which
//! only exist while the block is free. `H`/`F` are the tags of an allocated
//! block, whose payload belongs to the caller.

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Width of a boundary tag, in bytes.
pub const WORD: usize = size_of::<usize>();

/// Bytes used by the header and footer of every block.
pub const TAG_OVERHEAD: usize = 2 * WORD;

/// The smallest block the heap will carve. All block sizes, and both logical
/// heap bounds, are multiples of it.
pub const MIN_BLOCK_SIZE: usize = 32;

const STATUS_MASK: usize = 0x7;
const ALLOCATED_BIT: usize = 0x1;

const_assert!(MIN_BLOCK_SIZE.is_power_of_two());
const_assert!(MIN_BLOCK_SIZE > STATUS_MASK);
// A free block must have room for its tags and both free-list links.
const_assert!(MIN_BLOCK_SIZE >= TAG_OVERHEAD + size_of::<FreeLinks>());

/// Round `value` up to a multiple of `align`, a power of two. Returns `None`
/// on overflow.
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align`, a power of two.
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Size of the block needed to hand out `request` payload bytes.
///
/// Returns `None` if the computation overflows. A zero request is the
/// caller's business; it maps to the smallest block here.
pub fn block_size_for(request: usize) -> Option<usize> {
    align_up(request.checked_add(TAG_OVERHEAD)?, MIN_BLOCK_SIZE)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Free,
    Allocated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Free => f.pad("free"),
            Status::Allocated => f.pad("allocated"),
        }
    }
}

/// A boundary tag: block size and status packed into one word.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(usize);

impl Tag {
    /// The tag written at both ends of the heap.
    pub const SENTINEL: Tag = Tag::new(0, Status::Allocated);

    pub const fn new(size: usize, status: Status) -> Tag {
        let bit = match status {
            Status::Free => 0,
            Status::Allocated => ALLOCATED_BIT,
        };
        Tag((size & !STATUS_MASK) | bit)
    }

    pub const fn size(self) -> usize {
        self.0 & !STATUS_MASK
    }

    pub const fn status(self) -> Status {
        if self.0 & ALLOCATED_BIT != 0 {
            Status::Allocated
        } else {
            Status::Free
        }
    }

    pub const fn is_free(self) -> bool {
        self.0 & ALLOCATED_BIT == 0
    }

    pub const fn decode(self) -> (usize, Status) {
        (self.size(), self.status())
    }

    /// Read the tag stored at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be a word-aligned address inside memory owned by the heap.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn read(at: *const u8) -> Tag {
        Tag((at as *const usize).read())
    }

    /// Store this tag at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be a word-aligned address inside memory owned by the heap,
    /// and must not be part of an allocated block's payload.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn write(self, at: *mut u8) {
        (at as *mut usize).write(self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#x}, {})", self.size(), self.status())
    }
}

/// The free-list links stored in the first payload words of a free block.
///
/// This is a view over memory that belongs to the caller as soon as the
/// block is allocated, so it is only reachable through [`Block::links`],
/// which insists the block is free.
#[repr(C)]
pub struct FreeLinks {
    pub next: Option<Block>,
    pub prev: Option<Block>,
}

/// A formed block, identified by the address of its header tag.
///
/// The header and footer are never written independently: [`Block::format`]
/// and [`Block::set_status`] always rewrite both tags together, so the footer
/// can only drift from the header through foreign writes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    header: NonNull<u8>,
}

impl Block {
    /// # Safety
    ///
    /// `header` must point at the header tag of a formed block, or at the end
    /// sentinel (in which case only the header may be read).
    pub unsafe fn from_header(header: NonNull<u8>) -> Block {
        Block { header }
    }

    /// The block whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by [`Block::payload`].
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        Block {
            header: NonNull::new_unchecked(payload.as_ptr().sub(WORD)),
        }
    }

    /// Write a block of `size` bytes at `at`, header and footer together.
    ///
    /// # Safety
    ///
    /// `at..at + size` must be heap memory that is not part of any other live
    /// block, and `size` a non-zero multiple of [`MIN_BLOCK_SIZE`]. A smaller
    /// size would put the footer before `at`.
    pub unsafe fn format(at: NonNull<u8>, size: usize, status: Status) -> Block {
        debug_assert!(
            size >= MIN_BLOCK_SIZE && size % MIN_BLOCK_SIZE == 0,
            "Can't format a block of size {}",
            size
        );
        let tag = Tag::new(size, status);
        tag.write(at.as_ptr());
        tag.write(at.as_ptr().add(size - WORD));
        Block { header: at }
    }

    pub fn ptr(self) -> NonNull<u8> {
        self.header
    }

    pub fn addr(self) -> *mut u8 {
        self.header.as_ptr()
    }

    /// The caller-visible address: just past the header.
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header.as_ptr().add(WORD)) }
    }

    /// # Safety
    ///
    /// The block must be formed (or be the end sentinel).
    pub unsafe fn header(self) -> Tag {
        Tag::read(self.addr())
    }

    /// # Safety
    ///
    /// The block must be formed, with a correct size in its header.
    pub unsafe fn footer_addr(self) -> *mut u8 {
        self.addr().add(self.size() - WORD)
    }

    /// # Safety
    ///
    /// See [`Block::footer_addr`].
    pub unsafe fn footer(self) -> Tag {
        Tag::read(self.footer_addr())
    }

    /// # Safety
    ///
    /// See [`Block::header`].
    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    /// # Safety
    ///
    /// See [`Block::header`].
    pub unsafe fn status(self) -> Status {
        self.header().status()
    }

    /// Bytes available to the caller.
    ///
    /// # Safety
    ///
    /// The block must be formed.
    pub unsafe fn capacity(self) -> usize {
        self.size() - TAG_OVERHEAD
    }

    /// Rewrite both tags with a new status.
    ///
    /// # Safety
    ///
    /// The block must be formed.
    pub unsafe fn set_status(self, status: Status) {
        Block::format(self.header, self.size(), status);
    }

    /// The tag just before this block: its predecessor's footer, or the
    /// initial sentinel.
    ///
    /// # Safety
    ///
    /// The block must lie inside the heap.
    pub unsafe fn prev_footer(self) -> Tag {
        Tag::read(self.addr().sub(WORD))
    }

    /// The physical successor. This may be the end sentinel, whose header is
    /// the only readable part.
    ///
    /// # Safety
    ///
    /// The block must be formed.
    pub unsafe fn next(self) -> Block {
        Block {
            header: NonNull::new_unchecked(self.addr().add(self.size())),
        }
    }

    /// The physical predecessor, located through its footer.
    ///
    /// # Safety
    ///
    /// The block must not be the first one in the heap: the initial sentinel
    /// has size 0 and does not lead anywhere.
    pub unsafe fn prev(self) -> Block {
        let size = self.prev_footer().size();
        Block {
            header: NonNull::new_unchecked(self.addr().sub(size)),
        }
    }

    /// The free-list links stored in this block's payload.
    ///
    /// # Safety
    ///
    /// The block must be free; the returned reference must not outlive that.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn links<'a>(self) -> &'a mut FreeLinks {
        debug_assert!(
            self.header().is_free(),
            "free-list links read from allocated block {:?}",
            self
        );
        &mut *(self.payload().as_ptr() as *mut FreeLinks)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.header, f)
    }
}

/// The logical bounds of the heap.
///
/// `start` is the header of the first block, just after the initial
/// sentinel; `end` holds the end sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Arena {
    pub start: NonNull<u8>,
    pub end: NonNull<u8>,
}

impl Arena {
    /// Bytes between the two sentinels.
    pub fn size(&self) -> usize {
        self.end.as_ptr() as usize - self.start.as_ptr() as usize
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        self.start.as_ptr() as *const u8 <= addr && addr < self.end.as_ptr() as *const u8
    }

    pub fn initial_sentinel(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_sub(WORD)
    }

    /// Walk the blocks in physical order.
    ///
    /// # Safety
    ///
    /// The arena must describe a heap whose tags stay untouched while the
    /// iterator is alive.
    pub unsafe fn blocks(&self) -> Blocks {
        Blocks {
            cursor: self.start.as_ptr(),
            end: self.end.as_ptr(),
        }
    }
}

/// Physical-order walk from the first block up to the end sentinel.
///
/// The walk stops early on a zero-sized header rather than looping forever;
/// the consistency checker is the place that reports such a heap.
pub struct Blocks {
    cursor: *mut u8,
    end: *mut u8,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.cursor >= self.end {
            return None;
        }
        let block = Block {
            header: NonNull::new(self.cursor)?,
        };
        let size = unsafe { block.size() };
        if size == 0 {
            self.cursor = self.end;
            return None;
        }
        self.cursor = self.cursor.wrapping_add(size);
        Some(block)
    }
}
