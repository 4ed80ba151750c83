use core::fmt;
use core::marker::PhantomData;

use crate::block::{Arena, Block};
use crate::tracker::{best_fit, FreeSpace};

/// A `BlockList` is the explicit free list: a doubly linked list of the free
/// blocks in the heap.
///
/// The links live in the first two payload words of each free block (see
/// [`FreeLinks`](../block/struct.FreeLinks.html)), so the list costs no memory
/// beyond its head. Blocks are pushed at the head; a search still walks the
/// whole list, because best fit needs the smallest block and not the first.
///
/// It maintains a few internal invariants:
///
/// - Every block on the list is free, and every free block is on the list
///   exactly once.
/// - `prev` of each block is the block whose `next` points to it; the head
///   has no `prev`.
/// - `len` is the number of blocks on the list.
pub struct BlockList {
    head: Option<Block>,
    len: usize,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = unsafe { block.links().next };
        Some(block)
    }
}

// A BlockList is sendable - as long as the heap it threads through moves
// with it, its fine.
unsafe impl Send for BlockList {}

impl Default for BlockList {
    fn default() -> Self {
        BlockList { head: None, len: 0 }
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeBlock({:?}, {})", block, unsafe { block.size() })?;
        }

        write!(f, ")")
    }
}

impl BlockList {
    pub fn iter(&self) -> BlockIter {
        BlockIter {
            next: self.head,
            _list: PhantomData,
        }
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl FreeSpace for BlockList {
    unsafe fn find(&self, _arena: Arena, min_size: usize) -> Option<Block> {
        best_fit(self.iter(), min_size)
    }

    unsafe fn insert(&mut self, block: Block) {
        let links = block.links();
        links.prev = None;
        links.next = self.head;
        if let Some(head) = self.head {
            head.links().prev = Some(block);
        }
        self.head = Some(block);
        self.len += 1;
    }

    unsafe fn remove(&mut self, block: Block) {
        let links = block.links();
        let (prev, next) = (links.prev, links.next);
        match prev {
            Some(prev) => prev.links().next = next,
            None => {
                debug_assert_eq!(self.head, Some(block), "untracked block removed");
                self.head = next;
            }
        }
        if let Some(next) = next {
            next.links().prev = prev;
        }
        links.prev = None;
        links.next = None;
        self.len -= 1;
    }

    unsafe fn audit(&self, arena: Arena, free_blocks: usize) -> usize {
        let mut issues = 0;
        let mut count = 0;
        let mut previous: Option<Block> = None;
        let mut cursor = self.head;

        while let Some(block) = cursor {
            if count > free_blocks {
                // Longer than the number of free blocks: a cycle, or stale
                // entries. Either way, stop walking.
                issues += 1;
                break;
            }
            if !arena.contains(block.addr()) || !block.header().is_free() {
                // The links of an allocated block are caller data.
                issues += 1;
                break;
            }
            let links = block.links();
            if links.prev != previous {
                issues += 1;
            }
            count += 1;
            previous = Some(block);
            cursor = links.next;
        }

        if count != free_blocks || count != self.len {
            issues += 1;
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::ptr::NonNull;
    use std::format;
    use std::vec::Vec;

    use crate::block::{Status, Tag};
    use test_log::test;

    #[repr(C, align(32))]
    struct Aligned([u8; 512]);

    unsafe fn free_blocks(mem: &mut Aligned, sizes: &[usize]) -> (Arena, Vec<Block>) {
        let base = mem.0.as_mut_ptr();
        Tag::SENTINEL.write(base.add(24));
        let start = base.add(32);
        let mut cursor = start;
        let mut blocks = Vec::new();
        for &size in sizes {
            blocks.push(Block::format(NonNull::new_unchecked(cursor), size, Status::Free));
            cursor = cursor.add(size);
        }
        Tag::SENTINEL.write(cursor);
        let arena = Arena {
            start: NonNull::new_unchecked(start),
            end: NonNull::new_unchecked(cursor),
        };
        (arena, blocks)
    }

    #[test]
    fn test_push_and_splice() {
        let mut mem = Aligned([0; 512]);
        unsafe {
            let (arena, blocks) = free_blocks(&mut mem, &[64, 128, 96]);
            let mut list = BlockList::default();
            assert!(list.is_empty());

            for &block in &blocks {
                list.insert(block);
            }
            assert_eq!(list.len(), 3);
            // Pushed at the head, so the list runs newest first.
            let order: Vec<Block> = list.iter().collect();
            assert_eq!(order, [blocks[2], blocks[1], blocks[0]]);
            assert_eq!(list.audit(arena, 3), 0);

            // Splice out of the middle.
            list.remove(blocks[1]);
            let order: Vec<Block> = list.iter().collect();
            assert_eq!(order, [blocks[2], blocks[0]]);
            assert_eq!(blocks[0].links().prev, Some(blocks[2]));

            // And off the head.
            list.remove(blocks[2]);
            assert_eq!(list.head(), Some(blocks[0]));
            assert_eq!(blocks[0].links().prev, None);

            list.remove(blocks[0]);
            assert!(list.is_empty());
            assert_eq!(list.len(), 0);
        }
    }

    #[test]
    fn test_best_fit_ignores_list_order() {
        let mut mem = Aligned([0; 512]);
        unsafe {
            let (arena, blocks) = free_blocks(&mut mem, &[96, 64, 128, 96]);
            let mut list = BlockList::default();
            // Insert so that the higher 96-byte block sits nearer the head.
            list.insert(blocks[0]);
            list.insert(blocks[1]);
            list.insert(blocks[2]);
            list.insert(blocks[3]);

            assert_eq!(list.find(arena, 80), Some(blocks[0]));
            assert_eq!(list.find(arena, 64), Some(blocks[1]));
            assert_eq!(list.find(arena, 100), Some(blocks[2]));
            assert_eq!(list.find(arena, 129), None);
        }
    }

    #[test]
    fn test_audit_catches_disagreement() {
        let mut mem = Aligned([0; 512]);
        unsafe {
            let (arena, blocks) = free_blocks(&mut mem, &[64, 64]);
            let mut list = BlockList::default();
            list.insert(blocks[0]);

            // A free block the list does not know about.
            assert_ne!(list.audit(arena, 2), 0);

            // A listed block that is no longer free.
            blocks[0].set_status(Status::Allocated);
            assert_ne!(list.audit(arena, 1), 0);
        }
    }

    #[test]
    fn test_display() {
        let mut mem = Aligned([0; 512]);
        unsafe {
            let (_arena, blocks) = free_blocks(&mut mem, &[64]);
            let mut list = BlockList::default();
            assert_eq!(format!("{}", list), "BlockList()");
            list.insert(blocks[0]);
            let shown = format!("{}", list);
            assert!(shown.starts_with("BlockList(FreeBlock(0x"));
            assert!(shown.ends_with(", 64))"));
        }
    }
}
