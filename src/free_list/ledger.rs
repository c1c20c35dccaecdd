//! The block ledger: an address-ordered partition of `[0, capacity)`.

use core::{fmt, ops::Range};

use crate::{Allocator, Vec};

/// The handle of a free-list allocation.
///
/// Ids come from a counter that starts at 1 on every `init` and only ever goes
/// up, so an id is never handed out twice within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    /// Wrap a raw id, e.g. one typed in by a user.
    #[inline]
    pub const fn new(id: u64) -> Self {
        BlockId(id)
    }

    /// The raw id.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One contiguous region of the free-list arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    start: usize,
    size: usize,
    /// `None` while the block is free.
    id: Option<BlockId>,
}

impl Block {
    pub(crate) const fn free(start: usize, size: usize) -> Self {
        Block {
            start,
            size,
            id: None,
        }
    }

    #[cfg(test)]
    pub(crate) const fn used(start: usize, size: usize, id: BlockId) -> Self {
        Block {
            start,
            size,
            id: Some(id),
        }
    }

    /// Offset of the first unit of this block.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of units in this block.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last unit of this block.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// The address range this block covers.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// Is this block available for allocation?
    #[inline]
    pub fn is_free(&self) -> bool {
        self.id.is_none()
    }

    /// The id of the allocation occupying this block, if any.
    #[inline]
    pub fn id(&self) -> Option<BlockId> {
        self.id
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x} - {:#06x}] ", self.start, self.end() - 1)?;
        match self.id {
            None => f.write_str("FREE"),
            Some(id) => write!(f, "USED (id={id})"),
        }
    }
}

/// The ordered sequence of blocks tiling the arena.
///
/// Invariants, checked by [`Ledger::is_consistent`] after every mutation in
/// debug builds:
///
/// * the first block starts at 0, each block starts where its predecessor
///   ends, and the last block ends at `capacity` (an empty arena has no
///   blocks);
/// * every block has a non-zero size;
/// * no two neighbouring blocks are both free.
///
/// The last one only holds between public operations: `split` and `set_free`
/// may leave it broken until `coalesce` runs.
pub(super) struct Ledger<A: Allocator> {
    blocks: Vec<Block, A>,
    capacity: usize,
}

impl<A: Allocator> Ledger<A> {
    pub(super) fn new_in(alloc: A) -> Self {
        Ledger {
            blocks: Vec::new_in(alloc),
            capacity: 0,
        }
    }

    /// Forget every block and start over with one free block spanning the
    /// whole arena.
    pub(super) fn reset(&mut self, capacity: usize) {
        self.blocks.clear();
        self.capacity = capacity;
        if capacity > 0 {
            self.blocks.push(Block::free(0, capacity));
        }
        debug_assert!(self.is_consistent());
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Index of the used block carrying `id`.
    pub(super) fn find_used(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == Some(id))
    }

    /// Shrink the free block at `index` to exactly `size` units, inserting a
    /// new free block right after it for the remainder.
    pub(super) fn split(&mut self, index: usize, size: usize) {
        let block = &mut self.blocks[index];
        debug_assert!(block.is_free());
        debug_assert!(0 < size && size < block.size);

        let remainder = Block::free(block.start + size, block.size - size);
        block.size = size;
        log::trace!(
            "split {:#x}: kept {size}, remainder {} at {:#x}",
            block.start,
            remainder.size,
            remainder.start
        );
        self.blocks.insert(index + 1, remainder);
    }

    pub(super) fn set_used(&mut self, index: usize, id: BlockId) {
        debug_assert!(self.blocks[index].is_free());
        self.blocks[index].id = Some(id);
    }

    pub(super) fn set_free(&mut self, index: usize) {
        debug_assert!(!self.blocks[index].is_free());
        self.blocks[index].id = None;
    }

    /// Merge the free block at `index` with any free neighbours.
    ///
    /// The following block is absorbed first, then the (possibly grown) block
    /// is absorbed into its predecessor. Returns the index of the resulting
    /// free block.
    pub(super) fn coalesce(&mut self, index: usize) -> usize {
        debug_assert!(self.blocks[index].is_free());

        if self.blocks.get(index + 1).is_some_and(Block::is_free) {
            let next = self.blocks.remove(index + 1);
            log::trace!(
                "merge {:#x} <- {:#x} ({} units)",
                self.blocks[index].start,
                next.start,
                next.size
            );
            self.blocks[index].size += next.size;
        }

        let mut index = index;
        if index > 0 && self.blocks[index - 1].is_free() {
            let this = self.blocks.remove(index);
            index -= 1;
            log::trace!(
                "merge {:#x} <- {:#x} ({} units)",
                self.blocks[index].start,
                this.start,
                this.size
            );
            self.blocks[index].size += this.size;
        }

        debug_assert!(self.is_consistent());
        index
    }

    /// Sum of the sizes of all used blocks.
    pub(super) fn used(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !b.is_free())
            .map(Block::size)
            .sum()
    }

    /// Size of the largest free block, or 0 if nothing is free.
    pub(super) fn largest_free(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.is_free())
            .map(Block::size)
            .max()
            .unwrap_or(0)
    }

    /// Do the blocks exactly tile `[0, capacity)` with no two neighbouring
    /// free blocks?
    pub(super) fn is_consistent(&self) -> bool {
        let mut expected_start = 0;
        let mut prev_free = false;
        for block in self.blocks.iter() {
            if block.start != expected_start || block.size == 0 {
                return false;
            }
            if prev_free && block.is_free() {
                return false;
            }
            expected_start = block.end();
            prev_free = block.is_free();
        }
        expected_start == self.capacity
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;
    use crate::Global;

    #[test]
    fn reset_creates_one_free_block() {
        let mut ledger = Ledger::new_in(Global);
        ledger.reset(1024);
        assert_eq!(ledger.blocks(), &[Block::free(0, 1024)]);
        assert!(ledger.is_consistent());

        ledger.reset(0);
        assert!(ledger.blocks().is_empty());
        assert!(ledger.is_consistent());
    }

    #[test]
    fn split_then_coalesce_restores_the_block() {
        let mut ledger = Ledger::new_in(Global);
        ledger.reset(100);
        ledger.split(0, 30);
        ledger.set_used(0, BlockId::new(1));
        assert_eq!(
            ledger.blocks(),
            &[Block::used(0, 30, BlockId::new(1)), Block::free(30, 70)]
        );
        assert_eq!(ledger.used(), 30);
        assert_eq!(ledger.largest_free(), 70);
        assert!(ledger.is_consistent());

        ledger.set_free(0);
        assert_eq!(ledger.coalesce(0), 0);
        assert_eq!(ledger.blocks(), &[Block::free(0, 100)]);
    }

    #[test]
    fn coalesce_merges_both_neighbours() {
        let mut ledger = Ledger::new_in(Global);
        ledger.reset(90);
        ledger.split(0, 30);
        ledger.split(1, 30);
        ledger.set_used(0, BlockId::new(1));
        ledger.set_used(1, BlockId::new(2));
        ledger.set_used(2, BlockId::new(3));

        ledger.set_free(0);
        ledger.coalesce(0);
        ledger.set_free(2);
        ledger.coalesce(2);
        assert_eq!(ledger.find_used(BlockId::new(2)), Some(1));

        ledger.set_free(1);
        assert_eq!(ledger.coalesce(1), 0);
        assert_eq!(ledger.blocks(), &[Block::free(0, 90)]);
    }

    #[test]
    fn display_matches_dump_format() {
        assert_eq!(
            Block::used(0, 100, BlockId::new(1)).to_string(),
            "[0x0000 - 0x0063] USED (id=1)"
        );
        assert_eq!(Block::free(100, 924).to_string(), "[0x0064 - 0x03ff] FREE");
    }
}
