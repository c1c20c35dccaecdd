//! The binary buddy allocator.
//!
//! The arena is a single power-of-two region, `2^max_order` units. Free
//! regions are kept in one list per order, where every block on list `k` is
//! `2^k` units long and starts at a multiple of `2^k`.
//!
//! * Allocation rounds the request up to a power of two `2^r`, takes a block
//!   from the smallest non-empty list at order `r` or above, and halves it
//!   until it is order `r`, returning each upper half to the list one order
//!   down.
//!
//! * Deallocation walks the other way: the buddy of the block at `addr` of
//!   order `k` is at `addr ^ 2^k`, because siblings differ in exactly that
//!   bit. While the buddy is free, the two are fused into one block of order
//!   `k + 1` starting at the lower address.
//!
//! The handle is the start address and the caller must remember the size it
//! asked for, because deallocation needs it to recover the block's order. The
//! allocator keeps a record of each live block's address and order, and only a
//! `(addr, size)` pair that rounds to exactly such a block may be freed.

use core::fmt;

use crate::{AllocError, AllocResult, Allocator, Global, Stats, Vec};

/// A free region of the buddy arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyBlock {
    start: usize,
    order: u32,
}

impl BuddyBlock {
    const fn new(start: usize, order: u32) -> Self {
        BuddyBlock { start, order }
    }

    /// Offset of the first unit of this block.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// `log2` of this block's size.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Number of units in this block, `2^order`.
    #[inline]
    pub fn size(&self) -> usize {
        1 << self.order
    }
}

/// A view of the free list for one order.
#[derive(Debug, Clone, Copy)]
pub struct FreeList<'a> {
    order: u32,
    blocks: &'a [BuddyBlock],
}

impl<'a> FreeList<'a> {
    /// The order of every block on this list.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// The nominal size of every block on this list.
    pub fn block_size(&self) -> usize {
        1 << self.order
    }

    /// The free blocks, in the order they will be handed out.
    pub fn blocks(&self) -> &'a [BuddyBlock] {
        self.blocks
    }

    /// Start addresses of the free blocks.
    pub fn addrs(&self) -> impl Iterator<Item = usize> + 'a {
        self.blocks.iter().map(BuddyBlock::start)
    }
}

impl fmt::Display for FreeList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Order {} (size {}): ", self.order, self.block_size())?;
        if self.blocks.is_empty() {
            return f.write_str("empty");
        }
        for (i, addr) in self.addrs().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "[{addr}]")?;
        }
        Ok(())
    }
}

/// A binary buddy allocator over an abstract arena of `2^max_order` units.
///
/// The free lists' own storage comes from the allocator `A`.
pub struct BuddyAllocator<A: Allocator + Clone = Global> {
    /// `free_lists[k]` holds the free blocks of order `k`.
    free_lists: Vec<Vec<BuddyBlock, A>, A>,
    /// Blocks handed out and not yet returned.
    live: Vec<BuddyBlock, A>,
    alloc: A,
    total_size: usize,
    max_order: u32,
    successes: usize,
    failures: usize,
}

impl BuddyAllocator {
    /// Create an uninitialized allocator, in which nothing fits until
    /// [`init`](BuddyAllocator::init) succeeds.
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The order of the smallest power of two that is at least `size`, if there is
/// one.
fn order_for(size: usize) -> Option<u32> {
    size.checked_next_power_of_two().map(usize::trailing_zeros)
}

impl<A: Allocator + Clone> BuddyAllocator<A> {
    /// Like [`BuddyAllocator::new`], keeping the free lists in `alloc`.
    pub fn new_in(alloc: A) -> Self {
        BuddyAllocator {
            free_lists: Vec::new_in(alloc.clone()),
            live: Vec::new_in(alloc.clone()),
            alloc,
            total_size: 0,
            max_order: 0,
            successes: 0,
            failures: 0,
        }
    }

    /// Reset the arena to a single free block of `size` units at address 0.
    ///
    /// Fails with [`AllocError::NotPowerOfTwo`], leaving the allocator as it
    /// was, if `size` is not a power of two.
    pub fn init(&mut self, size: usize) -> AllocResult {
        if !size.is_power_of_two() {
            log::debug!("buddy init({size}) failed: not a power of two");
            return Err(AllocError::NotPowerOfTwo);
        }

        self.total_size = size;
        self.max_order = size.trailing_zeros();
        self.successes = 0;
        self.failures = 0;

        self.live.clear();
        self.free_lists.clear();
        for _ in 0..=self.max_order {
            self.free_lists.push(Vec::new_in(self.alloc.clone()));
        }
        self.free_lists[self.max_order as usize].push(BuddyBlock::new(0, self.max_order));

        log::debug!(
            "buddy init: size = {size}, max order = {}",
            self.max_order
        );
        Ok(())
    }

    /// Has [`init`](BuddyAllocator::init) succeeded?
    pub fn is_initialized(&self) -> bool {
        !self.free_lists.is_empty()
    }

    /// Allocate a block of at least `size` units, returning its start address.
    ///
    /// The request is rounded up to the next power of two. Fails with
    /// [`AllocError::NoFit`] if `size` is zero, exceeds the arena, or no free
    /// block of a sufficient order exists.
    pub fn allocate(&mut self, size: usize) -> AllocResult<usize> {
        if size == 0 || size > self.total_size {
            log::debug!(
                "buddy allocate({size}) failed: outside (0, {}]",
                self.total_size
            );
            self.failures += 1;
            return Err(AllocError::NoFit);
        }

        let order = order_for(size).ok_or(AllocError::NoFit)?;
        let Some(found) = (order..=self.max_order).find(|&k| !self.free_lists[k as usize].is_empty())
        else {
            log::debug!("buddy allocate({size}) failed: no free block of order >= {order}");
            self.failures += 1;
            return Err(AllocError::NoFit);
        };

        let mut block = self.free_lists[found as usize].remove(0);
        while block.order > order {
            block.order -= 1;
            let upper = BuddyBlock::new(block.start + block.size(), block.order);
            log::trace!(
                "buddy split {:#x}: halves of order {} at {:#x} and {:#x}",
                block.start,
                block.order,
                block.start,
                upper.start
            );
            self.free_lists[block.order as usize].push(upper);
        }

        debug_assert_eq!(block.start % block.size(), 0);
        self.live.push(block);
        self.successes += 1;
        log::debug!(
            "buddy allocate({size}) -> {:#x} (order {order})",
            block.start
        );
        Ok(block.start)
    }

    /// Return the block at `addr`, allocated with a request of `size` units, to
    /// the free lists, merging it with its buddy as long as the buddy is free.
    ///
    /// Fails with [`AllocError::InvalidHandle`], leaving the free lists
    /// untouched, if `size` is zero, `addr` is outside the arena, no live block
    /// starts at `addr`, or `size` rounds to a different order than the one
    /// the block was allocated with.
    pub fn deallocate(&mut self, addr: usize, size: usize) -> AllocResult {
        if size == 0 || addr >= self.total_size {
            log::debug!("buddy deallocate({addr:#x}, {size}) failed: outside the arena");
            return Err(AllocError::InvalidHandle);
        }

        let order = match order_for(size) {
            Some(order) if order <= self.max_order => order,
            _ => {
                log::debug!("buddy deallocate({addr:#x}, {size}) failed: larger than the arena");
                return Err(AllocError::InvalidHandle);
            }
        };

        let Some(pos) = self.live.iter().position(|b| b.start == addr) else {
            log::debug!("buddy deallocate({addr:#x}, {size}) failed: no live block there");
            return Err(AllocError::InvalidHandle);
        };
        if self.live[pos].order != order {
            log::debug!(
                "buddy deallocate({addr:#x}, {size}) failed: block was allocated at order {}",
                self.live[pos].order
            );
            return Err(AllocError::InvalidHandle);
        }
        self.live.swap_remove(pos);

        let mut start = addr;
        let mut order = order;
        while order < self.max_order {
            let buddy = start ^ (1 << order);
            let list = &mut self.free_lists[order as usize];
            let Some(pos) = list.iter().position(|b| b.start == buddy) else {
                break;
            };
            list.remove(pos);
            log::trace!("buddy merge {start:#x} + {buddy:#x} at order {order}");
            start = start.min(buddy);
            order += 1;
        }
        self.free_lists[order as usize].push(BuddyBlock::new(start, order));

        debug_assert!(self.is_aligned());
        log::debug!(
            "buddy deallocate({addr:#x}, {size}): free block of order {order} at {start:#x}"
        );
        Ok(())
    }

    /// Size of the arena.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// `log2` of the arena size.
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// The free list for `order`, if the arena has one.
    pub fn free_list(&self, order: u32) -> Option<FreeList<'_>> {
        self.free_lists
            .get(order as usize)
            .map(|blocks| FreeList {
                order,
                blocks: blocks.as_slice(),
            })
    }

    /// Every free list, from order 0 up to `max_order`.
    pub fn free_lists(&self) -> impl Iterator<Item = FreeList<'_>> + '_ {
        self.free_lists
            .iter()
            .zip(0..)
            .map(|(blocks, order)| FreeList {
                order,
                blocks: blocks.as_slice(),
            })
    }

    fn free_blocks(&self) -> impl Iterator<Item = &BuddyBlock> + '_ {
        self.free_lists.iter().flat_map(|list| list.iter())
    }

    /// Is every free block aligned to its own size?
    fn is_aligned(&self) -> bool {
        self.free_lists().all(|list| {
            list.blocks()
                .iter()
                .all(|b| b.order == list.order && b.start % b.size() == 0)
        })
    }

    /// Snapshot the arena's occupancy.
    pub fn stats(&self) -> Stats {
        let free: usize = self.free_blocks().map(BuddyBlock::size).sum();
        let largest_free = self
            .free_lists()
            .filter(|list| !list.blocks().is_empty())
            .map(|list| list.block_size())
            .last()
            .unwrap_or(0);
        Stats {
            capacity: self.total_size,
            used: self.total_size - free,
            free,
            largest_free,
            successes: self.successes,
            failures: self.failures,
        }
    }
}

impl<A: Allocator + Clone> fmt::Debug for BuddyAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("total_size", &self.total_size)
            .field("max_order", &self.max_order)
            .field("free_lists", &self.free_lists().collect::<alloc::vec::Vec<_>>())
            .finish()
    }
}
