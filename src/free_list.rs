//! The segmented free-list allocator.
//!
//! The arena `[0, capacity)` is tracked as an address-ordered ledger of
//! blocks, each either free or carrying the id of the allocation occupying it.
//!
//! Allocation is a two-phase affair:
//!
//! 1. The attached [`Policy`] picks a free block that is large enough, without
//!    touching the ledger.
//!
//! 2. The allocator carves the request off the front of that block, leaving
//!    the remainder as a new free block right after it, and stamps the front
//!    with the next id.
//!
//! Deallocation frees the block and immediately coalesces it with whichever
//! neighbours are free, so the ledger never contains two free blocks side by
//! side. This is what lets the external-fragmentation metric mean something:
//! every free block is a maximal free run of the arena.

use crate::{AllocError, AllocResult, Allocator, Global, Stats};

mod ledger;
mod policy;

use ledger::Ledger;
pub use ledger::{Block, BlockId};
pub use policy::Policy;

/// A free-list allocator over an abstract arena of `capacity` units.
///
/// The ledger's own storage comes from the allocator `A`.
pub struct FreeListAllocator<A: Allocator = Global> {
    ledger: Ledger<A>,
    policy: Option<Policy>,
    next_id: u64,
    successes: usize,
    failures: usize,
}

impl FreeListAllocator {
    /// Create an allocator with an empty arena and no policy attached.
    ///
    /// Call [`init`](FreeListAllocator::init) and
    /// [`attach_policy`](FreeListAllocator::attach_policy) before allocating.
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> FreeListAllocator<A> {
    /// Like [`FreeListAllocator::new`], keeping the ledger in `alloc`.
    pub fn new_in(alloc: A) -> Self {
        FreeListAllocator {
            ledger: Ledger::new_in(alloc),
            policy: None,
            next_id: 1,
            successes: 0,
            failures: 0,
        }
    }

    /// Reset the arena to a single free block spanning `[0, capacity)`.
    ///
    /// Outstanding ids become invalid, the id counter restarts at 1 and the
    /// success/failure counters are cleared. The attached policy, if any, is
    /// kept. A capacity of 0 leaves an arena in which nothing fits.
    pub fn init(&mut self, capacity: usize) {
        log::debug!("free-list init: capacity = {capacity}");
        self.ledger.reset(capacity);
        self.next_id = 1;
        self.successes = 0;
        self.failures = 0;
    }

    /// Select the placement policy used by subsequent allocations.
    pub fn attach_policy(&mut self, policy: Policy) {
        log::debug!("free-list policy: {policy}");
        self.policy = Some(policy);
    }

    /// The currently attached placement policy.
    pub fn policy(&self) -> Option<Policy> {
        self.policy
    }

    /// Allocate a block of exactly `size` units.
    ///
    /// Fails with [`AllocError::NoPolicyAttached`] if no policy was attached,
    /// and with [`AllocError::NoFit`] if `size` is zero or no free block is
    /// large enough. A failed allocation leaves the ledger untouched and only
    /// bumps the failure counter.
    pub fn allocate(&mut self, size: usize) -> AllocResult<BlockId> {
        let Some(policy) = self.policy else {
            log::debug!("allocate({size}) failed: no placement policy attached");
            self.failures += 1;
            return Err(AllocError::NoPolicyAttached);
        };

        if size == 0 {
            log::debug!("allocate(0) failed: zero-sized allocations are not supported");
            self.failures += 1;
            return Err(AllocError::NoFit);
        }

        let Some(index) = policy.select(self.ledger.blocks(), size) else {
            log::debug!(
                "allocate({size}) failed: no free block fits (policy = {policy}, largest free = {})",
                self.ledger.largest_free()
            );
            self.failures += 1;
            return Err(AllocError::NoFit);
        };

        if self.ledger.blocks()[index].size() > size {
            self.ledger.split(index, size);
        }

        let id = BlockId::new(self.next_id);
        self.next_id += 1;
        self.ledger.set_used(index, id);
        self.successes += 1;

        debug_assert!(self.ledger.is_consistent());
        log::debug!(
            "allocate({size}) -> id {id} at {:#x} (policy = {policy})",
            self.ledger.blocks()[index].start()
        );
        Ok(id)
    }

    /// Free the block allocated under `id` and coalesce it with its free
    /// neighbours.
    ///
    /// Fails with [`AllocError::InvalidHandle`] if no live block carries `id`,
    /// which includes ids that were already freed.
    pub fn deallocate(&mut self, id: BlockId) -> AllocResult {
        let Some(index) = self.ledger.find_used(id) else {
            log::debug!("deallocate(id {id}) failed: no live block with that id");
            return Err(AllocError::InvalidHandle);
        };

        let block = self.ledger.blocks()[index];
        self.ledger.set_free(index);
        let merged = self.ledger.coalesce(index);

        log::debug!(
            "deallocate(id {id}): freed {} units at {:#x}, free run now {:?}",
            block.size(),
            block.start(),
            self.ledger.blocks()[merged].range()
        );
        Ok(())
    }

    /// The block currently allocated under `id`.
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.ledger
            .find_used(id)
            .map(|index| &self.ledger.blocks()[index])
    }

    /// The ledger, in address order.
    ///
    /// The blocks exactly tile `[0, capacity)` and no two neighbours are both
    /// free.
    pub fn blocks(&self) -> &[Block] {
        self.ledger.blocks()
    }

    /// Size of the arena.
    pub fn capacity(&self) -> usize {
        self.ledger.capacity()
    }

    /// Sum of the sizes of all used blocks.
    pub fn used(&self) -> usize {
        self.ledger.used()
    }

    /// Units not currently allocated.
    pub fn free(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Percentage of the arena in use.
    pub fn utilization(&self) -> f64 {
        self.stats().utilization()
    }

    /// Percentage by which the free memory is scattered; see
    /// [`Stats::external_fragmentation`].
    pub fn external_fragmentation(&self) -> f64 {
        self.stats().external_fragmentation()
    }

    /// Number of successful allocations since the last `init`.
    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Number of refused allocations since the last `init`.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Snapshot the arena's occupancy.
    pub fn stats(&self) -> Stats {
        let capacity = self.capacity();
        let used = self.used();
        Stats {
            capacity,
            used,
            free: capacity - used,
            largest_free: self.ledger.largest_free(),
            successes: self.successes,
            failures: self.failures,
        }
    }
}

impl<A: Allocator> core::fmt::Debug for FreeListAllocator<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("capacity", &self.capacity())
            .field("policy", &self.policy)
            .field("next_id", &self.next_id)
            .field("blocks", &self.blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(capacity: usize, policy: Policy) -> FreeListAllocator {
        let mut a = FreeListAllocator::new();
        a.init(capacity);
        a.attach_policy(policy);
        a
    }

    #[test]
    fn allocate_without_policy_fails() {
        let mut a = FreeListAllocator::new();
        a.init(100);
        assert_eq!(a.allocate(10), Err(AllocError::NoPolicyAttached));
        assert_eq!(a.failures(), 1);
        assert_eq!(a.blocks(), &[Block::free(0, 100)]);
    }

    #[test]
    fn allocate_splits_and_assigns_increasing_ids() {
        let mut a = allocator(1024, Policy::FirstFit);
        let x = a.allocate(100).unwrap();
        let y = a.allocate(200).unwrap();
        assert_eq!(x, BlockId::new(1));
        assert_eq!(y, BlockId::new(2));
        assert_eq!(
            a.blocks(),
            &[
                Block::used(0, 100, x),
                Block::used(100, 200, y),
                Block::free(300, 724),
            ]
        );
        assert_eq!(a.used(), 300);
        assert_eq!(a.free(), 724);
        assert_eq!(a.successes(), 2);
    }

    #[test]
    fn exact_fit_does_not_split() {
        let mut a = allocator(64, Policy::BestFit);
        let id = a.allocate(64).unwrap();
        assert_eq!(a.blocks(), &[Block::used(0, 64, id)]);
        assert_eq!(a.allocate(1), Err(AllocError::NoFit));
        assert_eq!(a.external_fragmentation(), 0.0);
        assert_eq!(a.utilization(), 100.0);
    }

    #[test]
    fn zero_size_and_empty_arena_are_refused() {
        let mut a = allocator(100, Policy::FirstFit);
        assert_eq!(a.allocate(0), Err(AllocError::NoFit));

        a.init(0);
        assert!(a.blocks().is_empty());
        assert_eq!(a.allocate(1), Err(AllocError::NoFit));
        assert_eq!(a.utilization(), 0.0);
        assert_eq!(a.external_fragmentation(), 0.0);
    }

    #[test]
    fn deallocate_coalesces_with_both_neighbours() {
        let mut a = allocator(300, Policy::FirstFit);
        let x = a.allocate(100).unwrap();
        let y = a.allocate(100).unwrap();
        let z = a.allocate(100).unwrap();

        a.deallocate(x).unwrap();
        a.deallocate(z).unwrap();
        assert_eq!(
            a.blocks(),
            &[
                Block::free(0, 100),
                Block::used(100, 100, y),
                Block::free(200, 100),
            ]
        );

        a.deallocate(y).unwrap();
        assert_eq!(a.blocks(), &[Block::free(0, 300)]);
    }

    #[test]
    fn allocate_then_free_restores_the_ledger() {
        for policy in Policy::ALL {
            let mut a = allocator(500, policy);
            let x = a.allocate(100).unwrap();
            let _y = a.allocate(100).unwrap();
            a.deallocate(x).unwrap();
            let before = a.blocks().to_vec();

            let z = a.allocate(40).unwrap();
            a.deallocate(z).unwrap();
            assert_eq!(a.blocks(), &before[..], "{policy}");
        }
    }

    #[test]
    fn deallocate_rejects_unknown_and_stale_ids() {
        let mut a = allocator(100, Policy::FirstFit);
        let x = a.allocate(10).unwrap();
        assert_eq!(a.deallocate(BlockId::new(42)), Err(AllocError::InvalidHandle));
        a.deallocate(x).unwrap();
        assert_eq!(a.deallocate(x), Err(AllocError::InvalidHandle));
    }

    #[test]
    fn ids_are_not_reused_after_free() {
        let mut a = allocator(100, Policy::FirstFit);
        let x = a.allocate(10).unwrap();
        a.deallocate(x).unwrap();
        let y = a.allocate(10).unwrap();
        assert!(y > x);
        assert_eq!(a.block(y).map(Block::start), Some(0));
        assert!(a.block(x).is_none());
    }

    #[test]
    fn fragmentation_with_a_hole_before_the_tail() {
        let mut a = allocator(1000, Policy::FirstFit);
        let hole = a.allocate(300).unwrap();
        let _kept = a.allocate(200).unwrap();
        a.deallocate(hole).unwrap();

        let stats = a.stats();
        assert_eq!(stats.used, 200);
        assert_eq!(stats.free, 800);
        assert_eq!(stats.largest_free, 500);
        assert_eq!(a.external_fragmentation(), 37.5);
        assert_eq!(a.utilization(), 20.0);
    }

    #[test]
    fn policy_can_change_mid_sequence() {
        let mut a = allocator(260, Policy::FirstFit);
        // free 50 | used 10 | free 30 | used 10 | free 100 | used 10 | free 50
        let ids: [BlockId; 6] = core::array::from_fn(|i| {
            a.allocate([50, 10, 30, 10, 100, 10][i]).unwrap()
        });
        a.deallocate(ids[0]).unwrap();
        a.deallocate(ids[2]).unwrap();
        a.deallocate(ids[4]).unwrap();

        a.attach_policy(Policy::BestFit);
        let best = a.allocate(20).unwrap();
        assert_eq!(a.block(best).map(Block::start), Some(60));

        a.attach_policy(Policy::WorstFit);
        let worst = a.allocate(20).unwrap();
        assert_eq!(a.block(worst).map(Block::start), Some(100));

        a.attach_policy(Policy::FirstFit);
        let first = a.allocate(20).unwrap();
        assert_eq!(a.block(first).map(Block::start), Some(0));
    }

    #[test]
    fn init_resets_ids_and_counters_but_keeps_policy() {
        let mut a = allocator(100, Policy::WorstFit);
        a.allocate(10).unwrap();
        a.allocate(1000).unwrap_err();
        a.init(50);
        assert_eq!(a.successes(), 0);
        assert_eq!(a.failures(), 0);
        assert_eq!(a.policy(), Some(Policy::WorstFit));
        assert_eq!(a.allocate(5), Ok(BlockId::new(1)));
    }
}
