//! One arena, two allocation models, switchable at runtime.
//!
//! This is the surface a command front end drives: `init`, pick a model,
//! `allocate` / `deallocate` by id, and read back stats. It adds no allocation
//! logic of its own beyond remembering buddy allocations by id, so that both
//! models can be freed the same way.

use crate::{
    AllocError, AllocResult, Allocator, Block, BlockId, BuddyAllocator, FreeListAllocator,
    Global, Policy, Stats, Vec,
};

/// The allocation model a [`Simulator`] routes requests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The free-list allocator, with its currently attached policy.
    FreeList,
    /// The buddy allocator.
    Buddy,
}

/// A successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The id to pass to [`Simulator::deallocate`].
    pub id: BlockId,
    /// Where the allocation starts in the arena.
    pub start: usize,
}

/// A buddy allocation remembered so it can be freed by id.
#[derive(Debug, Clone, Copy)]
struct BuddyAllocation {
    id: BlockId,
    addr: usize,
    size: usize,
}

/// A free-list allocator and a buddy allocator over the same nominal capacity.
pub struct Simulator<A: Allocator + Clone = Global> {
    free_list: FreeListAllocator<A>,
    buddy: BuddyAllocator<A>,
    buddy_allocs: Vec<BuddyAllocation, A>,
    next_buddy_id: u64,
    mode: Mode,
}

impl Simulator {
    /// Create a simulator with an empty arena, in free-list mode with no policy
    /// attached.
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator + Clone> Simulator<A> {
    /// Like [`Simulator::new`], keeping all bookkeeping in `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Simulator {
            free_list: FreeListAllocator::new_in(alloc.clone()),
            buddy: BuddyAllocator::new_in(alloc.clone()),
            buddy_allocs: Vec::new_in(alloc),
            next_buddy_id: 1,
            mode: Mode::FreeList,
        }
    }

    /// Reset both models to an empty arena of `capacity` units and go back to
    /// free-list mode.
    ///
    /// The buddy model only becomes available if `capacity` is a power of two;
    /// otherwise it is left uninitialized and
    /// [`attach_buddy`](Simulator::attach_buddy) will fail.
    pub fn init(&mut self, capacity: usize) {
        self.free_list.init(capacity);
        if self.buddy.init(capacity).is_err() {
            self.buddy = BuddyAllocator::new_in(self.buddy_allocs.allocator().clone());
        }
        self.buddy_allocs.clear();
        self.next_buddy_id = 1;
        self.mode = Mode::FreeList;
    }

    /// Switch to the free-list model using `policy`.
    pub fn attach_policy(&mut self, policy: Policy) {
        self.free_list.attach_policy(policy);
        self.mode = Mode::FreeList;
    }

    /// Switch to the buddy model.
    ///
    /// Fails with [`AllocError::NotPowerOfTwo`] if the arena's capacity is not
    /// a power of two; the mode is unchanged in that case.
    pub fn attach_buddy(&mut self) -> AllocResult {
        if !self.buddy.is_initialized() {
            return Err(AllocError::NotPowerOfTwo);
        }
        self.mode = Mode::Buddy;
        Ok(())
    }

    /// The model currently receiving requests.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Allocate `size` units with the current model.
    pub fn allocate(&mut self, size: usize) -> AllocResult<Allocation> {
        match self.mode {
            Mode::FreeList => {
                let id = self.free_list.allocate(size)?;
                let block = self.free_list.block(id);
                debug_assert!(block.is_some(), "fresh id {id} has no block");
                let start = block.map_or(0, Block::start);
                Ok(Allocation { id, start })
            }
            Mode::Buddy => {
                let addr = self.buddy.allocate(size)?;
                let id = BlockId::new(self.next_buddy_id);
                self.next_buddy_id += 1;
                self.buddy_allocs.push(BuddyAllocation { id, addr, size });
                Ok(Allocation { id, start: addr })
            }
        }
    }

    /// Free the allocation `id` made under the current model.
    pub fn deallocate(&mut self, id: BlockId) -> AllocResult {
        match self.mode {
            Mode::FreeList => self.free_list.deallocate(id),
            Mode::Buddy => {
                let index = self
                    .buddy_allocs
                    .iter()
                    .position(|a| a.id == id)
                    .ok_or(AllocError::InvalidHandle)?;
                let BuddyAllocation { addr, size, .. } = self.buddy_allocs[index];
                self.buddy.deallocate(addr, size)?;
                self.buddy_allocs.swap_remove(index);
                Ok(())
            }
        }
    }

    /// Occupancy of the current model's arena.
    pub fn stats(&self) -> Stats {
        match self.mode {
            Mode::FreeList => self.free_list.stats(),
            Mode::Buddy => self.buddy.stats(),
        }
    }

    /// The free-list model, for inspecting its ledger.
    pub fn free_list(&self) -> &FreeListAllocator<A> {
        &self.free_list
    }

    /// The buddy model, for inspecting its free lists.
    pub fn buddy(&self) -> &BuddyAllocator<A> {
        &self.buddy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_before_choosing_a_policy_fails() {
        let mut sim = Simulator::new();
        sim.init(1024);
        assert_eq!(sim.allocate(10), Err(AllocError::NoPolicyAttached));
        assert_eq!(sim.stats().failures, 1);
    }

    #[test]
    fn free_list_mode_reports_start_addresses() {
        let mut sim = Simulator::new();
        sim.init(1024);
        sim.attach_policy(Policy::FirstFit);
        let a = sim.allocate(100).unwrap();
        let b = sim.allocate(200).unwrap();
        assert_eq!((a.id.get(), a.start), (1, 0));
        assert_eq!((b.id.get(), b.start), (2, 100));

        sim.deallocate(a.id).unwrap();
        assert_eq!(sim.deallocate(a.id), Err(AllocError::InvalidHandle));
        assert_eq!(sim.stats().used, 200);
    }

    #[test]
    fn buddy_mode_frees_by_id() {
        let mut sim = Simulator::new();
        sim.init(128);
        sim.attach_buddy().unwrap();
        assert_eq!(sim.mode(), Mode::Buddy);

        let a = sim.allocate(10).unwrap();
        let b = sim.allocate(30).unwrap();
        assert_eq!((a.id.get(), a.start), (1, 0));
        assert_eq!((b.id.get(), b.start), (2, 32));
        assert_eq!(sim.stats().used, 48);

        sim.deallocate(b.id).unwrap();
        sim.deallocate(a.id).unwrap();
        assert_eq!(sim.deallocate(a.id), Err(AllocError::InvalidHandle));
        assert_eq!(sim.stats().free, 128);
        assert_eq!(sim.allocate(130), Err(AllocError::NoFit));
    }

    #[test]
    fn buddy_mode_needs_a_power_of_two_arena() {
        let mut sim = Simulator::new();
        sim.init(100);
        sim.attach_policy(Policy::BestFit);
        assert_eq!(sim.attach_buddy(), Err(AllocError::NotPowerOfTwo));
        assert_eq!(sim.mode(), Mode::FreeList);

        sim.init(64);
        sim.attach_buddy().unwrap();
        sim.init(100);
        assert_eq!(sim.mode(), Mode::FreeList);
        assert_eq!(sim.attach_buddy(), Err(AllocError::NotPowerOfTwo));
    }

    #[test]
    fn init_forgets_buddy_allocations() {
        let mut sim = Simulator::new();
        sim.init(64);
        sim.attach_buddy().unwrap();
        let a = sim.allocate(8).unwrap();
        sim.init(64);
        sim.attach_buddy().unwrap();
        assert_eq!(sim.deallocate(a.id), Err(AllocError::InvalidHandle));
        assert_eq!(sim.allocate(8).map(|a| a.id.get()), Ok(1));
    }
}
