//! Shared fuzzing and testing infrastructure for `memsim`.
//!
//! An [`Ops`] is a sequence of allocation requests addressed to numbered
//! slots. Interpreting it against either allocator model checks, after every
//! step, that the arena is still a consistent partition and that the
//! allocator did what its contract says it would.

use memsim::{AllocError, Block, BlockId, BuddyAllocator, FreeListAllocator, Policy};
use mutatis::{DefaultMutate, Generate, Mutate};
use std::{cmp::Reverse, collections::BTreeMap};

/// The number of distinct slots ops refer to. Keeping this small makes frees
/// and reallocations of the same slot common.
const NUM_SLOTS: usize = 16;

/// The largest allocation size we generate from scratch. Mutation can still
/// produce anything up to `u32::MAX`, which exercises the failure paths.
const MAX_GENERATED_SIZE: usize = 256;

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Attach `Policy::ALL[policy % 3]`. Ignored by the buddy model.
    SetPolicy { policy: u8 },
    /// Allocate `size` units into `slot`, freeing whatever was there first.
    Alloc { slot: u32, size: u32 },
    /// Free the allocation in `slot`, if any.
    Free { slot: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::SetPolicy {
                    policy: ctx.rng().gen_index(Policy::ALL.len()).unwrap() as u8,
                })
            },
            |ctx| {
                Ok(Op::Alloc {
                    slot: ctx.rng().gen_index(NUM_SLOTS).unwrap() as u32,
                    size: ctx.rng().gen_index(MAX_GENERATED_SIZE + 1).unwrap() as u32,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    slot: ctx.rng().gen_index(NUM_SLOTS).unwrap() as u32,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        mutatis::mutators::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_slots(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { slot, .. } => Some((i, *slot)),
                _ => None,
            })
        }

        // Retarget an operation to a slot that some allocation uses.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_slots(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_slot) = alloc_positions_and_slots(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { slot, .. } | Op::Free { slot } => *slot = new_slot,
                    Op::SetPolicy { .. } => {}
                }
            }
            Ok(())
        })?;

        // Free an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_slots(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, slot) = alloc_positions_and_slots(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { slot });
                }
                Ok(())
            })?;
        }

        // Switch placement policy somewhere.
        if !c.shrink() {
            c.mutation(|ctx| {
                let index = ctx.rng().gen_index(ops.ops.len() + 1).unwrap();
                let policy = ctx.rng().gen_index(Policy::ALL.len()).unwrap() as u8;
                ops.ops.insert(index, Op::SetPolicy { policy });
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

fn policy_for(policy: u8) -> Policy {
    Policy::ALL[policy as usize % Policy::ALL.len()]
}

/// Where `policy` should place `size` units, worked out independently of
/// `Policy::select`.
fn expected_start(policy: Policy, blocks: &[Block], size: usize) -> Option<usize> {
    let mut fits = blocks.iter().filter(|b| b.is_free() && b.size() >= size);
    match policy {
        Policy::FirstFit => fits.next().map(Block::start),
        Policy::BestFit => fits.min_by_key(|b| (b.size(), b.start())).map(Block::start),
        Policy::WorstFit => fits
            .max_by_key(|b| (b.size(), Reverse(b.start())))
            .map(Block::start),
    }
}

/// Check that `blocks` tile `[0, capacity)` with no two neighbouring free
/// blocks, and that the used blocks are exactly the live allocations.
fn check_ledger(
    blocks: &[Block],
    capacity: usize,
    live: &BTreeMap<u32, (BlockId, usize)>,
) -> Result<(), String> {
    let mut expected_start = 0;
    for (i, block) in blocks.iter().enumerate() {
        ensure!(
            block.start() == expected_start,
            "block {i} starts at {} instead of {expected_start}",
            block.start()
        );
        ensure!(block.size() > 0, "block {i} is empty");
        if i > 0 {
            ensure!(
                !(block.is_free() && blocks[i - 1].is_free()),
                "blocks {} and {i} are both free",
                i - 1
            );
        }
        expected_start = block.end();
    }
    ensure!(
        expected_start == capacity,
        "blocks end at {expected_start} instead of {capacity}"
    );

    let used: Vec<(BlockId, usize)> = blocks
        .iter()
        .filter_map(|b| b.id().map(|id| (id, b.size())))
        .collect();
    ensure!(
        used.len() == live.len(),
        "{} used blocks but {} live allocations",
        used.len(),
        live.len()
    );
    for (slot, (id, size)) in live {
        ensure!(
            used.contains(&(*id, *size)),
            "slot {slot}: no used block of size {size} with id {id}"
        );
    }
    Ok(())
}

/// Check the buddy invariants: every free block is aligned to its order, and
/// the free blocks and live allocations exactly cover the arena between them.
fn check_buddy(buddy: &BuddyAllocator, live: &BTreeMap<u32, (usize, usize)>) -> Result<(), String> {
    let mut regions = Vec::new();
    for list in buddy.free_lists() {
        for block in list.blocks() {
            ensure!(
                block.order() == list.order(),
                "block {:#x} of order {} on the order-{} list",
                block.start(),
                block.order(),
                list.order()
            );
            ensure!(
                block.start() % block.size() == 0,
                "free block {:#x} is not aligned to its size {}",
                block.start(),
                block.size()
            );
            regions.push((block.start(), block.size()));
        }
    }
    for (addr, size) in live.values() {
        let rounded = size.next_power_of_two();
        ensure!(
            addr % rounded == 0,
            "live block {addr:#x} is not aligned to its size {rounded}"
        );
        regions.push((*addr, rounded));
    }

    regions.sort_unstable();
    let mut expected_start = 0;
    for (start, size) in regions {
        ensure!(
            start == expected_start,
            "region at {start:#x} where {expected_start:#x} was expected (gap or overlap)"
        );
        expected_start = start + size;
    }
    ensure!(
        expected_start == buddy.total_size(),
        "regions end at {expected_start:#x} instead of {:#x}",
        buddy.total_size()
    );
    Ok(())
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last op, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these ops against both allocation models.
    pub fn run(&self, capacity: usize) -> Result<(), String> {
        self.run_free_list(capacity)?;
        self.run_buddy(capacity.next_power_of_two())
    }

    /// Run these ops against a free-list allocator of the given capacity,
    /// starting with first-fit placement.
    pub fn run_free_list(&self, capacity: usize) -> Result<(), String> {
        log::debug!("========== Running ops: free list, capacity {capacity} ==========");

        let mut heap = FreeListAllocator::new();
        heap.init(capacity);
        heap.attach_policy(Policy::FirstFit);

        let mut live: BTreeMap<u32, (BlockId, usize)> = BTreeMap::new();
        let mut last_id: Option<BlockId> = None;
        let mut freed: Vec<BlockId> = Vec::new();

        let free = |heap: &mut FreeListAllocator,
                    freed: &mut Vec<BlockId>,
                    slot: u32,
                    id: BlockId|
         -> Result<(), String> {
            log::debug!("freeing slot {slot} -> id {id}");
            let result = heap.deallocate(id);
            ensure!(result.is_ok(), "freeing live id {id} failed: {result:?}");
            freed.push(id);
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::SetPolicy { policy } => heap.attach_policy(policy_for(policy)),

                Op::Alloc { slot, size } => {
                    if let Some((id, _)) = live.remove(&slot) {
                        free(&mut heap, &mut freed, slot, id)?;
                        check_ledger(heap.blocks(), capacity, &live)?;
                    }

                    let size = size as usize;
                    let policy = heap.policy().unwrap();
                    let before = heap.blocks().to_vec();
                    let expected = if size == 0 {
                        None
                    } else {
                        expected_start(policy, &before, size)
                    };

                    match heap.allocate(size) {
                        Ok(id) => {
                            let start = heap.block(id).map(Block::start);
                            ensure!(
                                expected.is_some() && start == expected,
                                "{policy} placed {size} units at {start:?}, expected {expected:?}"
                            );
                            ensure!(
                                last_id.map_or(true, |last| id > last),
                                "id {id} does not follow {last_id:?}"
                            );
                            last_id = Some(id);
                            live.insert(slot, (id, size));
                        }
                        Err(e) => {
                            ensure!(
                                e == AllocError::NoFit,
                                "allocating {size} units failed with {e:?}"
                            );
                            ensure!(
                                expected.is_none(),
                                "{policy} refused {size} units that fit at {expected:?}"
                            );
                            ensure!(
                                heap.blocks() == &before[..],
                                "failed allocation changed the ledger"
                            );
                        }
                    }
                }

                Op::Free { slot } => match live.remove(&slot) {
                    Some((id, _)) => free(&mut heap, &mut freed, slot, id)?,
                    None => {
                        // Nothing live here: a stale id must be refused.
                        if let Some(&stale) = freed.last() {
                            let before = heap.blocks().to_vec();
                            let result = heap.deallocate(stale);
                            ensure!(
                                result == Err(AllocError::InvalidHandle),
                                "double free of id {stale} returned {result:?}"
                            );
                            ensure!(
                                heap.blocks() == &before[..],
                                "failed deallocation changed the ledger"
                            );
                        }
                    }
                },
            }

            check_ledger(heap.blocks(), capacity, &live)?;
        }

        // Finally, free everything and check we are back to a single block.
        for (slot, (id, _)) in std::mem::take(&mut live) {
            free(&mut heap, &mut freed, slot, id)?;
        }
        check_ledger(heap.blocks(), capacity, &live)?;
        ensure!(
            heap.blocks().len() == usize::from(capacity > 0),
            "arena not fully coalesced after freeing everything: {:?}",
            heap.blocks()
        );
        ensure!(heap.external_fragmentation() == 0.0, "fragmented empty arena");

        Ok(())
    }

    /// Run these ops against a buddy allocator over `size` units, which must
    /// be a power of two.
    pub fn run_buddy(&self, size: usize) -> Result<(), String> {
        log::debug!("========== Running ops: buddy, size {size} ==========");

        let mut buddy = BuddyAllocator::new();
        ensure!(buddy.init(size).is_ok(), "{size} is not a power of two");

        let mut live: BTreeMap<u32, (usize, usize)> = BTreeMap::new();

        let free = |buddy: &mut BuddyAllocator, slot: u32, addr: usize, size: usize| {
            log::debug!("freeing slot {slot} -> {addr:#x} ({size} units)");
            let result = buddy.deallocate(addr, size);
            ensure!(
                result.is_ok(),
                "freeing live block {addr:#x} failed: {result:?}"
            );
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::SetPolicy { .. } => {}

                Op::Alloc { slot, size } => {
                    if let Some((addr, size)) = live.remove(&slot) {
                        free(&mut buddy, slot, addr, size)?;
                        check_buddy(&buddy, &live)?;
                    }

                    let size = size as usize;
                    let expected = if size == 0 || size > buddy.total_size() {
                        None
                    } else {
                        let order = size.next_power_of_two().trailing_zeros();
                        buddy
                            .free_lists()
                            .skip(order as usize)
                            .find_map(|list| list.addrs().next())
                    };

                    match buddy.allocate(size) {
                        Ok(addr) => {
                            ensure!(
                                Some(addr) == expected,
                                "allocated {size} units at {addr:#x}, expected {expected:?}"
                            );
                            live.insert(slot, (addr, size));
                        }
                        Err(e) => {
                            ensure!(
                                e == AllocError::NoFit,
                                "allocating {size} units failed with {e:?}"
                            );
                            ensure!(
                                expected.is_none(),
                                "refused {size} units that fit at {expected:?}"
                            );
                        }
                    }
                }

                Op::Free { slot } => {
                    if let Some((addr, size)) = live.remove(&slot) {
                        free(&mut buddy, slot, addr, size)?;
                    }
                }
            }

            check_buddy(&buddy, &live)?;
        }

        // Finally, free everything: the arena must merge back into one block.
        while let Some((slot, (addr, size))) = live.pop_first() {
            free(&mut buddy, slot, addr, size)?;
            check_buddy(&buddy, &live)?;
        }
        for list in buddy.free_lists() {
            let expected: &[usize] = if list.order() == buddy.max_order() {
                &[0]
            } else {
                &[]
            };
            ensure!(
                list.addrs().eq(expected.iter().copied()),
                "order {} holds {:?} after freeing everything",
                list.order(),
                list.blocks()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple alloc/free pair.
            Ops::new([Op::Alloc { slot: 0, size: 8 }, Op::Free { slot: 0 }]),
            // Zero-sized and oversized requests.
            Ops::new([
                Op::Alloc { slot: 0, size: 0 },
                Op::Alloc {
                    slot: 1,
                    size: u32::MAX,
                },
            ]),
            // Double free.
            Ops::new([
                Op::Alloc { slot: 0, size: 8 },
                Op::Free { slot: 0 },
                Op::Free { slot: 0 },
            ]),
            // Three holes of different sizes, then one request per policy.
            Ops::new([
                Op::Alloc { slot: 0, size: 50 },
                Op::Alloc { slot: 1, size: 10 },
                Op::Alloc { slot: 2, size: 30 },
                Op::Alloc { slot: 3, size: 10 },
                Op::Alloc { slot: 4, size: 100 },
                Op::Alloc { slot: 5, size: 10 },
                Op::Free { slot: 0 },
                Op::Free { slot: 2 },
                Op::Free { slot: 4 },
                Op::SetPolicy { policy: 1 },
                Op::Alloc { slot: 6, size: 20 },
                Op::SetPolicy { policy: 2 },
                Op::Alloc { slot: 7, size: 20 },
                Op::SetPolicy { policy: 0 },
                Op::Alloc { slot: 8, size: 20 },
            ]),
            // Scattered blocks still live when the run ends.
            Ops::new([
                Op::Alloc { slot: 0, size: 16 },
                Op::Alloc { slot: 1, size: 16 },
                Op::Alloc { slot: 2, size: 16 },
                Op::Alloc { slot: 3, size: 16 },
                Op::Alloc { slot: 4, size: 64 },
                Op::Free { slot: 1 },
                Op::Free { slot: 3 },
            ]),
        ];

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            mutatis::mutators::default::<Ops>(),
            seed_corpus,
            |ops| ops.run(1000),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn policies_place_requests_as_expected() {
        let _ = env_logger::try_init();

        let mut heap = FreeListAllocator::new();
        heap.init(260);
        heap.attach_policy(Policy::FirstFit);
        let sizes = [50, 10, 30, 10, 100, 10];
        let ids: Vec<BlockId> = sizes.iter().map(|&s| heap.allocate(s).unwrap()).collect();
        for i in [0, 2, 4] {
            heap.deallocate(ids[i]).unwrap();
        }

        let blocks = heap.blocks();
        assert_eq!(expected_start(Policy::FirstFit, blocks, 20), Some(0));
        assert_eq!(expected_start(Policy::BestFit, blocks, 20), Some(60));
        assert_eq!(expected_start(Policy::WorstFit, blocks, 20), Some(100));
        for policy in Policy::ALL {
            assert_eq!(
                policy.select(blocks, 20).map(|i| blocks[i].start()),
                expected_start(policy, blocks, 20)
            );
        }
    }

    #[test]
    fn buddy_run_frees_leftover_blocks_one_at_a_time() {
        let _ = env_logger::try_init();

        let ops = Ops::new([
            Op::Alloc { slot: 0, size: 50 },
            Op::Alloc { slot: 1, size: 10 },
            Op::Alloc { slot: 2, size: 30 },
            Op::Alloc { slot: 3, size: 10 },
            Op::Alloc { slot: 4, size: 100 },
            Op::Alloc { slot: 5, size: 10 },
            Op::Free { slot: 0 },
            Op::Free { slot: 2 },
            Op::Free { slot: 4 },
            Op::Alloc { slot: 6, size: 20 },
        ]);
        ops.run_buddy(1024).unwrap();

        let scattered = Ops::new((0..8).map(|slot| Op::Alloc { slot, size: 8 }).chain(
            [1, 2, 5, 6].map(|slot| Op::Free { slot }),
        ));
        scattered.run_buddy(64).unwrap();
    }

    #[test]
    fn buddy_fills_and_drains_in_any_order() {
        let _ = env_logger::try_init();

        for chunk in [1u32, 5, 16, 64] {
            let rounded = chunk.next_power_of_two();
            let count = 64 / rounded;
            let allocs = (0..count).map(|slot| Op::Alloc { slot, size: chunk });
            let forward = (0..count).map(|slot| Op::Free { slot });
            let backward = (0..count).rev().map(|slot| Op::Free { slot });

            Ops::new(allocs.clone().chain(forward)).run_buddy(64).unwrap();
            Ops::new(allocs.chain(backward)).run_buddy(64).unwrap();
        }
    }
}
