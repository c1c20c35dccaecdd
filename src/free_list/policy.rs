//! Placement policies: which free block should satisfy a request.

use super::Block;

/// A placement policy for the free-list allocator.
///
/// Selection is pure: a policy only looks at the ledger and names a block, the
/// allocator performs the split afterwards. The policy can be swapped between
/// any two allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// The lowest-addressed free block that is large enough.
    FirstFit,
    /// The smallest free block that is large enough.
    BestFit,
    /// The largest free block that is large enough.
    WorstFit,
}

impl Policy {
    /// All policies, in declaration order.
    pub const ALL: [Policy; 3] = [Policy::FirstFit, Policy::BestFit, Policy::WorstFit];

    /// Choose a free block of at least `size` units from `blocks`, returning its
    /// index.
    ///
    /// `blocks` must be in address order. Ties between equally-sized candidates
    /// go to the lowest address.
    pub fn select(self, blocks: &[Block], size: usize) -> Option<usize> {
        let mut candidates = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_free() && b.size() >= size);

        match self {
            Policy::FirstFit => candidates.next().map(|(i, _)| i),
            Policy::BestFit => candidates
                .fold(None, |best: Option<(usize, &Block)>, (i, b)| match best {
                    Some((_, best_block)) if best_block.size() <= b.size() => best,
                    _ => Some((i, b)),
                })
                .map(|(i, _)| i),
            Policy::WorstFit => candidates
                .fold(None, |worst: Option<(usize, &Block)>, (i, b)| match worst {
                    Some((_, worst_block)) if worst_block.size() >= b.size() => worst,
                    _ => Some((i, b)),
                })
                .map(|(i, _)| i),
        }
    }

    /// A short, stable name for this policy (`first_fit`, `best_fit`,
    /// `worst_fit`).
    pub fn name(self) -> &'static str {
        match self {
            Policy::FirstFit => "first_fit",
            Policy::BestFit => "best_fit",
            Policy::WorstFit => "worst_fit",
        }
    }
}

impl core::fmt::Display for Policy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
