//! Occupancy and fragmentation metrics shared by both allocation models.

/// A point-in-time summary of an allocator's arena.
///
/// All sizes are in the same abstract units as the arena capacity. The
/// percentages are derived on demand, so a `Stats` taken before a sequence of
/// operations stays valid as a record of that moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Size of the whole arena.
    pub capacity: usize,
    /// Bytes currently handed out.
    pub used: usize,
    /// Bytes not handed out, `capacity - used`.
    pub free: usize,
    /// Size of the largest single free region.
    pub largest_free: usize,
    /// Allocation attempts that succeeded since the last `init`.
    pub successes: usize,
    /// Allocation attempts that were refused since the last `init`.
    pub failures: usize,
}

impl Stats {
    /// Percentage of the arena in use, or `0.0` for an empty arena.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64 * 100.0
    }

    /// How scattered the free memory is, as a percentage.
    ///
    /// `(1 - largest_free / free) * 100`: zero when all free memory is one
    /// region (or there is none), approaching 100 as it splinters.
    pub fn external_fragmentation(&self) -> f64 {
        if self.free == 0 {
            return 0.0;
        }
        (1.0 - self.largest_free as f64 / self.free as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragmentation_of_two_free_regions() {
        let stats = Stats {
            capacity: 1000,
            used: 200,
            free: 800,
            largest_free: 500,
            ..Stats::default()
        };
        assert_eq!(stats.external_fragmentation(), 37.5);
        assert_eq!(stats.utilization(), 20.0);
    }

    #[test]
    fn empty_arena_reports_zero() {
        let stats = Stats::default();
        assert_eq!(stats.utilization(), 0.0);
        assert_eq!(stats.external_fragmentation(), 0.0);
    }
}
