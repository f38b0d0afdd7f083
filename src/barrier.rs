use crate::{error::Error, warp::ActiveMask};
use bitvec::{array::BitArray, BitArr};

/// Warps per block are bounded by the barrier warp mask width.
pub const MAX_WARPS_PER_BLOCK: usize = 64;

/// Bitmap over the warps of one block.
pub type WarpMask = BitArr!(for MAX_WARPS_PER_BLOCK, in u64);

/// How a warp announces itself at a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalKind {
    /// `barrier N`: arrive and stall until release.
    Sync,
    /// `arrive N`: record arrival without stalling.
    Arrive,
}

/// Emitted when the full expected set has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub barrier_id: u32,
    pub block_id: u32,
    /// Released warps as block-relative indices, ascending.
    pub warps: Vec<usize>,
    /// Thread masks the warps carried when they arrived, indexed like
    /// `warps`.
    pub thread_masks: Vec<ActiveMask>,
    /// Summed cycles the stalled warps spent waiting.
    pub wait_cycles: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    barrier_id: u32,
    block_id: u32,
    arrived: WarpMask,
    expected: WarpMask,
    /// Warps that stalled on this entry (sync arrivals and waiters).
    stalled: WarpMask,
    thread_masks: Box<[ActiveMask]>,
    arrival_cycle: Box<[u64]>,
    active: bool,
}

impl Entry {
    fn inert(warps_per_block: usize) -> Self {
        Self {
            barrier_id: 0,
            block_id: 0,
            arrived: BitArray::ZERO,
            expected: BitArray::ZERO,
            stalled: BitArray::ZERO,
            thread_masks: vec![BitArray::ZERO; warps_per_block].into_boxed_slice(),
            arrival_cycle: vec![0; warps_per_block].into_boxed_slice(),
            active: false,
        }
    }
}

/// Tracks arrivals per `(barrier_id, block_id)` identity.
///
/// Entries are allocated on first arrival and freed as soon as the
/// release is emitted, so a `wait` that shows up after the release finds
/// no entry and proceeds.
#[derive(Debug)]
pub struct BarrierSet {
    warps_per_block: usize,
    entries: Vec<Entry>,
    pub stats: stats::Barriers,
}

impl BarrierSet {
    #[must_use]
    pub fn new(max_barriers: usize, warps_per_block: usize) -> Self {
        debug_assert!(warps_per_block <= MAX_WARPS_PER_BLOCK);
        Self {
            warps_per_block,
            entries: (0..max_barriers).map(|_| Entry::inert(warps_per_block)).collect(),
            stats: stats::Barriers::default(),
        }
    }

    fn expected_mask(&self) -> WarpMask {
        let mut mask: WarpMask = BitArray::ZERO;
        for warp in 0..self.warps_per_block {
            mask.set(warp, true);
        }
        mask
    }

    fn find(&self, barrier_id: u32, block_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.active && e.barrier_id == barrier_id && e.block_id == block_id)
    }

    /// Whether a live entry exists for the identity.
    #[must_use]
    pub fn is_live(&self, barrier_id: u32, block_id: u32) -> bool {
        self.find(barrier_id, block_id).is_some()
    }

    /// Record one warp's arrival.
    ///
    /// Returns the release when this arrival completes the expected set.
    pub fn arrive(
        &mut self,
        barrier_id: u32,
        block_id: u32,
        warp_in_block: usize,
        thread_mask: ActiveMask,
        kind: ArrivalKind,
        now: u64,
    ) -> Result<Option<Release>, Error> {
        debug_assert!(warp_in_block < self.warps_per_block);
        let index = match self.find(barrier_id, block_id) {
            Some(index) => index,
            None => {
                let index = self
                    .entries
                    .iter()
                    .position(|e| !e.active)
                    .ok_or(Error::BarrierTableFull { barrier_id, block_id })?;
                let expected = self.expected_mask();
                let entry = &mut self.entries[index];
                entry.barrier_id = barrier_id;
                entry.block_id = block_id;
                entry.arrived = BitArray::ZERO;
                entry.expected = expected;
                entry.stalled = BitArray::ZERO;
                entry.thread_masks.fill(BitArray::ZERO);
                entry.arrival_cycle.fill(0);
                entry.active = true;
                index
            }
        };

        let entry = &mut self.entries[index];
        entry.arrived.set(warp_in_block, true);
        entry.thread_masks[warp_in_block] = thread_mask;
        entry.arrival_cycle[warp_in_block] = now;
        if kind == ArrivalKind::Sync {
            entry.stalled.set(warp_in_block, true);
        }

        log::debug!(
            "barrier {}.{}: warp {} arrived ({}/{})",
            block_id,
            barrier_id,
            warp_in_block,
            entry.arrived.count_ones(),
            entry.expected.count_ones(),
        );

        if entry.arrived == entry.expected && entry.expected.any() {
            let warps: Vec<usize> = entry.arrived.iter_ones().collect();
            let thread_masks = warps.iter().map(|&w| entry.thread_masks[w]).collect();
            let wait_cycles: u64 = entry
                .stalled
                .iter_ones()
                .map(|warp| now - entry.arrival_cycle[warp])
                .sum();
            entry.active = false;
            self.stats.releases += 1;
            self.stats.wait_cycles += wait_cycles;
            return Ok(Some(Release { barrier_id, block_id, warps, thread_masks, wait_cycles }));
        }
        Ok(None)
    }

    /// Register a `wait N` against a live entry.
    ///
    /// Returns false when no entry is live, in which case the warp does
    /// not stall.
    pub fn begin_wait(
        &mut self,
        barrier_id: u32,
        block_id: u32,
        warp_in_block: usize,
        now: u64,
    ) -> bool {
        let Some(index) = self.find(barrier_id, block_id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        entry.stalled.set(warp_in_block, true);
        entry.arrival_cycle[warp_in_block] = now;
        true
    }

    /// Structural invariant: arrivals never exceed the expected set.
    pub fn verify(&self) {
        for entry in &self.entries {
            if entry.active {
                assert!(
                    (entry.arrived & !entry.expected).not_any(),
                    "arrived mask must be a subset of expected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ArrivalKind, BarrierSet};
    use crate::warp::full_mask;

    #[test]
    fn releases_when_all_warps_arrive() {
        let mut barriers = BarrierSet::new(4, 2);
        let mask = full_mask(32);
        let none = barriers
            .arrive(0, 0, 0, mask, ArrivalKind::Sync, 10)
            .unwrap();
        assert!(none.is_none());
        assert!(barriers.is_live(0, 0));

        let release = barriers
            .arrive(0, 0, 1, mask, ArrivalKind::Sync, 25)
            .unwrap()
            .expect("second arrival completes the set");
        assert_eq!(release.warps, vec![0, 1]);
        assert_eq!(release.thread_masks, vec![mask, mask]);
        assert_eq!(release.wait_cycles, 15);
        assert!(!barriers.is_live(0, 0));
        assert_eq!(barriers.stats.releases, 1);
        barriers.verify();
    }

    #[test]
    fn distinct_identities_are_independent() {
        let mut barriers = BarrierSet::new(4, 1);
        let mask = full_mask(4);
        // single-warp blocks release immediately, one entry per identity
        let r0 = barriers.arrive(0, 0, 0, mask, ArrivalKind::Sync, 0).unwrap();
        let r1 = barriers.arrive(1, 3, 0, mask, ArrivalKind::Sync, 0).unwrap();
        assert!(r0.is_some());
        assert!(r1.is_some());
        assert_eq!(barriers.stats.releases, 2);
    }

    #[test]
    fn table_full() {
        let mut barriers = BarrierSet::new(1, 2);
        let mask = full_mask(2);
        barriers.arrive(0, 0, 0, mask, ArrivalKind::Sync, 0).unwrap();
        let err = barriers
            .arrive(1, 0, 0, mask, ArrivalKind::Sync, 0)
            .unwrap_err();
        assert_eq!(
            err,
            crate::error::Error::BarrierTableFull { barrier_id: 1, block_id: 0 }
        );
    }

    #[test]
    fn arrive_does_not_accumulate_wait_time() {
        let mut barriers = BarrierSet::new(4, 2);
        let mask = full_mask(8);
        barriers.arrive(2, 0, 0, mask, ArrivalKind::Arrive, 0).unwrap();
        let release = barriers
            .arrive(2, 0, 1, mask, ArrivalKind::Sync, 40)
            .unwrap()
            .unwrap();
        // only the sync arrival stalls, and it releases instantly
        assert_eq!(release.wait_cycles, 0);
    }

    #[test]
    fn late_wait_sees_no_live_entry() {
        let mut barriers = BarrierSet::new(4, 1);
        let mask = full_mask(2);
        barriers.arrive(0, 0, 0, mask, ArrivalKind::Arrive, 0).unwrap();
        assert!(!barriers.begin_wait(0, 0, 0, 5));
    }

    #[test]
    fn wait_joins_live_entry() {
        let mut barriers = BarrierSet::new(4, 2);
        let mask = full_mask(2);
        barriers.arrive(7, 1, 0, mask, ArrivalKind::Arrive, 3).unwrap();
        assert!(barriers.begin_wait(7, 1, 0, 5));
        let release = barriers
            .arrive(7, 1, 1, mask, ArrivalKind::Sync, 9)
            .unwrap()
            .unwrap();
        assert_eq!(release.wait_cycles, 4);
    }
}
