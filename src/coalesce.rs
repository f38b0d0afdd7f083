use crate::{
    cache::{LaneSlot, Request},
    Address,
};
use std::collections::BTreeMap;

/// One lane's memory access before coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneAccess {
    pub lane: usize,
    pub addr: Address,
    pub size: u32,
    pub write_data: u32,
}

/// Groups per-lane accesses into cache-line-aligned requests.
///
/// Lanes touching the same line collapse into a single request, so a
/// fully converged warp access to one line costs exactly one transaction.
#[derive(Debug, Clone, Copy)]
pub struct Coalescer {
    line_size: u32,
}

impl Coalescer {
    #[must_use]
    pub fn new(line_size: u32) -> Self {
        debug_assert!(line_size.is_power_of_two());
        Self { line_size }
    }

    /// Partition the active lanes by line address.
    ///
    /// Requests come back in ascending line-address order; within one
    /// request the lane slots keep ascending lane order. Both orders are
    /// part of the determinism contract.
    #[must_use]
    pub fn coalesce(&self, accesses: &[LaneAccess], is_write: bool, warp_id: usize) -> Vec<Request> {
        let mut partitions: BTreeMap<Address, Vec<LaneSlot>> = BTreeMap::new();
        for access in accesses {
            let line_addr = access.addr & !(self.line_size - 1);
            partitions.entry(line_addr).or_default().push(LaneSlot {
                lane: access.lane,
                offset: access.addr - line_addr,
                size: access.size,
                write_data: access.write_data,
            });
        }
        partitions
            .into_iter()
            .map(|(line_addr, slots)| Request {
                line_addr,
                is_write,
                warp_id,
                slots,
            })
            .collect()
    }
}
