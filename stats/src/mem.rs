use serde::{Deserialize, Serialize};

/// Backing store traffic as seen from outside the cache.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accesses {
    /// Line refills fetched from the backing store.
    pub dram_reads: u64,
    /// Dirty lines written back to the backing store.
    pub dram_writes: u64,
    /// Coalesced requests presented to the cache.
    pub coalesced_requests: u64,
}

/// Shared memory scratchpad counters.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMem {
    /// Warp-level shared memory accesses.
    pub accesses: u64,
    /// Extra serialization rounds caused by lanes hitting distinct words
    /// in the same bank.
    pub bank_conflicts: u64,
}
