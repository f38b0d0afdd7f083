use serde::{Deserialize, Serialize};

/// Atomic engine counters.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atomics {
    /// Read-modify-write operations performed.
    pub ops: u64,
    /// Requests that arrived while their address was locked and had to
    /// queue behind an in-flight operation.
    pub contentions: u64,
}

/// Barrier controller counters.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barriers {
    /// Barrier entries that reached their full arrival set and released.
    pub releases: u64,
    /// Summed cycles warps spent parked in `WaitingBarrier`.
    pub wait_cycles: u64,
}
