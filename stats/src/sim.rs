use serde::{Deserialize, Serialize};

/// Whole-simulation counters owned by the driver.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    /// Value of the cycle counter when the simulation stopped.
    pub cycles: u64,
    /// Instructions retired across all warps (`exit` is not counted).
    pub instructions: u64,
    /// Cycles in which no warp could be issued.
    pub idle_cycles: u64,
    /// Idle cycles plus accumulated barrier wait time.
    pub stall_cycles: u64,
}

impl Sim {
    /// Instructions per cycle.
    #[must_use]
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.instructions as f64 / self.cycles as f64
    }
}
