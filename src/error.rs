use crate::Address;

/// Failure kinds surfaced by the subsystems.
///
/// The driver is the single recovery point: it logs the fault together
/// with the current cycle and warp, freezes the simulation, and maps the
/// kind to a process exit status.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unaligned {size}-byte access at address {addr:08x}")]
    AlignmentFault { addr: Address, size: u32 },

    #[error("illegal instruction {word:08x} at pc {pc:08x}")]
    IllegalInstruction { pc: Address, word: u32 },

    #[error("integer division by zero in warp {warp_id} at pc {pc:08x}")]
    DivideByZero { warp_id: usize, pc: Address },

    #[error("divergence stack overflow in warp {warp_id} at pc {pc:08x}")]
    DivergenceStackOverflow { warp_id: usize, pc: Address },

    #[error("atomic request queue full for address {addr:08x}")]
    AtomicBackpressure { addr: Address },

    #[error("no free barrier entry for barrier {barrier_id} in block {block_id}")]
    BarrierTableFull { barrier_id: u32, block_id: u32 },

    #[error("address {addr:08x} outside the declared memory region")]
    InvalidAddress { addr: Address },

    #[error("simulation exceeded the cycle limit of {limit}")]
    CycleLimitExceeded { limit: u64 },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// Process exit status for this failure kind (0 is reserved for a
    /// normal `SimulationEnd`).
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        match self {
            Error::AlignmentFault { .. } => 2,
            Error::IllegalInstruction { .. } => 3,
            Error::DivideByZero { .. } => 4,
            Error::DivergenceStackOverflow { .. } => 5,
            Error::AtomicBackpressure { .. } => 6,
            Error::BarrierTableFull { .. } => 7,
            Error::InvalidAddress { .. } => 8,
            Error::CycleLimitExceeded { .. } => 9,
            Error::ConfigInvalid(_) => 10,
        }
    }
}
