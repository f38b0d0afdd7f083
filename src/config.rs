use crate::{error::Error, Address};
use serde::{Deserialize, Serialize};

/// Base address of the shared memory window.
///
/// Per-lane addresses whose high bits select this window are routed to the
/// banked scratchpad instead of the global memory path.
pub const SHARED_MEM_BASE: Address = 0x1000_0000;

/// Size of the reserved shared memory window in the address space.
pub const SHARED_MEM_WINDOW: Address = 0x1000_0000;

/// Largest supported cache line, bounds the per-request byte mask.
pub const MAX_LINE_SIZE: usize = 256;

/// Lanes per warp are capped by the 32-bit active mask.
pub const MAX_WARP_SIZE: usize = 32;

/// Warp issue policy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    RoundRobin,
    GreedyThenOldest,
}

/// Simulator configuration.
///
/// All knobs recognized by the driver. Unknown keys in an on-disk config
/// are rejected so typos fail loudly instead of silently falling back to
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of warp contexts.
    pub num_warps: usize,
    /// SIMT lane count per warp.
    pub threads_per_warp: usize,
    /// Warps forming one block for barrier purposes.
    ///
    /// `None` puts every warp in a single block.
    pub warps_per_block: Option<usize>,
    /// Total data cache size in bytes (power of two).
    pub cache_size: u32,
    /// Cache line size in bytes (power of two).
    pub cache_line_size: u32,
    /// Cache ways per set.
    pub associativity: usize,
    /// Cycles to serve a cache miss from the backing store.
    pub memory_latency: u64,
    /// Shared memory scratchpad size in bytes.
    pub shared_mem_size: u32,
    /// Number of shared memory banks (power of two).
    pub num_banks: usize,
    /// Barrier table capacity.
    pub max_barriers: usize,
    /// Divergence stack depth per warp.
    pub divergence_stack_depth: usize,
    /// Hard cap on simulated cycles.
    pub cycle_limit: u64,
    /// Extra cycles consumed by a committed branch.
    pub branch_latency: u64,
    /// Pending atomic requests tolerated per locked address.
    pub atomic_queue_depth: usize,
    /// Cycles between statistics snapshots.
    pub snapshot_interval: u64,
    /// Report a run that hits the cycle limit as a normal end.
    pub graceful_cycle_limit: bool,
    /// Warp issue policy.
    pub scheduler: SchedulerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_warps: 32,
            threads_per_warp: 32,
            warps_per_block: None,
            cache_size: 16 * 1024,
            cache_line_size: 128,
            associativity: 8,
            memory_latency: 100,
            shared_mem_size: 16 * 1024,
            num_banks: 32,
            max_barriers: 16,
            divergence_stack_depth: 8,
            cycle_limit: 1_000_000,
            branch_latency: 3,
            atomic_queue_depth: 1024,
            snapshot_interval: 1000,
            graceful_cycle_limit: false,
            scheduler: SchedulerKind::default(),
        }
    }
}

fn require(cond: bool, msg: impl FnOnce() -> String) -> Result<(), Error> {
    if cond {
        Ok(())
    } else {
        Err(Error::ConfigInvalid(msg()))
    }
}

impl Config {
    /// Validate all constructor-time invariants.
    pub fn validate(&self) -> Result<(), Error> {
        require(self.num_warps >= 1, || "num_warps must be at least 1".into())?;
        require(
            (1..=MAX_WARP_SIZE).contains(&self.threads_per_warp),
            || format!("threads_per_warp must be in 1..={MAX_WARP_SIZE}"),
        )?;
        require(self.cache_size.is_power_of_two(), || {
            format!("cache_size {} is not a power of two", self.cache_size)
        })?;
        require(self.cache_line_size.is_power_of_two(), || {
            format!(
                "cache_line_size {} is not a power of two",
                self.cache_line_size
            )
        })?;
        require(
            self.cache_line_size as usize <= MAX_LINE_SIZE,
            || format!("cache_line_size must not exceed {MAX_LINE_SIZE}"),
        )?;
        require(self.associativity >= 1, || {
            "associativity must be at least 1".into()
        })?;
        require(
            u64::from(self.cache_line_size)
                <= u64::from(self.cache_size) / self.associativity as u64,
            || {
                format!(
                    "cache_line_size {} exceeds cache_size / associativity",
                    self.cache_line_size
                )
            },
        )?;
        require(self.num_sets().is_power_of_two(), || {
            format!("number of cache sets {} is not a power of two", self.num_sets())
        })?;
        require(self.num_banks.is_power_of_two(), || {
            format!("num_banks {} is not a power of two", self.num_banks)
        })?;
        require(self.shared_mem_size % 4 == 0, || {
            "shared_mem_size must be word aligned".into()
        })?;
        require(self.shared_mem_size <= SHARED_MEM_WINDOW, || {
            format!(
                "shared_mem_size {} exceeds the reserved window of {} bytes",
                self.shared_mem_size, SHARED_MEM_WINDOW
            )
        })?;
        require(self.max_barriers >= 1, || {
            "max_barriers must be at least 1".into()
        })?;
        require(self.divergence_stack_depth >= 1, || {
            "divergence_stack_depth must be at least 1".into()
        })?;
        require(self.cycle_limit >= 1, || "cycle_limit must be at least 1".into())?;
        let wpb = self.warps_per_block();
        require(wpb >= 1 && self.num_warps % wpb == 0, || {
            format!(
                "warps_per_block {} must evenly divide num_warps {}",
                wpb, self.num_warps
            )
        })?;
        Ok(())
    }

    #[must_use]
    pub fn warps_per_block(&self) -> usize {
        self.warps_per_block.unwrap_or(self.num_warps)
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.num_warps / self.warps_per_block()
    }

    #[must_use]
    pub fn num_sets(&self) -> u32 {
        self.cache_size / (self.cache_line_size * self.associativity as u32)
    }

    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.cache_line_size.trailing_zeros()
    }

    #[must_use]
    pub fn num_sets_log2(&self) -> u32 {
        self.num_sets().trailing_zeros()
    }
}
