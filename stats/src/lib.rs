pub mod cache;
pub mod mem;
pub mod sim;
pub mod sync;

pub use cache::Cache;
pub use mem::{Accesses, SharedMem};
pub use sim::Sim;
pub use sync::{Atomics, Barriers};

use serde::{Deserialize, Serialize};

/// Aggregate counters for one simulation.
///
/// Every field is a plain counter struct so the whole record can be
/// serialized, diffed, and asserted on in tests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub cache: Cache,
    pub accesses: Accesses,
    pub smem: SharedMem,
    pub atomics: Atomics,
    pub barriers: Barriers,
}

impl Stats {
    /// Externally observable backing store transactions (refills and
    /// writebacks).
    #[must_use]
    pub fn memory_requests(&self) -> u64 {
        self.accesses.dram_reads + self.accesses.dram_writes
    }

    /// Flat `(name, value)` rows under the external reporting names,
    /// ready for CSV emission or diffing.
    #[must_use]
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("total_cycles", self.sim.cycles.to_string()),
            ("instructions_executed", self.sim.instructions.to_string()),
            ("memory_requests", self.memory_requests().to_string()),
            ("cache_hits", self.cache.hits.to_string()),
            ("cache_misses", self.cache.misses.to_string()),
            ("cache_evictions", self.cache.evictions.to_string()),
            ("cache_writebacks", self.cache.writebacks.to_string()),
            ("bank_conflicts", self.smem.bank_conflicts.to_string()),
            ("atomic_ops", self.atomics.ops.to_string()),
            ("atomic_contentions", self.atomics.contentions.to_string()),
            ("barrier_releases", self.barriers.releases.to_string()),
            ("stall_cycles", self.sim.stall_cycles.to_string()),
            ("ipc", format!("{:.4}", self.sim.ipc())),
            ("hit_rate", format!("{:.4}", self.cache.hit_rate())),
        ]
    }

    /// The flat rows as `name,value` CSV.
    pub fn write_csv<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, "stat,value")?;
        for (name, value) in self.rows() {
            writeln!(writer, "{name},{value}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Simulation Statistics")?;
        writeln!(f, "=====================")?;
        writeln!(f, "Total Cycles:          {}", self.sim.cycles)?;
        writeln!(f, "Instructions Executed: {}", self.sim.instructions)?;
        writeln!(f, "IPC:                   {:.2}", self.sim.ipc())?;
        writeln!(f, "Stall Cycles:          {}", self.sim.stall_cycles)?;
        writeln!(f, "Memory Requests:       {}", self.memory_requests())?;
        writeln!(f, "Cache Hits:            {}", self.cache.hits)?;
        writeln!(f, "Cache Misses:          {}", self.cache.misses)?;
        writeln!(f, "Cache Evictions:       {}", self.cache.evictions)?;
        writeln!(f, "Cache Writebacks:      {}", self.cache.writebacks)?;
        writeln!(f, "Cache Hit Rate:        {:.2}%", self.cache.hit_rate() * 100.0)?;
        writeln!(f, "Bank Conflicts:        {}", self.smem.bank_conflicts)?;
        writeln!(f, "Atomic Ops:            {}", self.atomics.ops)?;
        writeln!(f, "Atomic Contentions:    {}", self.atomics.contentions)?;
        writeln!(f, "Barrier Releases:      {}", self.barriers.releases)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Stats;

    #[test]
    fn serialize_round_trip() {
        let mut stats = Stats::default();
        stats.sim.cycles = 100;
        stats.sim.instructions = 42;
        stats.cache.hits = 7;
        let json = serde_json::to_string(&stats).unwrap();
        let back: Stats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }

    #[test]
    fn flat_rows_use_reporting_names() {
        let mut stats = Stats::default();
        stats.sim.cycles = 10;
        stats.sim.instructions = 5;
        let rows = stats.rows();
        assert_eq!(rows[0], ("total_cycles", "10".to_string()));
        assert!(rows.iter().any(|(name, value)| *name == "ipc" && value == "0.5000"));

        let mut csv = Vec::new();
        stats.write_csv(&mut csv).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        assert!(csv.starts_with("stat,value\ntotal_cycles,10\n"));
    }
}
