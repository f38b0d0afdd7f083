use crate::Address;
use std::io::Write;

/// Record kinds, one per event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Kind {
    InstructionFetch,
    MemoryRequest,
    MemoryResponse,
    AtomicResponse,
    BarrierRelease,
    WarpComplete,
    SimulationEnd,
}

/// One trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub cycle: u64,
    pub kind: Kind,
    pub warp_id: usize,
    pub pc: Address,
    pub address: Address,
    pub data: u32,
}

/// In-memory record of scheduling and memory observations.
///
/// Bounded so a runaway simulation cannot exhaust host memory; the bound
/// is deterministic, so truncated traces still compare byte-identical
/// across runs.
#[derive(Debug)]
pub struct Trace {
    entries: Vec<Entry>,
    limit: usize,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

impl Trace {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { entries: Vec::new(), limit }
    }

    pub fn record(&mut self, entry: Entry) {
        if self.entries.len() < self.limit {
            self.entries.push(entry);
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Emit the CSV form: fixed header, decimal fields except `pc` and
    /// `address` which are lowercase hex without prefix.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, "cycle,kind,warp_id,pc,address,data")?;
        for entry in &self.entries {
            writeln!(
                writer,
                "{},{},{},{:x},{:x},{}",
                entry.cycle, entry.kind, entry.warp_id, entry.pc, entry.address, entry.data,
            )?;
        }
        Ok(())
    }

    /// The CSV form as a string, for determinism comparisons in tests.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = Vec::new();
        self.write_csv(&mut out).expect("write to vec cannot fail");
        String::from_utf8(out).expect("csv is ascii")
    }
}
