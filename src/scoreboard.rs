use crate::instruction::Instruction;
use std::collections::HashSet;

/// Per-(warp, register) busy tracking.
///
/// A register is reserved when an instruction with a deferred result
/// (load, atomic) issues and released when the back-end commits the
/// value. An instruction whose operands intersect the reserved set keeps
/// its warp out of issue.
#[derive(Debug, Default)]
pub struct Scoreboard {
    warp_registers: Box<[HashSet<u8>]>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(max_warps: usize) -> Self {
        Self {
            warp_registers: vec![HashSet::new(); max_warps].into_boxed_slice(),
        }
    }

    /// Whether the instruction reads or writes a register that is still
    /// busy for this warp.
    #[must_use]
    pub fn has_collision(&self, warp_id: usize, instr: &Instruction) -> bool {
        let reserved = &self.warp_registers[warp_id];
        if reserved.is_empty() {
            return false;
        }
        use itertools::Itertools;
        log::trace!(
            "scoreboard: warp {} reserved registers: {:?}",
            warp_id,
            reserved.iter().sorted().collect::<Vec<_>>(),
        );
        instr
            .inputs()
            .into_iter()
            .chain(instr.output())
            .any(|reg| reserved.contains(&reg))
    }

    /// All pending writes for a warp.
    #[must_use]
    pub fn pending_writes(&self, warp_id: usize) -> &HashSet<u8> {
        &self.warp_registers[warp_id]
    }

    pub fn reserve(&mut self, warp_id: usize, reg: u8) {
        if reg == 0 {
            return;
        }
        log::trace!("scoreboard: warp {warp_id} reserves register r{reg}");
        self.warp_registers[warp_id].insert(reg);
    }

    pub fn release(&mut self, warp_id: usize, reg: u8) {
        if self.warp_registers[warp_id].remove(&reg) {
            log::trace!("scoreboard: warp {warp_id} releases register r{reg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scoreboard;
    use crate::instruction::{encode, AluOp, Instruction, LoadKind};

    #[test]
    fn collision_on_busy_source() {
        let mut scoreboard = Scoreboard::new(2);
        scoreboard.reserve(0, 10);

        let reader = Instruction::decode(encode::alu(AluOp::Add, 11, 10, 2), 0);
        assert!(scoreboard.has_collision(0, &reader));
        // other warps are unaffected
        assert!(!scoreboard.has_collision(1, &reader));

        scoreboard.release(0, 10);
        assert!(!scoreboard.has_collision(0, &reader));
    }

    #[test]
    fn collision_on_busy_destination() {
        let mut scoreboard = Scoreboard::new(1);
        scoreboard.reserve(0, 5);
        let writer = Instruction::decode(encode::load(LoadKind::Word, 5, 1, 0), 0);
        assert!(scoreboard.has_collision(0, &writer));
    }

    #[test]
    fn register_zero_is_never_reserved() {
        let mut scoreboard = Scoreboard::new(1);
        scoreboard.reserve(0, 0);
        assert!(scoreboard.pending_writes(0).is_empty());
    }
}
