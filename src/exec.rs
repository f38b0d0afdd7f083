use crate::{
    atomic,
    coalesce::LaneAccess,
    error::Error,
    instruction::{ControlOp, Instruction, LoadKind, MoveOp, Operation, SpecialOp, SyncOp},
    register_file::RegisterFile,
    smem,
    texture::Sampler,
    warp::{ActiveMask, ReconvergenceEntry, Warp},
    Address,
};
use bitvec::array::BitArray;

/// How a warp announced a barrier interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Arrive and stall.
    Barrier,
    /// Record arrival, keep running.
    Arrive,
    /// Stall until the matching entry releases.
    Wait,
}

/// What the driver must do after one instruction executed.
///
/// The execution unit never talks to the memory hierarchy directly; it
/// hands the per-lane accesses back so the driver can turn them into
/// events (back-references become event enqueues, not calls).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Side effects committed, pc advanced.
    Retired,
    /// A branch or jump resolved; the warp owes the branch latency.
    Branched,
    /// Memory accesses to route, split by target space.
    Memory {
        is_write: bool,
        dest: Option<u8>,
        global: Vec<LaneAccess>,
        shared: Vec<smem::LaneRequest>,
    },
    /// Atomic requests in ascending lane order.
    Atomic {
        dest: u8,
        requests: Vec<atomic::Request>,
    },
    /// Barrier interaction with the warp's block.
    Sync { kind: SyncKind, barrier_id: u32 },
    /// The warp hit `exit`.
    Exited,
}

/// SIMT evaluation of decoded instructions against lane data.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionUnit {
    lanes: usize,
    shared_base: Address,
    shared_window: Address,
}

impl ExecutionUnit {
    #[must_use]
    pub fn new(lanes: usize, shared_base: Address, shared_window: Address) -> Self {
        Self { lanes, shared_base, shared_window }
    }

    fn in_shared_window(&self, addr: Address) -> bool {
        addr.wrapping_sub(self.shared_base) < self.shared_window
    }

    /// Lanes that observe side effects: the warp's active mask narrowed
    /// by the predicate, if any.
    fn effective_mask(&self, warp: &Warp, instr: &Instruction, regs: &RegisterFile) -> ActiveMask {
        let Some(pred) = instr.pred else {
            return warp.active_mask;
        };
        let values = regs.read(warp.warp_id, pred.reg);
        let mut mask: ActiveMask = BitArray::ZERO;
        for lane in 0..self.lanes {
            let lane_true = (values[lane] != 0) != pred.complement;
            mask.set(lane, warp.active_mask[lane] && lane_true);
        }
        mask
    }

    /// Execute one instruction for `warp`.
    ///
    /// `merged` reports whether fall-through reconvergence fired for this
    /// pc right before issue; a `converge` that just merged is a no-op
    /// instead of launching the parked path of an outer divergence.
    pub fn execute(
        &self,
        warp: &mut Warp,
        instr: &Instruction,
        regs: &mut RegisterFile,
        sampler: &dyn Sampler,
        merged: bool,
    ) -> Result<Outcome, Error> {
        let mask = self.effective_mask(warp, instr, regs);
        match instr.op {
            Operation::Invalid => Err(Error::IllegalInstruction { pc: instr.pc, word: instr.word }),

            Operation::Alu(op) => {
                let src1 = regs.read(warp.warp_id, instr.rs1).to_vec();
                let src2 = match instr.imm {
                    Some(imm) => vec![imm as u32; self.lanes],
                    None => regs.read(warp.warp_id, instr.rs2).to_vec(),
                };
                let mut result = vec![0u32; self.lanes];
                for lane in 0..self.lanes {
                    if !mask[lane] {
                        continue;
                    }
                    result[lane] = op.eval(src1[lane], src2[lane]).ok_or(Error::DivideByZero {
                        warp_id: warp.warp_id,
                        pc: warp.pc,
                    })?;
                }
                regs.write(warp.warp_id, instr.rd, &result, mask);
                warp.pc += 4;
                Ok(Outcome::Retired)
            }

            Operation::Move(op) => {
                let result: Vec<u32> = match op {
                    MoveOp::Mov => match instr.imm {
                        Some(imm) => vec![imm as u32; self.lanes],
                        None => regs.read(warp.warp_id, instr.rs1).to_vec(),
                    },
                    MoveOp::Tid => (0..self.lanes as u32).collect(),
                    MoveOp::WarpId => vec![warp.warp_id as u32; self.lanes],
                    MoveOp::BlockId => vec![warp.block_id; self.lanes],
                };
                regs.write(warp.warp_id, instr.rd, &result, mask);
                warp.pc += 4;
                Ok(Outcome::Retired)
            }

            Operation::Branch(cond) => {
                let offset = instr.imm.unwrap_or(0);
                let target = warp
                    .pc
                    .wrapping_add(4)
                    .wrapping_add((offset as u32).wrapping_mul(4));
                let src1 = regs.read(warp.warp_id, instr.rs1);
                // the second source rides in the rd slot
                let src2 = regs.read(warp.warp_id, instr.rd);
                let mut taken: ActiveMask = BitArray::ZERO;
                for lane in 0..self.lanes {
                    taken.set(lane, warp.active_mask[lane] && cond.eval(src1[lane], src2[lane]));
                }

                if taken == warp.active_mask {
                    warp.pc = target;
                } else if taken.not_any() {
                    warp.pc += 4;
                } else {
                    let parked = warp.active_mask & !taken;
                    warp.push_divergence(warp.pc + 4, parked)?;
                    warp.active_mask = taken;
                    warp.pc = target;
                    log::debug!(
                        "warp {}: diverged at pc {:08x}, {} lanes taken, {} parked",
                        warp.warp_id,
                        instr.pc,
                        taken.count_ones(),
                        parked.count_ones(),
                    );
                }
                Ok(Outcome::Branched)
            }

            Operation::Control(ControlOp::Jump) => {
                let offset = instr.imm.unwrap_or(0);
                warp.pc = warp
                    .pc
                    .wrapping_add(4)
                    .wrapping_add((offset as u32).wrapping_mul(4));
                Ok(Outcome::Branched)
            }

            Operation::Control(ControlOp::Converge) => {
                if merged {
                    // both paths of the innermost divergence already met
                    // here, nothing left to launch
                    warp.pc += 4;
                } else if let Some(top) = warp.divergence_stack.pop() {
                    // park the current lanes at this reconvergence point
                    // and run the deferred path
                    let here = ReconvergenceEntry { pc: warp.pc, mask: warp.active_mask };
                    warp.divergence_stack.push(here);
                    warp.active_mask = top.mask;
                    warp.pc = top.pc;
                } else {
                    warp.pc += 4;
                }
                Ok(Outcome::Retired)
            }

            Operation::Load(LoadKind::Tex) => {
                let base = regs.read(warp.warp_id, instr.rs1).to_vec();
                let offset = instr.imm.unwrap_or(0) as u32;
                for lane in 0..self.lanes {
                    if mask[lane] {
                        let texel = sampler.fetch(base[lane].wrapping_add(offset));
                        regs.write_lane(warp.warp_id, instr.rd, lane, texel);
                    }
                }
                warp.pc += 4;
                Ok(Outcome::Retired)
            }

            Operation::Load(kind) => {
                let (global, shared) =
                    self.memory_accesses(warp, instr, regs, mask, kind.size(), None)?;
                warp.pc += 4;
                if global.is_empty() && shared.is_empty() {
                    return Ok(Outcome::Retired);
                }
                Ok(Outcome::Memory { is_write: false, dest: Some(instr.rd), global, shared })
            }

            Operation::Store(kind) => {
                // store data rides in the rd slot
                let data = regs.read(warp.warp_id, instr.rd).to_vec();
                let (global, shared) =
                    self.memory_accesses(warp, instr, regs, mask, kind.size(), Some(&data))?;
                warp.pc += 4;
                if global.is_empty() && shared.is_empty() {
                    return Ok(Outcome::Retired);
                }
                Ok(Outcome::Memory { is_write: true, dest: None, global, shared })
            }

            Operation::Special(SpecialOp::Atom(op)) => {
                let addrs = regs.read(warp.warp_id, instr.rs1).to_vec();
                let data = regs.read(warp.warp_id, instr.rs2).to_vec();
                let compare = regs.read(warp.warp_id, instr.rd).to_vec();
                let mut requests = Vec::new();
                for lane in 0..self.lanes {
                    if mask[lane] {
                        requests.push(atomic::Request {
                            op,
                            addr: addrs[lane],
                            data: data[lane],
                            compare: compare[lane],
                            warp_id: warp.warp_id,
                            lane_id: lane,
                        });
                    }
                }
                warp.pc += 4;
                if requests.is_empty() {
                    return Ok(Outcome::Retired);
                }
                Ok(Outcome::Atomic { dest: instr.rd, requests })
            }

            Operation::Sync(op) => self.execute_sync(warp, instr, regs, mask, op),

            Operation::Special(SpecialOp::Nop) => {
                warp.pc += 4;
                Ok(Outcome::Retired)
            }

            Operation::Special(SpecialOp::Exit) => Ok(Outcome::Exited),
        }
    }

    fn execute_sync(
        &self,
        warp: &mut Warp,
        instr: &Instruction,
        regs: &mut RegisterFile,
        mask: ActiveMask,
        op: SyncOp,
    ) -> Result<Outcome, Error> {
        match op {
            SyncOp::VoteAll | SyncOp::VoteAny => {
                let values = regs.read(warp.warp_id, instr.rs1).to_vec();
                let participating: Vec<usize> = (0..self.lanes).filter(|&l| mask[l]).collect();
                let vote = match op {
                    SyncOp::VoteAll => {
                        !participating.is_empty()
                            && participating.iter().all(|&l| values[l] != 0)
                    }
                    _ => participating.iter().any(|&l| values[l] != 0),
                };
                // lane 0 gets the result, broadcast to the other active lanes
                let result = vec![u32::from(vote); self.lanes];
                regs.write(warp.warp_id, instr.rd, &result, mask);
                warp.pc += 4;
                Ok(Outcome::Retired)
            }
            SyncOp::Barrier | SyncOp::Arrive | SyncOp::Wait => {
                let barrier_id = match instr.imm {
                    Some(imm) => imm as u32,
                    None => regs.read_lane(warp.warp_id, instr.rs1, 0),
                };
                // the pc is advanced before the warp parks, the release
                // resumes it past the barrier instruction
                warp.pc += 4;
                let kind = match op {
                    SyncOp::Barrier => SyncKind::Barrier,
                    SyncOp::Arrive => SyncKind::Arrive,
                    _ => SyncKind::Wait,
                };
                Ok(Outcome::Sync { kind, barrier_id })
            }
        }
    }

    /// Per-lane address generation, split by target space.
    ///
    /// The shared window is carved out of the flat address space by its
    /// high bits; everything else is global.
    fn memory_accesses(
        &self,
        warp: &Warp,
        instr: &Instruction,
        regs: &RegisterFile,
        mask: ActiveMask,
        size: u32,
        write_data: Option<&[u32]>,
    ) -> Result<(Vec<LaneAccess>, Vec<smem::LaneRequest>), Error> {
        let base = regs.read(warp.warp_id, instr.rs1);
        let offset = instr.imm.unwrap_or(0) as u32;
        let mut global = Vec::new();
        let mut shared = Vec::new();
        for lane in 0..self.lanes {
            if !mask[lane] {
                continue;
            }
            let addr = base[lane].wrapping_add(offset);
            if addr % size != 0 {
                return Err(Error::AlignmentFault { addr, size });
            }
            let data = write_data.map_or(0, |d| d[lane]);
            if self.in_shared_window(addr) {
                shared.push(smem::LaneRequest { lane, addr, size, write_data: data });
            } else {
                global.push(LaneAccess { lane, addr, size, write_data: data });
            }
        }
        Ok((global, shared))
    }
}
