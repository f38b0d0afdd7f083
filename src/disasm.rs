use crate::{
    instruction::{
        AluOp, BranchCond, ControlOp, Instruction, LoadKind, MoveOp, Operation, SpecialOp, SyncOp,
    },
    program::ProgramImage,
    Address,
};
use std::fmt::Write;

fn alu_mnemonic(op: AluOp) -> &'static str {
    match op {
        AluOp::Add => "add",
        AluOp::Sub => "sub",
        AluOp::Mul => "mul",
        AluOp::Div => "div",
        AluOp::Rem => "rem",
        AluOp::And => "and",
        AluOp::Or => "or",
        AluOp::Xor => "xor",
        AluOp::Shl => "shl",
        AluOp::Shr => "shr",
        AluOp::Sra => "sra",
        AluOp::Slt => "slt",
        AluOp::Sltu => "sltu",
        AluOp::Min => "min",
        AluOp::Max => "max",
        AluOp::Abs => "abs",
    }
}

fn branch_mnemonic(cond: BranchCond) -> &'static str {
    match cond {
        BranchCond::All => "bra",
        BranchCond::Eq => "beq",
        BranchCond::Ne => "bne",
        BranchCond::Lt => "blt",
        BranchCond::Le => "ble",
        BranchCond::Gt => "bgt",
        BranchCond::Ge => "bge",
        BranchCond::Ltu => "bltu",
        BranchCond::Geu => "bgeu",
    }
}

fn atom_mnemonic(op: crate::atomic::Op) -> &'static str {
    use crate::atomic::Op;
    match op {
        Op::Add => "atom.add",
        Op::Sub => "atom.sub",
        Op::Exch => "atom.exch",
        Op::Min => "atom.min",
        Op::Max => "atom.max",
        Op::And => "atom.and",
        Op::Or => "atom.or",
        Op::Xor => "atom.xor",
        Op::Cas => "atom.cas",
        Op::Inc => "atom.inc",
        Op::Dec => "atom.dec",
    }
}

fn mem_operand(rs1: u8, imm: Option<i32>) -> String {
    match imm.unwrap_or(0) {
        0 => format!("[r{rs1}]"),
        off if off < 0 => format!("[r{rs1}-{}]", -off),
        off => format!("[r{rs1}+{off}]"),
    }
}

fn offset_operand(imm: Option<i32>) -> String {
    let off = imm.unwrap_or(0);
    if off < 0 {
        format!("{off}")
    } else {
        format!("+{off}")
    }
}

/// Render one instruction word as assembly text.
#[must_use]
pub fn disassemble(word: u32, pc: Address) -> String {
    let instr = Instruction::decode(word, pc);
    let body = match instr.op {
        Operation::Alu(op) => match instr.imm {
            Some(imm) => format!("{} r{}, r{}, #{}", alu_mnemonic(op), instr.rd, instr.rs1, imm),
            None => format!(
                "{} r{}, r{}, r{}",
                alu_mnemonic(op),
                instr.rd,
                instr.rs1,
                instr.rs2
            ),
        },
        Operation::Branch(cond) => format!(
            "{} r{}, r{}, {}",
            branch_mnemonic(cond),
            instr.rs1,
            instr.rd,
            offset_operand(instr.imm)
        ),
        Operation::Load(kind) => {
            let suffix = match kind {
                LoadKind::Byte => "b",
                LoadKind::Half => "h",
                LoadKind::Word => "w",
                LoadKind::Tex => "tex",
            };
            format!("ld.{} r{}, {}", suffix, instr.rd, mem_operand(instr.rs1, instr.imm))
        }
        Operation::Store(kind) => {
            let suffix = match kind {
                crate::instruction::StoreKind::Byte => "b",
                crate::instruction::StoreKind::Half => "h",
                crate::instruction::StoreKind::Word => "w",
            };
            format!("st.{} r{}, {}", suffix, instr.rd, mem_operand(instr.rs1, instr.imm))
        }
        Operation::Move(MoveOp::Mov) => match instr.imm {
            Some(imm) => format!("mov r{}, #{imm}", instr.rd),
            None => format!("mov r{}, r{}", instr.rd, instr.rs1),
        },
        Operation::Move(MoveOp::Tid) => format!("tid r{}", instr.rd),
        Operation::Move(MoveOp::WarpId) => format!("wid r{}", instr.rd),
        Operation::Move(MoveOp::BlockId) => format!("bid r{}", instr.rd),
        Operation::Sync(SyncOp::Barrier) => match instr.imm {
            Some(imm) => format!("bar #{imm}"),
            None => format!("bar r{}", instr.rs1),
        },
        Operation::Sync(SyncOp::Arrive) => match instr.imm {
            Some(imm) => format!("arrive #{imm}"),
            None => format!("arrive r{}", instr.rs1),
        },
        Operation::Sync(SyncOp::Wait) => match instr.imm {
            Some(imm) => format!("wait #{imm}"),
            None => format!("wait r{}", instr.rs1),
        },
        Operation::Sync(SyncOp::VoteAll) => format!("vote.all r{}, r{}", instr.rd, instr.rs1),
        Operation::Sync(SyncOp::VoteAny) => format!("vote.any r{}, r{}", instr.rd, instr.rs1),
        Operation::Special(SpecialOp::Nop) => "nop".to_string(),
        Operation::Special(SpecialOp::Exit) => "exit".to_string(),
        Operation::Special(SpecialOp::Atom(op)) => format!(
            "{} r{}, [r{}], r{}",
            atom_mnemonic(op),
            instr.rd,
            instr.rs1,
            instr.rs2
        ),
        Operation::Control(ControlOp::Jump) => format!("jmp {}", offset_operand(instr.imm)),
        Operation::Control(ControlOp::Converge) => "converge".to_string(),
        Operation::Invalid => format!(".word 0x{word:08x}"),
    };
    match instr.pred {
        Some(pred) if pred.complement => format!("@!p{} {body}", pred.reg),
        Some(pred) => format!("@p{} {body}", pred.reg),
        None => body,
    }
}

/// Render a whole program image as an address-annotated listing.
#[must_use]
pub fn listing(image: &ProgramImage) -> String {
    let mut out = String::new();
    for (i, &word) in image.instructions.iter().enumerate() {
        let pc = image.base + i as Address * 4;
        let _ = writeln!(out, "0x{pc:08x}: 0x{word:08x}  {}", disassemble(word, pc));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{disassemble, listing};
    use crate::instruction::{encode, AluOp, BranchCond, LoadKind, StoreKind};
    use crate::program::ProgramImage;

    #[test]
    fn alu_forms() {
        assert_eq!(disassemble(encode::alu(AluOp::Add, 10, 2, 3), 0), "add r10, r2, r3");
        assert_eq!(disassemble(encode::alu_imm(AluOp::And, 16, 15, 1), 0), "and r16, r15, #1");
        assert_eq!(disassemble(encode::alu_imm(AluOp::Add, 5, 0, -4), 0), "add r5, r0, #-4");
    }

    #[test]
    fn memory_forms() {
        assert_eq!(
            disassemble(encode::load(LoadKind::Word, 10, 1, 8), 0),
            "ld.w r10, [r1+8]"
        );
        assert_eq!(
            disassemble(encode::store(StoreKind::Byte, 9, 2, -1), 0),
            "st.b r9, [r2-1]"
        );
        assert_eq!(
            disassemble(encode::load(LoadKind::Tex, 4, 2, 0), 0),
            "ld.tex r4, [r2]"
        );
    }

    #[test]
    fn control_and_sync_forms() {
        assert_eq!(disassemble(encode::branch(BranchCond::Eq, 2, 4, 2), 0), "beq r2, r4, +2");
        assert_eq!(disassemble(encode::jump(-1), 0), "jmp -1");
        assert_eq!(disassemble(encode::converge(), 0), "converge");
        assert_eq!(disassemble(encode::barrier(0), 0), "bar #0");
        assert_eq!(disassemble(encode::vote_any(6, 2), 0), "vote.any r6, r2");
        assert_eq!(disassemble(encode::exit(), 0), "exit");
    }

    #[test]
    fn atomic_and_predicate_forms() {
        assert_eq!(
            disassemble(encode::atomic(crate::atomic::Op::Cas, 8, 1, 2), 0),
            "atom.cas r8, [r1], r2"
        );
        let word = encode::predicated(encode::alu(AluOp::Sub, 5, 6, 7), 3, true);
        assert_eq!(disassemble(word, 0), "@!p3 sub r5, r6, r7");
    }

    #[test]
    fn invalid_words_fall_back_to_raw() {
        assert_eq!(disassemble(0xffff_ffff, 0), ".word 0xffffffff");
    }

    #[test]
    fn listing_is_address_annotated() {
        let image = ProgramImage::from_words(
            0x100,
            vec![encode::tid(15), encode::exit()],
        );
        let text = listing(&image);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), format!("0x00000100: 0x{:08x}  tid r15", encode::tid(15)));
        assert!(lines.next().unwrap().ends_with("exit"));
    }
}
