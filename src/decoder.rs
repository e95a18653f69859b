//! Capstone-based 16-bit x86 instruction source.

use std::fmt;

use capstone::arch::x86::{ArchMode as X86Mode, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;

use crate::{Address, FlowClass, Insn, InstructionSource, Operand, Reg, Region};

/// Longest x86 instruction encoding
const MAX_INSTRUCTION_SIZE: usize = 16;

// Capstone's architecture-independent group ids
const GRP_JUMP: u32 = 1;
const GRP_CALL: u32 = 2;
const GRP_RET: u32 = 3;
const GRP_IRET: u32 = 5;

/// Mnemonics whose first register operand is only read.
const READS_FIRST_OPERAND: &[&str] = &["cmp", "test", "push", "out", "bt", "jmp", "call", "ljmp", "lcall"];

/// Errors that can occur while setting up the decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),
}

/// A Capstone decoder in 16-bit real mode with instruction detail enabled.
pub struct CapstoneDecoder {
    cs: Capstone,
}

impl CapstoneDecoder {
    /// Build the decoder
    pub fn new() -> Result<Self, DecoderError> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode16)
            .detail(true)
            .build()?;
        Ok(Self { cs })
    }

    /// Map a Capstone register to the 16-bit register it lives in.
    fn reg(&self, id: RegId) -> Reg {
        let name = self.cs.reg_name(id).unwrap_or_default();
        match name.as_str() {
            "al" | "ah" | "ax" | "eax" => Reg::Ax,
            "bl" | "bh" | "bx" | "ebx" => Reg::Bx,
            "cl" | "ch" | "cx" | "ecx" => Reg::Cx,
            "dl" | "dh" | "dx" | "edx" => Reg::Dx,
            "si" | "esi" => Reg::Si,
            "di" | "edi" => Reg::Di,
            "bp" | "ebp" => Reg::Bp,
            "sp" | "esp" => Reg::Sp,
            "cs" => Reg::Cs,
            "ds" => Reg::Ds,
            "es" => Reg::Es,
            "ss" => Reg::Ss,
            _ => Reg::Other(id.0),
        }
    }

    fn flow(mnemonic: &str, groups: &[u32]) -> FlowClass {
        if mnemonic.starts_with("loop") || mnemonic == "jcxz" || mnemonic == "jecxz" {
            FlowClass::Loop
        } else if mnemonic == "jmp" || mnemonic == "ljmp" {
            FlowClass::Jump
        } else if groups.contains(&GRP_JUMP) {
            FlowClass::ConditionalJump
        } else if groups.contains(&GRP_CALL) {
            FlowClass::Call
        } else if groups.contains(&GRP_RET) || groups.contains(&GRP_IRET) {
            FlowClass::Return
        } else {
            FlowClass::None
        }
    }
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::X86_16")
    }
}

impl InstructionSource for CapstoneDecoder {
    fn decode(&self, region: &Region<'_>, at: Address) -> Option<Insn> {
        let tail = region.tail(at)?;
        let slice = &tail[..tail.len().min(MAX_INSTRUCTION_SIZE)];

        let disasm = self.cs.disasm_count(slice, u64::from(at), 1).ok()?;
        let i = disasm.iter().next()?;
        if i.address() != u64::from(at) {
            return None;
        }
        let detail = self.cs.insn_detail(&i).ok()?;

        let mnemonic = i.mnemonic().unwrap_or("").to_string();
        let groups: Vec<u32> = detail.groups().into_iter().map(|g| u32::from(g.0)).collect();
        let flow = Self::flow(&mnemonic, &groups);

        let mut operands = Vec::new();
        for op in detail.arch_detail().operands() {
            if let ArchOperand::X86Operand(op) = op {
                match op.op_type {
                    X86OperandType::Reg(id) => operands.push(Operand::Reg(self.reg(id))),
                    X86OperandType::Imm(value) => operands.push(Operand::Imm(value as u16)),
                    X86OperandType::Mem(mem) => operands.push(Operand::Mem { disp: mem.disp() as u16 }),
                    _ => {}
                }
            }
        }

        let mut regs_read: Vec<Reg> = detail.regs_read().into_iter().map(|r| self.reg(*r)).collect();
        let mut regs_written: Vec<Reg> = detail.regs_write().into_iter().map(|r| self.reg(*r)).collect();
        for (index, op) in operands.iter().enumerate() {
            if let Operand::Reg(reg) = op {
                let written = index == 0
                    && (mnemonic == "xchg" || !READS_FIRST_OPERAND.contains(&mnemonic.as_str()));
                if written {
                    regs_written.push(*reg);
                } else {
                    regs_read.push(*reg);
                }
                if mnemonic == "xchg" {
                    regs_written.push(*reg);
                }
            }
        }
        regs_read.sort();
        regs_read.dedup();
        regs_written.sort();
        regs_written.dedup();

        Some(Insn {
            addr: at,
            size: i.bytes().len() as u8,
            mnemonic,
            op_str: i.op_str().unwrap_or("").to_string(),
            flow,
            operands,
            regs_read,
            regs_written,
        })
    }
}
