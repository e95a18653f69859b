//! Test doubles shared by the unit and pipeline tests.

use std::collections::BTreeMap;

use crate::{Address, FlowClass, Insn, InstructionSource, Operand, Reg, Region};

/// An instruction source backed by a fixed listing.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    insns: BTreeMap<Address, Insn>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, insn: Insn) -> Self {
        self.insns.insert(insn.addr, insn);
        self
    }

    pub fn nop(self, addr: Address) -> Self {
        self.push(Insn::new(addr, 1, "nop"))
    }

    pub fn ret(self, addr: Address) -> Self {
        self.push(Insn::new(addr, 1, "ret").with_flow(FlowClass::Return))
    }

    pub fn mov_imm(self, addr: Address, reg: Reg, value: u16) -> Self {
        self.push(
            Insn::new(addr, 3, "mov")
                .with_operand(Operand::Reg(reg))
                .with_operand(Operand::Imm(value))
                .writes(reg),
        )
    }

    pub fn call(self, addr: Address, target: Address) -> Self {
        self.push(
            Insn::new(addr, 3, "call")
                .with_flow(FlowClass::Call)
                .with_operand(Operand::Imm(target)),
        )
    }

    pub fn jmp(self, addr: Address, target: Address) -> Self {
        self.push(
            Insn::new(addr, 3, "jmp")
                .with_flow(FlowClass::Jump)
                .with_operand(Operand::Imm(target)),
        )
    }

    pub fn jz(self, addr: Address, target: Address) -> Self {
        self.push(
            Insn::new(addr, 2, "je")
                .with_flow(FlowClass::ConditionalJump)
                .with_operand(Operand::Imm(target)),
        )
    }

    pub fn inc(self, addr: Address, reg: Reg) -> Self {
        self.push(
            Insn::new(addr, 1, "inc")
                .with_operand(Operand::Reg(reg))
                .writes(reg),
        )
    }
}

impl InstructionSource for ScriptedSource {
    fn decode(&self, region: &Region<'_>, at: Address) -> Option<Insn> {
        if !region.contains(at) {
            return None;
        }
        self.insns.get(&at).cloned()
    }
}
