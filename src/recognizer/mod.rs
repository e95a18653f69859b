//! Pluggable per-instruction hooks for the code walk.
//!
//! A recognizer claims instructions whose meaning the plain walk cannot
//! infer (calls into the event interpreter, computed jumps through tables,
//! calls that never return) and contributes edges for them. The first
//! recognizer whose [`Recognizer::matches`] accepts an instruction wins.

mod event;
mod flow;
mod table;

pub use self::event::*;
pub use self::flow::*;
pub use self::table::*;

use std::fmt;

use crate::context::ExecutionContext;
use crate::registry::Linker;
use crate::{Address, Error, FlowClass, Insn};

/// A hook attached to instructions of the code walk.
pub trait Recognizer: fmt::Debug {
    /// Short name used in log output
    fn name(&self) -> &str;

    /// True if this recognizer claims `insn`.
    fn matches(&self, insn: &Insn) -> bool;

    /// Where the walk continues after `insn`; `None` ends the path.
    fn resume_address(&self, insn: &Insn) -> Option<Address> {
        default_resume(insn)
    }

    /// Contribute edges for `insn` and update the walk's context.
    fn link(
        &self,
        insn: &Insn,
        linker: &mut Linker<'_, '_>,
        context: &mut ExecutionContext,
    ) -> Result<(), Error> {
        let _ = (insn, linker, context);
        Ok(())
    }
}

/// The next instruction, unless `insn` is an unconditional jump or a return.
pub fn default_resume(insn: &Insn) -> Option<Address> {
    match insn.flow {
        FlowClass::Jump | FlowClass::Return => None,
        _ => Address::try_from(insn.next_addr()).ok(),
    }
}

/// Which instructions a recognizer claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The instruction at exactly this address
    At(Address),
    /// Any direct call or jump to one of these routines
    CallTo(Vec<Address>),
}

impl Trigger {
    pub fn matches(&self, insn: &Insn) -> bool {
        match self {
            Trigger::At(addr) => insn.addr == *addr,
            Trigger::CallTo(targets) => targets.iter().any(|t| insn.transfers_to(*t)),
        }
    }
}

/// Where the walk goes after a recognized instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resume {
    /// As for an unrecognized instruction
    #[default]
    Next,
    /// End the path
    Stop,
    /// Continue at a fixed address
    At(Address),
}

impl Resume {
    pub fn address(&self, insn: &Insn) -> Option<Address> {
        match self {
            Resume::Next => default_resume(insn),
            Resume::Stop => None,
            Resume::At(addr) => Some(*addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resume() {
        let nop = Insn::new(0x100, 1, "nop");
        assert_eq!(default_resume(&nop), Some(0x101));

        let jmp = Insn::new(0x100, 3, "jmp").with_flow(FlowClass::Jump);
        assert_eq!(default_resume(&jmp), None);

        let last = Insn::new(0xffff, 1, "nop");
        assert_eq!(default_resume(&last), None);
    }

    #[test]
    fn test_triggers() {
        let call = Insn::new(0x100, 3, "call")
            .with_flow(FlowClass::Call)
            .with_operand(crate::Operand::Imm(0x6e77));

        assert!(Trigger::At(0x100).matches(&call));
        assert!(Trigger::CallTo(vec![0x6e7c, 0x6e77]).matches(&call));
        assert!(!Trigger::CallTo(vec![0x6e7c]).matches(&call));
        assert_eq!(Resume::At(0x200).address(&call), Some(0x200));
        assert_eq!(Resume::Stop.address(&call), None);
    }
}
