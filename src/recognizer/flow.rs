//! Recognizers that adjust control flow without reading tables.

use super::{Recognizer, Resume, Trigger};
use crate::block::{BlockKind, Link};
use crate::context::ExecutionContext;
use crate::registry::Linker;
use crate::{Address, Error, FlowClass, Insn, Reg};

/// Claims an instruction and contributes nothing.
///
/// Used for calls known to preserve every register, and for instruction
/// sequences the walk should step over.
#[derive(Debug, Clone)]
pub struct Skip {
    pub trigger: Trigger,
    pub resume: Resume,
}

impl Skip {
    /// Step over direct calls to any of `routines`, keeping the context.
    pub fn calls(routines: &[Address]) -> Self {
        Self { trigger: Trigger::CallTo(routines.to_vec()), resume: Resume::Next }
    }

    /// Jump from the instruction at `at` straight to `resume`.
    pub fn range(at: Address, resume: Address) -> Self {
        Self { trigger: Trigger::At(at), resume: Resume::At(resume) }
    }
}

impl Recognizer for Skip {
    fn name(&self) -> &str {
        "skip"
    }

    fn matches(&self, insn: &Insn) -> bool {
        self.trigger.matches(insn)
    }

    fn resume_address(&self, insn: &Insn) -> Option<Address> {
        self.resume.address(insn)
    }
}

/// A call to a routine that never returns to its caller.
#[derive(Debug, Clone)]
pub struct NoReturnCall {
    pub target: Address,
}

impl Recognizer for NoReturnCall {
    fn name(&self) -> &str {
        "no-return call"
    }

    fn matches(&self, insn: &Insn) -> bool {
        insn.flow == FlowClass::Call && insn.immediate_target() == Some(self.target)
    }

    fn resume_address(&self, _insn: &Insn) -> Option<Address> {
        None
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let link = Link::new(Some(insn.addr.wrapping_add(1)), self.target)
            .from_insn(insn.addr)
            .with_context(context.clone());
        linker.connect(link, BlockKind::Code)
    }
}

/// A `mov si, imm` at a fixed address whose immediate is event text the
/// walk would otherwise lose track of.
#[derive(Debug, Clone)]
pub struct FixedValue {
    pub at: Address,
}

impl Recognizer for FixedValue {
    fn name(&self) -> &str {
        "fixed value"
    }

    fn matches(&self, insn: &Insn) -> bool {
        insn.addr == self.at
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, _context: &mut ExecutionContext) -> Result<(), Error> {
        match insn.mov_immediate() {
            Some((Reg::Si, value)) => {
                let link = Link::new(Some(insn.addr.wrapping_add(1)), value).from_insn(insn.addr);
                linker.connect(link, BlockKind::Event)
            }
            _ => Err(Error::UnexpectedInstruction { addr: insn.addr, text: insn.to_string() }),
        }
    }
}

/// One edge contributed by [`FixedEdges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedEdge {
    pub source: Option<Address>,
    pub target: Address,
    pub kind: BlockKind,
}

/// Contributes a fixed list of edges at one instruction.
#[derive(Debug, Clone)]
pub struct FixedEdges {
    pub at: Address,
    pub edges: Vec<FixedEdge>,
}

impl Recognizer for FixedEdges {
    fn name(&self) -> &str {
        "fixed edges"
    }

    fn matches(&self, insn: &Insn) -> bool {
        insn.addr == self.at
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, _context: &mut ExecutionContext) -> Result<(), Error> {
        for edge in &self.edges {
            let mut link = Link::new(edge.source, edge.target);
            if edge.source.is_some() {
                link = link.from_insn(insn.addr);
            }
            linker.connect(link, edge.kind)?;
        }
        Ok(())
    }
}
