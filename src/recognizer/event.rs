//! Recognizers for the hand-off from machine code to the event interpreter.

use super::{Recognizer, Trigger};
use crate::block::{BlockKind, Link};
use crate::context::{ExecutionContext, RegValue};
use crate::registry::Linker;
use crate::{Address, Error, Insn, Operand, Reg};

/// Interpreter entry points that run the event `si` points at.
pub const EVENT_ROUTINES: &[Address] = &[0x6e77, 0x6e7c, 0x70eb, 0x84be, 0x853f, 0x8559, 0x99ba, 0x99cc];

/// A call into the event interpreter with the event address in `si`.
///
/// After the call `si` points just past the event that ran. A second call
/// with that value continues the same text, so instead of a new block the
/// first block is extended to cover the following chunk.
#[derive(Debug, Clone)]
pub struct EventCall {
    pub trigger: Trigger,
}

impl Default for EventCall {
    fn default() -> Self {
        Self { trigger: Trigger::CallTo(EVENT_ROUTINES.to_vec()) }
    }
}

impl Recognizer for EventCall {
    fn name(&self) -> &str {
        "event call"
    }

    fn matches(&self, insn: &Insn) -> bool {
        self.trigger.matches(insn)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let si = *context
            .get(Reg::Si)
            .ok_or(Error::UnresolvedRegister { addr: insn.addr, reg: Reg::Si })?;

        if !linker.region().contains(si.value) {
            log::debug!("Event call at 0x{:04x} runs text at 0x{:04x} outside this script", insn.addr, si.value);
            let link = Link::new(si.source_addr, si.value).from_insn(insn.addr);
            return linker.connect(link, BlockKind::Event);
        }

        let origin = match (si.source_addr, si.continue_from) {
            (None, Some(from)) => {
                log::trace!("Event call at 0x{:04x} continues the event at 0x{:04x}", insn.addr, from);
                linker.extend_event(from, si.value)?;
                from
            }
            (source, _) => {
                if source.is_none() {
                    log::warn!("Event at 0x{:04x} is used from 0x{:04x} with no patchable pointer", si.value, insn.addr);
                }
                let link = Link::new(source, si.value).from_insn(insn.addr);
                linker.connect(link, BlockKind::Event)?;
                si.value
            }
        };

        let end = linker.event_end(si.value)?;
        context.set(
            Reg::Si,
            RegValue {
                value: end as u16,
                source_addr: None,
                continue_from: Some(origin),
            },
        );
        Ok(())
    }
}

/// A store of a register into the fixed memory slot the interpreter reads
/// its next event from, e.g. `mov [0xdd04], ax`.
#[derive(Debug, Clone)]
pub struct EventStore {
    pub slot: Address,
}

impl Recognizer for EventStore {
    fn name(&self) -> &str {
        "event store"
    }

    fn matches(&self, insn: &Insn) -> bool {
        insn.is_mov() && matches!(insn.operands.first(), Some(Operand::Mem { disp }) if *disp == self.slot)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let reg = match insn.operands.get(1) {
            Some(Operand::Reg(reg)) => *reg,
            _ => return Err(Error::UnexpectedInstruction { addr: insn.addr, text: insn.to_string() }),
        };
        let value = *context.get(reg).ok_or(Error::UnresolvedRegister { addr: insn.addr, reg })?;

        if linker.region().contains(value.value) {
            let link = Link::new(value.source_addr, value.value).from_insn(insn.addr);
            linker.connect(link, BlockKind::Event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::explore::{explore, EntryPoint, ExternalReference};
    use crate::relocate::Relocator;
    use crate::testing::ScriptedSource;
    use crate::Region;

    #[test]
    fn test_consecutive_calls_extend_one_event() {
        let mut data = [0u8; 0x40];
        // 0x120: "A" ret "B" ret "C" ret
        data[0x20..0x26].copy_from_slice(&[0x41, 0x07, 0x42, 0x07, 0x43, 0x07]);
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new()
            .mov_imm(0x100, Reg::Si, 0x120)
            .call(0x103, 0x6e77)
            .call(0x106, 0x6e77)
            .ret(0x109);
        let recognizers: Vec<Box<dyn Recognizer>> = vec![Box::new(EventCall::default())];

        let graph = explore(region, &[EntryPoint::code(0x100)], &recognizers, &source).unwrap();

        let event = graph.block_at(0x120).unwrap();
        assert_eq!(event.length(), 4);
        assert_eq!(event.continuation_extent(), Some(0x122));
        assert!(graph.block_at(0x124).is_none());
        assert_eq!(graph.incoming(event).count(), 1);
        assert!(graph.is_relocatable(event));
    }

    #[test]
    fn test_event_outside_script_is_refused_on_relocation() {
        let data = [0u8; 0x20];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new()
            .mov_imm(0x100, Reg::Si, 0x6000)
            .call(0x103, 0x6e77)
            .ret(0x106);
        let recognizers: Vec<Box<dyn Recognizer>> = vec![Box::new(EventCall::default())];

        let graph = explore(region, &[EntryPoint::code(0x100)], &recognizers, &source).unwrap();
        assert_eq!(
            graph.external_references(),
            &[ExternalReference { source_addr: Some(0x101), target_addr: 0x6000, kind: BlockKind::Event }]
        );
        assert!(graph.block_at(0x6000).is_none());

        // Text in another script cannot follow a move, so nothing is relocated
        let err = Relocator::default()
            .relocate(&[], BTreeMap::new(), graph.external_references())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnlinkedExternalReference { source_addr: Some(0x101), target: 0x6000 }
        ));
    }

    #[test]
    fn test_event_call_without_si() {
        let data = [0u8; 0x20];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new().call(0x100, 0x853f).ret(0x103);
        let recognizers: Vec<Box<dyn Recognizer>> = vec![Box::new(EventCall::default())];

        let err = explore(region, &[EntryPoint::code(0x100)], &recognizers, &source).unwrap_err();
        assert!(matches!(err, Error::UnresolvedRegister { reg: Reg::Si, .. }));
    }

    #[test]
    fn test_event_store() {
        let mut data = [0u8; 0x40];
        data[0x30] = 0x41;
        let region = Region::new(0x100, &data);
        let store = Insn::new(0x103, 3, "mov")
            .with_operand(Operand::Mem { disp: 0xdd04 })
            .with_operand(Operand::Reg(Reg::Ax));
        let source = ScriptedSource::new()
            .mov_imm(0x100, Reg::Ax, 0x130)
            .push(store)
            .ret(0x106);
        let recognizers: Vec<Box<dyn Recognizer>> = vec![Box::new(EventStore { slot: 0xdd04 })];

        let graph = explore(region, &[EntryPoint::code(0x100)], &recognizers, &source).unwrap();

        let event = graph.block_at(0x130).unwrap();
        assert_eq!(event.kind(), BlockKind::Event);
        assert_eq!(graph.incoming(event).next().unwrap().source_addr, Some(0x101));
    }
}
