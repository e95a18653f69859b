//! Recognizers that read jump and text tables out of the region.

use super::{Recognizer, Resume, Trigger};
use crate::block::{BlockKind, Link};
use crate::context::ExecutionContext;
use crate::registry::Linker;
use crate::{Address, Error, Insn, Reg};

/// Where a table starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableBase {
    /// At a fixed address
    Fixed(Address),
    /// At the value a register holds when the trigger is reached
    Register(Reg),
}

fn register_value(context: &ExecutionContext, insn: &Insn, reg: Reg) -> Result<u16, Error> {
    context
        .get(reg)
        .map(|v| v.value)
        .ok_or(Error::UnresolvedRegister { addr: insn.addr, reg })
}

/// A fixed-count table of pointers, all to blocks of one kind.
///
/// Entry `i` holds its pointer at `base + i * stride + offset`. Pointers
/// that fall outside the region are ignored.
#[derive(Debug, Clone)]
pub struct PointerTable {
    pub kind: BlockKind,
    pub trigger: Trigger,
    pub base: TableBase,
    pub count: usize,
    pub stride: u16,
    pub offset: u16,
    pub resume: Resume,
}

impl PointerTable {
    /// A table read at a fixed instruction, walking on afterwards as `resume` says.
    pub fn at(kind: BlockKind, at: Address, base: TableBase, count: usize, stride: u16, offset: u16, resume: Resume) -> Self {
        Self { kind, trigger: Trigger::At(at), base, count, stride, offset, resume }
    }

    /// A table passed in `reg` to a routine.
    pub fn called(kind: BlockKind, routine: Address, reg: Reg, count: usize, stride: u16) -> Self {
        Self {
            kind,
            trigger: Trigger::CallTo(vec![routine]),
            base: TableBase::Register(reg),
            count,
            stride,
            offset: 0,
            resume: Resume::Next,
        }
    }
}

impl Recognizer for PointerTable {
    fn name(&self) -> &str {
        "pointer table"
    }

    fn matches(&self, insn: &Insn) -> bool {
        self.trigger.matches(insn)
    }

    fn resume_address(&self, insn: &Insn) -> Option<Address> {
        self.resume.address(insn)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let base = match self.base {
            TableBase::Fixed(addr) => addr,
            TableBase::Register(reg) => register_value(context, insn, reg)?,
        };
        let region = linker.region();

        for index in 0..self.count {
            let entry = base
                .wrapping_add(index as u16 * self.stride)
                .wrapping_add(self.offset);
            let target = linker.read_u16(entry)?;
            if !region.contains(target) {
                log::debug!("Table entry at 0x{:04x} points outside the script: 0x{:04x}", entry, target);
                continue;
            }
            linker.connect(Link::new(Some(entry), target), self.kind)?;
        }
        Ok(())
    }
}

/// A counted array of records each carrying one code and one event pointer.
///
/// The table address and record count are taken from registers at the
/// trigger.
#[derive(Debug, Clone)]
pub struct RecordTable {
    pub at: Address,
    pub resume: Address,
    pub table_reg: Reg,
    pub count_reg: Reg,
    pub stride: u16,
    pub code_offset: u16,
    pub event_offset: u16,
}

impl RecordTable {
    /// The world-map destination list: `si` points at 12-byte records, `cx`
    /// holds the count.
    pub fn destinations(at: Address, resume: Address) -> Self {
        Self {
            at,
            resume,
            table_reg: Reg::Si,
            count_reg: Reg::Cx,
            stride: 0x0c,
            code_offset: 0x08,
            event_offset: 0x0a,
        }
    }
}

impl Recognizer for RecordTable {
    fn name(&self) -> &str {
        "record table"
    }

    fn matches(&self, insn: &Insn) -> bool {
        insn.addr == self.at
    }

    fn resume_address(&self, _insn: &Insn) -> Option<Address> {
        Some(self.resume)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let mut record = register_value(context, insn, self.table_reg)?;
        let count = register_value(context, insn, self.count_reg)?;

        for _ in 0..count {
            let code = record.wrapping_add(self.code_offset);
            let event = record.wrapping_add(self.event_offset);
            let code_target = linker.read_u16(code)?;
            let event_target = linker.read_u16(event)?;
            linker.connect(Link::new(Some(code), code_target), BlockKind::Code)?;
            linker.connect(Link::new(Some(event), event_target), BlockKind::Event)?;
            record = record.wrapping_add(self.stride);
        }
        Ok(())
    }
}

/// A table of variable-length records ended by a sentinel byte.
///
/// Each record starts with a flag byte; the code pointer sits at
/// `short_offset` or, when `flag & long_mask` is set, at `long_offset`, and
/// the next record follows right after it.
#[derive(Debug, Clone)]
pub struct TerminatedTable {
    pub trigger: Trigger,
    pub table_reg: Reg,
    pub sentinel: u8,
    pub long_mask: u8,
    pub short_offset: u16,
    pub long_offset: u16,
}

impl TerminatedTable {
    /// The NPC interaction list passed in `si`.
    pub fn npc_list(routines: &[Address]) -> Self {
        Self {
            trigger: Trigger::CallTo(routines.to_vec()),
            table_reg: Reg::Si,
            sentinel: 0xff,
            long_mask: 0x40,
            short_offset: 3,
            long_offset: 5,
        }
    }
}

impl Recognizer for TerminatedTable {
    fn name(&self) -> &str {
        "terminated table"
    }

    fn matches(&self, insn: &Insn) -> bool {
        self.trigger.matches(insn)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let start = register_value(context, insn, self.table_reg)?;
        let limit = linker.region().len();
        let mut record = start;

        for _ in 0..limit {
            let flag = linker.read_u8(record)?;
            if flag == self.sentinel {
                return Ok(());
            }
            let offset = if flag & self.long_mask == 0 { self.short_offset } else { self.long_offset };
            let field = record.wrapping_add(offset);
            let target = linker.read_u16(field)?;
            linker.connect(Link::new(Some(field), target), BlockKind::Code)?;
            record = field.wrapping_add(2);
        }
        Err(Error::RunawayWalk(start))
    }
}

/// A table whose first word is the entry count plus one, followed by code
/// pointers.
#[derive(Debug, Clone)]
pub struct CountedTable {
    pub trigger: Trigger,
    pub table_reg: Reg,
}

impl CountedTable {
    /// The NPC movement table passed in `dx`.
    pub fn npc_moves(routine: Address) -> Self {
        Self { trigger: Trigger::CallTo(vec![routine]), table_reg: Reg::Dx }
    }
}

impl Recognizer for CountedTable {
    fn name(&self) -> &str {
        "counted table"
    }

    fn matches(&self, insn: &Insn) -> bool {
        self.trigger.matches(insn)
    }

    fn link(&self, insn: &Insn, linker: &mut Linker<'_, '_>, context: &mut ExecutionContext) -> Result<(), Error> {
        let table = register_value(context, insn, self.table_reg)?;
        let count = linker.read_u16(table)?.saturating_sub(1);
        let region = linker.region();

        for index in 0..count {
            let field = table.wrapping_add(2 + 2 * index);
            let target = linker.read_u16(field)?;
            if region.contains(target) {
                linker.connect(Link::new(Some(field), target), BlockKind::Code)?;
            }
        }
        Ok(())
    }
}
