//! Core records, traits and errors for the script relocation toolkit.
//!
//! This library discovers the event scripts embedded in a 16-bit program
//! image, converts them to an editable text form and back, and relocates
//! translated scripts inside the fixed-size image while rewriting every
//! pointer that refers to them.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use script_reloc::{
//!     decoder::CapstoneDecoder,
//!     explore::explore,
//!     relocate::{encode_translations, RelocateOptions, Relocator},
//!     script::{self, ScriptKey, ScriptKind},
//!     Region,
//! };
//!
//! let data = std::fs::read("scenario.bin").unwrap();
//! let key = ScriptKey::new(0x10, 0x00, 0x20);
//! let region = Region::new(0xe000, &data);
//!
//! let decoder = CapstoneDecoder::new().unwrap();
//! let entries = script::entry_points(ScriptKind::Scenario, key, region).unwrap();
//! let recognizers = script::recognizers(ScriptKind::Scenario, key);
//!
//! let graph = explore(region, &entries, &recognizers, &decoder).unwrap();
//! let events = script::collect_events(&graph).unwrap();
//!
//! let options = RelocateOptions::default();
//! let encoded = encode_translations(&events, &Default::default(), &options.slot_limits).unwrap();
//! let relocation = Relocator::new(options)
//!     .relocate(&events, encoded, graph.external_references())
//!     .unwrap();
//! ```

pub mod block;
pub mod context;
pub mod decoder;
pub mod event;
pub mod explore;
pub mod format;
pub mod patch;
pub mod recognizer;
pub mod registry;
pub mod relocate;
pub mod script;
pub mod space;
pub mod strategy;
pub mod translation;
mod pipeline_tests;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use serde::{Deserialize, Serialize};

/// An offset into the flat 16-bit address space a script is mapped into.
pub type Address = u16;

/// An immutable byte buffer mapped at a base address.
///
/// Every lookup obeys `address = base + index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    base: Address,
    data: &'a [u8],
}

impl<'a> Region<'a> {
    /// Map `data` at `base`.
    pub fn new(base: Address, data: &'a [u8]) -> Self {
        Self { base, data }
    }

    /// Address of the first byte
    pub fn base(&self) -> Address {
        self.base
    }

    /// One past the last mapped address; may be 0x10000.
    pub fn end(&self) -> u32 {
        u32::from(self.base) + self.data.len() as u32
    }

    /// The raw bytes
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of mapped bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if `addr` is mapped by this region.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && u32::from(addr) < self.end()
    }

    /// Index of `addr` into the buffer.
    pub fn offset(&self, addr: Address) -> Option<usize> {
        self.contains(addr).then(|| usize::from(addr - self.base))
    }

    /// The bytes from `addr` to the end of the region.
    pub fn tail(&self, addr: Address) -> Option<&'a [u8]> {
        self.offset(addr).map(|off| &self.data[off..])
    }

    /// Read one byte.
    pub fn read_u8(&self, addr: Address) -> Result<u8, Error> {
        self.offset(addr)
            .map(|off| self.data[off])
            .ok_or(Error::OutOfRegion(addr))
    }

    /// Read a little-endian 16-bit value.
    pub fn read_u16(&self, addr: Address) -> Result<u16, Error> {
        let off = self.offset(addr).ok_or(Error::OutOfRegion(addr))?;
        match self.data.get(off..off + 2) {
            Some(pair) => Ok(u16::from_le_bytes([pair[0], pair[1]])),
            None => Err(Error::OutOfRegion(addr.wrapping_add(1))),
        }
    }
}

/// A 16-bit x86 register, with partial registers folded into their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Reg {
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Bp,
    Sp,
    Cs,
    Ds,
    Es,
    Ss,
    /// Anything the context tracker has no name for (flags, ip, ...)
    Other(u16),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Ax => write!(f, "ax"),
            Reg::Bx => write!(f, "bx"),
            Reg::Cx => write!(f, "cx"),
            Reg::Dx => write!(f, "dx"),
            Reg::Si => write!(f, "si"),
            Reg::Di => write!(f, "di"),
            Reg::Bp => write!(f, "bp"),
            Reg::Sp => write!(f, "sp"),
            Reg::Cs => write!(f, "cs"),
            Reg::Ds => write!(f, "ds"),
            Reg::Es => write!(f, "es"),
            Reg::Ss => write!(f, "ss"),
            Reg::Other(id) => write!(f, "reg#{}", id),
        }
    }
}

/// An instruction operand, reduced to the 16-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Immediate value (branch targets included)
    Imm(u16),
    /// Register
    Reg(Reg),
    /// Memory reference; only the displacement is kept
    Mem { disp: u16 },
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowClass {
    /// Falls through to the next instruction
    #[default]
    None,
    /// Unconditional jump
    Jump,
    /// Conditional jump
    ConditionalJump,
    /// Subroutine call
    Call,
    /// Return from subroutine or interrupt
    Return,
    /// Counted loop
    Loop,
}

/// One decoded machine instruction, as produced by an [`InstructionSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Encoded length in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "call")
    pub mnemonic: String,
    /// Operand text, for listings only
    pub op_str: String,
    /// Control-flow classification
    pub flow: FlowClass,
    /// Structured operands
    pub operands: Vec<Operand>,
    /// Registers read
    pub regs_read: Vec<Reg>,
    /// Registers written
    pub regs_written: Vec<Reg>,
}

impl Insn {
    /// A bare instruction with no operands and no flow effect.
    pub fn new(addr: Address, size: u8, mnemonic: &str) -> Self {
        Self {
            addr,
            size,
            mnemonic: mnemonic.to_string(),
            op_str: String::new(),
            flow: FlowClass::None,
            operands: Vec::new(),
            regs_read: Vec::new(),
            regs_written: Vec::new(),
        }
    }

    /// Set the flow class.
    pub fn with_flow(mut self, flow: FlowClass) -> Self {
        self.flow = flow;
        self
    }

    /// Append an operand.
    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Mark a register as written.
    pub fn writes(mut self, reg: Reg) -> Self {
        self.regs_written.push(reg);
        self
    }

    /// Address just past this instruction; 0x10000 at the top of memory.
    pub fn next_addr(&self) -> u32 {
        u32::from(self.addr) + u32::from(self.size)
    }

    /// True for a plain `mov`.
    pub fn is_mov(&self) -> bool {
        self.mnemonic.eq_ignore_ascii_case("mov")
    }

    /// The first operand's immediate, which is the destination of direct
    /// jumps, calls and loops.
    pub fn immediate_target(&self) -> Option<Address> {
        match self.operands.first() {
            Some(Operand::Imm(value)) => Some(*value),
            _ => None,
        }
    }

    /// `(register, value)` if this is `mov reg, imm`.
    pub fn mov_immediate(&self) -> Option<(Reg, u16)> {
        if !self.is_mov() {
            return None;
        }
        match (self.operands.first(), self.operands.get(1)) {
            (Some(Operand::Reg(reg)), Some(Operand::Imm(value))) => Some((*reg, *value)),
            _ => None,
        }
    }

    /// True if this is a call or jump directly to `target`.
    pub fn transfers_to(&self, target: Address) -> bool {
        matches!(
            self.flow,
            FlowClass::Call | FlowClass::Jump | FlowClass::ConditionalJump
        ) && self.immediate_target() == Some(target)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.op_str)
    }
}

/// Source of normalized instruction records.
pub trait InstructionSource {
    /// Decode the instruction at `at` inside `region`.
    ///
    /// # Returns
    /// `None` if no valid instruction starts at `at`.
    fn decode(&self, region: &Region<'_>, at: Address) -> Option<Insn>;
}

/// Error type for exploration, coding and relocation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An event byte below the text threshold has no table entry
    #[error("Unknown event code {code:02x} at {addr:04x}")]
    UnknownOpcode { code: u8, addr: Address },

    /// A recognizer precondition could not be disambiguated
    #[error("Ambiguous entry pattern: {0}")]
    AmbiguousEntryPattern(String),

    /// Encoded content does not fit its slot
    #[error("Translation{} is too long: {translated} bytes for a {original}-byte slot", describe_addr(.addr))]
    OversizeTranslation {
        addr: Option<Address>,
        original: usize,
        translated: usize,
    },

    /// The free-space pool cannot satisfy a request
    #[error("Out of space: needed {requested} bytes, {total} free in total, largest span {largest}")]
    OutOfSpace {
        requested: usize,
        total: usize,
        largest: usize,
    },

    /// A reference into event text outside the current region
    #[error("Reference at {source_addr:?} points to event text at {target:04x} outside this script")]
    UnlinkedExternalReference {
        source_addr: Option<Address>,
        target: Address,
    },

    /// The instruction source produced nothing at an address the walk must visit
    #[error("No instruction could be decoded at {0:04x}")]
    InstructionDecode(Address),

    /// An address was requested as one block kind but belongs to the other
    #[error("Expected {expected} block at {addr:04x}, found {found}")]
    BlockKindMismatch {
        addr: Address,
        expected: block::BlockKind,
        found: block::BlockKind,
    },

    /// A recognizer needs a register value that is not known
    #[error("Value of {reg} is unknown at {addr:04x}")]
    UnresolvedRegister { addr: Address, reg: Reg },

    /// A recognizer is attached to an instruction of the wrong shape
    #[error("Unexpected instruction at {addr:04x}: {text}")]
    UnexpectedInstruction { addr: Address, text: String },

    /// A read fell outside the region
    #[error("Address {0:04x} is outside the region")]
    OutOfRegion(Address),

    /// Text that cannot be decoded or encoded
    #[error("Invalid text at {addr:04x}: {detail}")]
    InvalidText { addr: Address, detail: String },

    /// A character with no single- or double-byte text encoding
    #[error("Character {0:?} cannot be encoded")]
    Unencodable(char),

    /// Encoder input contains a tag it does not know
    #[error("Unknown tag {0}")]
    UnknownTag(String),

    /// Encoder input contains a known tag with a bad argument
    #[error("Malformed tag {0}")]
    MalformedTag(String),

    /// An event jumps to its own end and also carries a continuation
    #[error("Event at {0:04x} has both a jump to its end and a continuation")]
    AmbiguousContinuation(Address),

    /// A reference targets the inside of a relocated block with no locator
    #[error("Reference to {target:04x} cannot follow its block: no locator marks that address")]
    MissingLocator { target: Address },

    /// A translation row names no event and nothing jumps to it
    #[error("Translation row {0} matches no event and is never referenced")]
    UnmatchedTranslation(String),

    /// A discovered event has no encoded content
    #[error("No encoded content for event at {0:04x}")]
    MissingContent(Address),

    /// A malformed span or allocation request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A code walk did not terminate
    #[error("Walk from {0:04x} did not terminate")]
    RunawayWalk(Address),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attach the event address to an error raised before it was known.
    pub fn at(self, event: Address) -> Self {
        match self {
            Error::OversizeTranslation { addr: None, original, translated } => Error::OversizeTranslation {
                addr: Some(event),
                original,
                translated,
            },
            other => other,
        }
    }
}

fn describe_addr(addr: &Option<Address>) -> String {
    addr.map(|a| format!(" of {:04x}", a)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_lookup() {
        let data = [0x34, 0x12, 0xff];
        let region = Region::new(0xe000, &data);

        assert!(region.contains(0xe000));
        assert!(region.contains(0xe002));
        assert!(!region.contains(0xe003));
        assert!(!region.contains(0xdfff));
        assert_eq!(region.read_u16(0xe000).unwrap(), 0x1234);
        assert!(matches!(region.read_u16(0xe002), Err(Error::OutOfRegion(0xe003))));
        assert_eq!(region.tail(0xe001).unwrap(), &[0x12, 0xff]);
    }

    #[test]
    fn test_region_at_top_of_memory() {
        let data = vec![0u8; 0x2000];
        let region = Region::new(0xe000, &data);

        assert_eq!(region.end(), 0x10000);
        assert!(region.contains(0xffff));
        assert_eq!(region.offset(0xffff), Some(0x1fff));
    }

    #[test]
    fn test_insn_helpers() {
        let mov = Insn::new(0x100, 3, "mov")
            .with_operand(Operand::Reg(Reg::Si))
            .with_operand(Operand::Imm(0xe123))
            .writes(Reg::Si);
        assert_eq!(mov.mov_immediate(), Some((Reg::Si, 0xe123)));
        assert_eq!(mov.next_addr(), 0x103);

        let call = Insn::new(0x103, 3, "call")
            .with_flow(FlowClass::Call)
            .with_operand(Operand::Imm(0x6e77));
        assert!(call.transfers_to(0x6e77));
        assert!(!call.transfers_to(0x6e7c));
        assert_eq!(call.mov_immediate(), None);
    }
}
