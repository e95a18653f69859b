//! Event script bytecode: opcode table, decoding, text formatting and encoding.
//!
//! Event scripts interleave double-byte text with single-byte control codes.
//! Bytes below [`TEXT_THRESHOLD`] are opcodes with a fixed payload; anything
//! else is text.

mod decode;
mod encode;
mod format;

pub use self::decode::*;
pub use self::encode::*;
pub use self::format::*;

use serde::Serialize;

use crate::Address;

/// Bytes below this value are opcodes.
pub const TEXT_THRESHOLD: u8 = 0x20;

pub const END: u8 = 0x00;
pub const NEWLINE: u8 = 0x01;
pub const WAIT: u8 = 0x03;
pub const PAGE: u8 = 0x05;
pub const RETURN_INLINE: u8 = 0x06;
pub const RETURN: u8 = 0x07;
pub const CHARACTER: u8 = 0x09;
pub const JUMP: u8 = 0x0f;
pub const CALL: u8 = 0x10;
pub const IF_NOT: u8 = 0x11;
pub const IF: u8 = 0x12;
pub const CLEAR: u8 = 0x13;
pub const SET: u8 = 0x14;
pub const ASM: u8 = 0x15;
pub const LEADER: u8 = 0x16;

/// Number of per-leader targets carried by [`LEADER`].
pub const LEADER_SLOTS: usize = 5;

/// Assembly routine that never hands control back to the script.
pub const NORETURN_ASM_ROUTINE: Address = 0xe887;

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Total encoded length, opcode byte included
    pub length: usize,
    /// Linear execution stops after this opcode
    pub terminator: bool,
}

const fn op(length: usize) -> Option<OpcodeInfo> {
    Some(OpcodeInfo { length, terminator: false })
}

const fn term() -> Option<OpcodeInfo> {
    Some(OpcodeInfo { length: 1, terminator: true })
}

static OPCODES: [Option<OpcodeInfo>; TEXT_THRESHOLD as usize] = [
    term(),  // 00 end
    op(1),   // 01 newline
    op(1),   // 02
    op(1),   // 03 wait for keypress
    op(1),   // 04 reset colour
    op(1),   // 05 page break
    term(),  // 06 inline return
    term(),  // 07 return
    op(1),   // 08 clear window
    op(2),   // 09 character name
    term(),  // 0a
    op(1),   // 0b
    op(3),   // 0c sound
    term(),  // 0d
    op(1),   // 0e item name
    op(3),   // 0f jump
    op(3),   // 10 call
    op(3),   // 11 if not flag
    op(3),   // 12 if flag
    op(3),   // 13 clear flag
    op(3),   // 14 set flag
    op(3),   // 15 assembly call
    op(11),  // 16 call by leader
    None,
    None,
    None,
    op(1),   // 1a
    None,
    op(1),   // 1c green
    None,
    op(1),   // 1e yellow
    op(1),   // 1f
];

/// Table entry for `code`, if it is a known opcode.
pub fn opcode_info(code: u8) -> Option<OpcodeInfo> {
    OPCODES.get(usize::from(code)).copied().flatten()
}

/// Payload of a decoded event instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventOp {
    /// A run of decoded text
    Text(String),
    /// An opcode and its payload
    Code { code: u8, data: Vec<u8> },
}

/// One decoded event instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventInstruction {
    /// Address of the first byte
    pub addr: Address,
    /// Encoded length in bytes
    pub length: u16,
    pub op: EventOp,
    /// Decoding went on past this terminator because of a continuation extent
    pub continues: bool,
}

impl EventInstruction {
    /// One past the last byte
    pub fn end(&self) -> u32 {
        u32::from(self.addr) + u32::from(self.length)
    }

    /// The opcode, for non-text instructions
    pub fn code(&self) -> Option<u8> {
        match &self.op {
            EventOp::Code { code, .. } => Some(*code),
            EventOp::Text(_) => None,
        }
    }

    /// The `index`-th little-endian word of the payload.
    pub fn operand_at(&self, index: usize) -> Option<u16> {
        match &self.op {
            EventOp::Code { data, .. } => data
                .get(index * 2..index * 2 + 2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
            EventOp::Text(_) => None,
        }
    }

    /// The first payload word; the target of jumps and calls.
    pub fn operand(&self) -> Option<u16> {
        self.operand_at(0)
    }
}
