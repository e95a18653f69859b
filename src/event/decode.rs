//! Raw event bytecode to instruction list.

use std::collections::BTreeSet;

use encoding_rs::SHIFT_JIS;

use super::{opcode_info, EventInstruction, EventOp, ASM, JUMP, NORETURN_ASM_ROUTINE, TEXT_THRESHOLD};
use crate::{Address, Error, Region};

/// Width in bytes of the text character starting with `lead`.
fn text_width(lead: u8) -> usize {
    match lead {
        0xe0..=0xff => 2,
        0xa0..=0xdf => 1,
        0x80..=0x9f => 2,
        _ => 1,
    }
}

/// Decode the event starting at `start`.
///
/// Decoding stops at the first terminator, unless a jump seen earlier lands
/// just past it or `continuation` reaches at least that far; in the latter
/// case the terminator is flagged as continuing. It also stops after a call
/// to the no-return assembly routine and at the end of the region.
pub fn decode_event(
    region: &Region<'_>,
    start: Address,
    continuation: Option<Address>,
) -> Result<Vec<EventInstruction>, Error> {
    if !region.contains(start) {
        return Err(Error::OutOfRegion(start));
    }

    let data = region.data();
    let mut instructions: Vec<EventInstruction> = Vec::new();
    let mut jumps = BTreeSet::new();
    let mut pos = u32::from(start);

    while pos < region.end() {
        let addr = pos as Address;
        let offset = usize::from(addr - region.base());

        // A jump landing mid-text starts a new run
        if jumps.remove(&addr) {
            if let Some(EventInstruction { op: EventOp::Text(_), .. }) = instructions.last() {
                instructions.push(EventInstruction {
                    addr,
                    length: 0,
                    op: EventOp::Text(String::new()),
                    continues: false,
                });
            }
        }

        let byte = data[offset];
        if byte < TEXT_THRESHOLD {
            let info = opcode_info(byte).ok_or(Error::UnknownOpcode { code: byte, addr })?;
            let payload = data
                .get(offset + 1..offset + info.length)
                .ok_or(Error::OutOfRegion(addr))?
                .to_vec();
            instructions.push(EventInstruction {
                addr,
                length: info.length as u16,
                op: EventOp::Code { code: byte, data: payload },
                continues: false,
            });
            pos += info.length as u32;

            let last = instructions.len() - 1;
            if byte == JUMP {
                if let Some(target) = instructions[last].operand() {
                    jumps.insert(target);
                }
            } else if byte == ASM {
                if instructions[last].operand() == Some(NORETURN_ASM_ROUTINE) {
                    break;
                }
            } else if info.terminator {
                let jumped = pos <= 0xffff && jumps.contains(&(pos as Address));
                let continues = continuation.map_or(false, |extent| pos <= u32::from(extent));
                if jumped && continues {
                    return Err(Error::AmbiguousContinuation(start));
                } else if jumped {
                    jumps.remove(&(pos as Address));
                } else if continues {
                    instructions[last].continues = true;
                } else {
                    break;
                }
            }
        } else {
            let width = text_width(byte);
            let bytes = data.get(offset..offset + width).ok_or_else(|| Error::InvalidText {
                addr,
                detail: "truncated double-byte character".to_string(),
            })?;
            let decoded = SHIFT_JIS
                .decode_without_bom_handling_and_without_replacement(bytes)
                .ok_or_else(|| Error::InvalidText {
                    addr,
                    detail: format!("undecodable sequence {:02x?}", bytes),
                })?;

            match instructions.last_mut() {
                Some(EventInstruction { op: EventOp::Text(text), length, .. }) => {
                    text.push_str(&decoded);
                    *length += width as u16;
                }
                _ => instructions.push(EventInstruction {
                    addr,
                    length: width as u16,
                    op: EventOp::Text(decoded.into_owned()),
                    continues: false,
                }),
            }
            pos += width as u32;
        }
    }

    Ok(instructions)
}

/// One past the last byte of the event at `start`.
pub fn event_end(
    region: &Region<'_>,
    start: Address,
    continuation: Option<Address>,
) -> Result<u32, Error> {
    let instructions = decode_event(region, start, continuation)?;
    Ok(instructions.last().map_or(u32::from(start), |i| i.end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RETURN, SET};

    fn text_of(insn: &EventInstruction) -> &str {
        match &insn.op {
            EventOp::Text(text) => text,
            EventOp::Code { .. } => panic!("expected text at {:04x}", insn.addr),
        }
    }

    #[test]
    fn test_decode_text_and_terminator() {
        // "Hi", set flag 0x0102, return, then bytes that must not be read
        let bytes = [0x48, 0x69, 0x14, 0x02, 0x01, 0x07, 0xff, 0xff];
        let region = Region::new(0xe000, &bytes);

        let insns = decode_event(&region, 0xe000, None).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(text_of(&insns[0]), "Hi");
        assert_eq!(insns[0].length, 2);
        assert_eq!(insns[1].code(), Some(SET));
        assert_eq!(insns[1].operand(), Some(0x0102));
        assert_eq!(insns[2].code(), Some(RETURN));
        assert_eq!(event_end(&region, 0xe000, None).unwrap(), 0xe006);
    }

    #[test]
    fn test_decode_double_byte_tiers() {
        // Full-width "あ" (82 a0), half-width katakana "ｱ" (b1), kanji "亜" (88 9f)
        let bytes = [0x82, 0xa0, 0xb1, 0x88, 0x9f, 0x00];
        let region = Region::new(0x100, &bytes);

        let insns = decode_event(&region, 0x100, None).unwrap();
        assert_eq!(text_of(&insns[0]), "あｱ亜");
        assert_eq!(insns[0].length, 5);
    }

    #[test]
    fn test_unknown_opcode() {
        let bytes = [0x41, 0x17, 0x00];
        let region = Region::new(0x100, &bytes);

        let err = decode_event(&region, 0x100, None).unwrap_err();
        assert!(matches!(err, Error::UnknownOpcode { code: 0x17, addr: 0x101 }));
    }

    #[test]
    fn test_continuation_extent() {
        // "A" ret "B" ret "C" ret
        let bytes = [0x41, 0x07, 0x42, 0x07, 0x43, 0x07];
        let region = Region::new(0x100, &bytes);

        assert_eq!(event_end(&region, 0x100, None).unwrap(), 0x102);

        let insns = decode_event(&region, 0x100, Some(0x102)).unwrap();
        assert_eq!(insns.len(), 4);
        assert!(insns[1].continues);
        assert!(!insns[3].continues);
        assert_eq!(event_end(&region, 0x100, Some(0x104)).unwrap(), 0x106);
    }

    #[test]
    fn test_jump_past_terminator_continues() {
        // jump 0x105; ret; "Z" ret -- the target is not right after the ret
        let bytes = [0x0f, 0x05, 0x01, 0x07, 0x5a, 0x07, 0x00];
        let region = Region::new(0x100, &bytes);

        let insns = decode_event(&region, 0x100, None).unwrap();
        assert_eq!(insns.len(), 2);

        // jump 0x104; ret; "Z" ret
        let bytes = [0x0f, 0x04, 0x01, 0x07, 0x5a, 0x07, 0x00];
        let region = Region::new(0x100, &bytes);
        let insns = decode_event(&region, 0x100, None).unwrap();
        assert_eq!(insns.len(), 4);
        assert_eq!(text_of(&insns[2]), "Z");

        let err = decode_event(&region, 0x100, Some(0x104)).unwrap_err();
        assert!(matches!(err, Error::AmbiguousContinuation(0x100)));
    }

    #[test]
    fn test_jump_splits_text_run() {
        // jump 0x105; "AB" "CD" ret -- the jump lands between B and C
        let bytes = [0x0f, 0x05, 0x01, 0x41, 0x42, 0x43, 0x44, 0x07];
        let region = Region::new(0x100, &bytes);

        let insns = decode_event(&region, 0x100, None).unwrap();
        assert_eq!(insns.len(), 4);
        assert_eq!(text_of(&insns[1]), "AB");
        assert_eq!(insns[2].addr, 0x105);
        assert_eq!(text_of(&insns[2]), "CD");
    }

    #[test]
    fn test_noreturn_asm_stops() {
        let bytes = [0x15, 0x87, 0xe8, 0x41, 0x00];
        let region = Region::new(0x100, &bytes);

        let insns = decode_event(&region, 0x100, None).unwrap();
        assert_eq!(insns.len(), 1);
    }
}
