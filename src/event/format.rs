//! Instruction list to editable text.
//!
//! The text form round-trips through [`encode_event`](super::encode_event):
//! every opcode either has a named tag or falls back to `<X..>` with the raw
//! bytes in hex.

use std::collections::BTreeSet;

use super::*;
use crate::{Address, Error, Region};

/// Render the event at `start` as tagged text.
///
/// `locators` are addresses inside the event that something outside it
/// refers to; each one (and each in-event jump target) gets a `<LOCxxxx>`
/// label so the reference survives re-encoding.
pub fn format_event(
    region: &Region<'_>,
    start: Address,
    continuation: Option<Address>,
    locators: &BTreeSet<Address>,
) -> Result<String, Error> {
    let instructions = decode_event(region, start, continuation)?;
    Ok(format_instructions(region, &instructions, locators))
}

/// Render an already decoded instruction list.
pub fn format_instructions(
    region: &Region<'_>,
    instructions: &[EventInstruction],
    locators: &BTreeSet<Address>,
) -> String {
    let end = instructions.last().map_or(0, |i| i.end());
    let jump_targets: BTreeSet<Address> = instructions
        .iter()
        .filter(|i| i.code() == Some(JUMP))
        .filter_map(|i| i.operand())
        .collect();

    let mut out = String::new();
    for insn in instructions {
        if !out.is_empty() && (jump_targets.contains(&insn.addr) || locators.contains(&insn.addr)) {
            out.push_str(&format!("<LOC{:04x}>", insn.addr));
        }

        match &insn.op {
            EventOp::Text(text) => out.push_str(text),
            EventOp::Code { code, data } => out.push_str(&format_code(region, insn, *code, data, end)),
        }

        if insn.continues {
            out.push_str("\n<CONT>");
        }
    }
    out
}

fn format_code(region: &Region<'_>, insn: &EventInstruction, code: u8, data: &[u8], end: u32) -> String {
    let operand = insn.operand().unwrap_or(0);
    match code {
        // The final terminator is implied
        END if insn.end() < end => "<END>\n".to_string(),
        END => String::new(),
        NEWLINE => {
            // Doubled newlines would read back as a page break
            let next = insn.addr.checked_add(1).map(|a| region.read_u8(a));
            if matches!(next, Some(Ok(NEWLINE))) {
                "<N>\n".to_string()
            } else {
                "\n".to_string()
            }
        }
        WAIT => "<WAIT>\n".to_string(),
        PAGE => {
            let previous = insn.addr.checked_sub(1).map(|a| region.read_u8(a));
            if matches!(previous, Some(Ok(NEWLINE))) {
                "<PAGE>\n".to_string()
            } else {
                "\n\n".to_string()
            }
        }
        RETURN_INLINE => "<RET_IL>".to_string(),
        RETURN => "<RETN>".to_string(),
        CHARACTER => format!("<CH{}>", data.first().copied().unwrap_or(0)),
        JUMP => format!("<JUMP{:04x}>", operand),
        CALL => format!("<CALL{:04x}>", operand),
        IF_NOT => format!("<IF_NOT{:04x}>", operand),
        IF => format!("<IF{:04x}>", operand),
        CLEAR => format!("<CLEAR{:04x}>", operand),
        SET => format!("<SET{:04x}>", operand),
        ASM if insn.end() >= end => format!("<ASM_NORET{:04x}>", operand),
        ASM => format!("<ASM{:04x}>", operand),
        LEADER => {
            let targets: Vec<String> = (0..LEADER_SLOTS)
                .map(|slot| format!("{:04x}", insn.operand_at(slot).unwrap_or(0)))
                .collect();
            format!("<LEADER{}>", targets.join(","))
        }
        _ => {
            let raw: String = data.iter().map(|byte| format!("{:02x}", byte)).collect();
            format!("<X{:02x}{}>", code, raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(bytes: &[u8]) -> String {
        let region = Region::new(0x100, bytes);
        format_event(&region, 0x100, None, &BTreeSet::new()).unwrap()
    }

    #[test]
    fn test_format_basic_tags() {
        // "Hi" newline "Yo" wait; set 0x0033; return
        let text = format(&[0x48, 0x69, 0x01, 0x59, 0x6f, 0x03, 0x14, 0x33, 0x00, 0x07]);
        assert_eq!(text, "Hi\nYo<WAIT>\n<SET0033><RETN>");
    }

    #[test]
    fn test_format_newline_and_page_disambiguation() {
        assert_eq!(format(&[0x41, 0x01, 0x01, 0x42, 0x00]), "A<N>\n\nB");
        assert_eq!(format(&[0x41, 0x05, 0x42, 0x00]), "A\n\nB");
        assert_eq!(format(&[0x41, 0x01, 0x05, 0x42, 0x00]), "A\n<PAGE>\nB");
    }

    #[test]
    fn test_format_end_only_when_not_last() {
        // jump over the first end so decoding keeps going
        let text = format(&[0x0f, 0x04, 0x01, 0x00, 0x41, 0x00]);
        assert_eq!(text, "<JUMP0104><END>\n<LOC0104>A");
    }

    #[test]
    fn test_format_unnamed_and_leader() {
        let text = format(&[0x0c, 0x12, 0x34, 0x16, 1, 0xe1, 2, 0xe1, 3, 0xe1, 4, 0xe1, 5, 0xe1, 0x07]);
        assert_eq!(text, "<X0c1234><LEADERe101,e102,e103,e104,e105><RETN>");
    }

    #[test]
    fn test_format_asm_noreturn() {
        assert_eq!(format(&[0x15, 0x87, 0xe8]), "<ASM_NORETe887>");
        assert_eq!(format(&[0x15, 0x00, 0x90, 0x07]), "<ASM9000><RETN>");
    }

    #[test]
    fn test_format_locators_and_continuation() {
        let bytes = [0x41, 0x42, 0x07, 0x43, 0x07];
        let region = Region::new(0x100, &bytes);
        let locators: BTreeSet<Address> = [0x100, 0x103].into_iter().collect();

        let text = format_event(&region, 0x100, Some(0x103), &locators).unwrap();
        assert_eq!(text, "AB<RETN>\n<CONT><LOC0103>C<RETN>");
    }
}
