//! Tagged text back to event bytecode.

use std::collections::BTreeMap;

use encoding_rs::SHIFT_JIS;
use serde::Serialize;

use super::*;
use crate::{Address, Error};

/// A 2-byte field inside encoded content that holds a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reference {
    /// Offset of the field from the start of the content
    pub offset: usize,
    /// The address currently stored there
    pub target: Address,
}

/// The result of encoding one event's text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodedEvent {
    pub bytes: Vec<u8>,
    /// Address fields to rewrite once targets are placed
    pub references: Vec<Reference>,
    /// Label address to offset inside `bytes`
    pub locators: BTreeMap<Address, usize>,
    /// The content ends in a terminating instruction of its own
    pub terminated: bool,
    /// Input was cut short to fit the length limit
    pub truncated: bool,
}

impl EncodedEvent {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One unit of encoder input.
#[derive(Debug, Default)]
struct Token {
    bytes: Vec<u8>,
    /// (offset into `bytes`, target)
    references: Vec<(usize, Address)>,
    locator: Option<Address>,
    /// Always ends the content
    terminates: bool,
    /// Ends the content when nothing follows it
    terminates_if_last: bool,
}

impl Token {
    fn bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, ..Default::default() }
    }

    /// An opcode followed by one address word.
    fn addressed(code: u8, target: Address) -> Self {
        let [lo, hi] = target.to_le_bytes();
        Self {
            bytes: vec![code, lo, hi],
            references: vec![(1, target)],
            ..Default::default()
        }
    }
}

fn parse_word(tag: &str, arg: &str) -> Result<u16, Error> {
    if arg.is_empty() || arg.len() > 4 || !arg.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::MalformedTag(format!("<{}>", tag)));
    }
    u16::from_str_radix(arg, 16).map_err(|_| Error::MalformedTag(format!("<{}>", tag)))
}

fn parse_tag(tag: &str) -> Result<Token, Error> {
    let word = |arg: &str| parse_word(tag, arg);

    let token = if tag == "END" {
        Token { bytes: vec![END], terminates: true, ..Default::default() }
    } else if tag == "N" {
        Token::bytes(vec![NEWLINE])
    } else if tag == "WAIT" {
        Token::bytes(vec![WAIT])
    } else if tag == "PAGE" {
        Token::bytes(vec![PAGE])
    } else if tag == "RET_IL" {
        Token { bytes: vec![RETURN_INLINE], terminates: true, ..Default::default() }
    } else if tag == "RETN" {
        Token { bytes: vec![RETURN], terminates: true, ..Default::default() }
    } else if let Some(arg) = tag.strip_prefix("CH") {
        let index: u8 = arg.parse().map_err(|_| Error::MalformedTag(format!("<{}>", tag)))?;
        Token::bytes(vec![CHARACTER, index])
    } else if let Some(arg) = tag.strip_prefix("JUMP") {
        Token { terminates_if_last: true, ..Token::addressed(JUMP, word(arg)?) }
    } else if let Some(arg) = tag.strip_prefix("CALL") {
        Token::addressed(CALL, word(arg)?)
    } else if let Some(arg) = tag.strip_prefix("IF_NOT") {
        Token::bytes([&[IF_NOT][..], &word(arg)?.to_le_bytes()].concat())
    } else if let Some(arg) = tag.strip_prefix("IF") {
        Token::bytes([&[IF][..], &word(arg)?.to_le_bytes()].concat())
    } else if let Some(arg) = tag.strip_prefix("CLEAR") {
        Token::bytes([&[CLEAR][..], &word(arg)?.to_le_bytes()].concat())
    } else if let Some(arg) = tag.strip_prefix("SET") {
        Token::bytes([&[SET][..], &word(arg)?.to_le_bytes()].concat())
    } else if let Some(arg) = tag.strip_prefix("ASM_NORET") {
        Token {
            bytes: [&[ASM][..], &word(arg)?.to_le_bytes()].concat(),
            terminates: true,
            ..Default::default()
        }
    } else if let Some(arg) = tag.strip_prefix("ASM") {
        Token::bytes([&[ASM][..], &word(arg)?.to_le_bytes()].concat())
    } else if let Some(arg) = tag.strip_prefix("LEADER") {
        let targets = arg.split(',').map(word).collect::<Result<Vec<_>, _>>()?;
        if targets.len() != LEADER_SLOTS {
            return Err(Error::MalformedTag(format!("<{}>", tag)));
        }
        let mut token = Token::bytes(vec![LEADER]);
        for target in targets {
            token.references.push((token.bytes.len(), target));
            token.bytes.extend_from_slice(&target.to_le_bytes());
        }
        token
    } else if let Some(arg) = tag.strip_prefix("LOC") {
        Token { locator: Some(word(arg)?), ..Default::default() }
    } else if let Some(hex) = tag.strip_prefix('X') {
        if hex.is_empty() || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::MalformedTag(format!("<{}>", tag)));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| Error::MalformedTag(format!("<{}>", tag)))?;
        // Raw END and RETN bytes still get the implicit end byte
        let terminates = bytes[0] != END && bytes[0] != RETURN && opcode_info(bytes[0]).map_or(false, |info| info.terminator);
        Token { bytes, terminates, ..Default::default() }
    } else {
        return Err(Error::UnknownTag(format!("<{}>", tag)));
    };
    Ok(token)
}

/// Split the next token off `rest`.
fn next_token(rest: &str) -> Result<(Token, &str), Error> {
    if let Some(body) = rest.strip_prefix('<') {
        let close = body.find('>').ok_or_else(|| {
            Error::MalformedTag(body.chars().take(16).collect::<String>())
        })?;
        let tag = &body[..close];
        let mut after = &body[close + 1..];
        let token = parse_tag(tag)?;
        // Line-ending tags own the newline the formatter puts after them
        if matches!(tag, "END" | "N" | "WAIT" | "PAGE") {
            after = after.strip_prefix('\n').unwrap_or(after);
        }
        return Ok((token, after));
    }
    if let Some(after) = rest.strip_prefix("\n\n") {
        return Ok((Token::bytes(vec![PAGE]), after));
    }
    if let Some(after) = rest.strip_prefix('\n') {
        return Ok((Token::bytes(vec![NEWLINE]), after));
    }

    let mut chars = rest.chars();
    let c = chars.next().ok_or_else(|| Error::UnknownTag(String::new()))?;
    let mut buf = [0u8; 4];
    let (bytes, _, had_errors) = SHIFT_JIS.encode(c.encode_utf8(&mut buf));
    if had_errors || bytes.first().map_or(true, |&b| b < TEXT_THRESHOLD) {
        return Err(Error::Unencodable(c));
    }
    Ok((Token::bytes(bytes.into_owned()), chars.as_str()))
}

/// Encode tagged text into event bytecode.
///
/// With `max_length`, content that does not end in a terminator of its own is
/// truncated to leave room for the implicit end byte; terminated content
/// that does not fit is an [`Error::OversizeTranslation`].
pub fn encode_event(text: &str, max_length: Option<usize>) -> Result<EncodedEvent, Error> {
    let text = text.replace('\r', "");
    let mut rest = text.as_str();
    let mut out = EncodedEvent::default();
    let mut terminated = false;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("\n<CONT>") {
            rest = after;
            continue;
        }

        let (token, after) = next_token(rest)?;
        rest = after;
        let ends = token.terminates || (token.terminates_if_last && rest.is_empty());
        let needed = out.bytes.len() + token.bytes.len();

        if let Some(max) = max_length {
            if ends && needed > max {
                return Err(Error::OversizeTranslation {
                    addr: None,
                    original: max,
                    translated: needed,
                });
            }
            if !ends && needed > max.saturating_sub(1) {
                log::warn!("Text is too long, truncating at {} bytes", out.bytes.len());
                out.truncated = true;
                terminated = false;
                break;
            }
        }

        if let Some(label) = token.locator {
            out.locators.insert(label, out.bytes.len());
        }
        for (offset, target) in token.references {
            out.references.push(Reference { offset: out.bytes.len() + offset, target });
        }
        out.bytes.extend_from_slice(&token.bytes);
        terminated = ends;
    }

    if !terminated {
        out.bytes.push(END);
    }
    out.terminated = terminated;
    Ok(out)
}
