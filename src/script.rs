//! Script profiles: how each kind of script is entered, which recognizers
//! its code needs, and how its discovered events are collected.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockKind};
use crate::event::format_event;
use crate::explore::{BlockGraph, EntryPoint};
use crate::patch::WriteRecord;
use crate::relocate::SlotLimit;
use crate::recognizer::{
    CountedTable, EventCall, EventStore, FixedEdge, FixedEdges, FixedValue, NoReturnCall, PointerTable, Recognizer,
    RecordTable, Resume, Skip, TableBase, TerminatedTable, Trigger,
};
use crate::space::FreeSpan;
use crate::{Address, Error, Reg, Region};

/// The disk location of a script, as cylinder, head and sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScriptKey(pub u8, pub u8, pub u8);

impl ScriptKey {
    pub const fn new(cylinder: u8, head: u8, sector: u8) -> Self {
        Self(cylinder, head, sector)
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:02x}.{:02x}", self.0, self.1, self.2)
    }
}

impl FromStr for ScriptKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let [c, h, r] = parts.as_slice() else {
            return Err(format!("Invalid script key '{}', expected cc.hh.ss", s));
        };
        let byte = |part: &str| {
            if part.len() != 2 {
                return Err(format!("Invalid script key '{}', expected cc.hh.ss", s));
            }
            u8::from_str_radix(part, 16).map_err(|_| format!("Invalid script key '{}', expected cc.hh.ss", s))
        };
        Ok(ScriptKey(byte(*c)?, byte(*h)?, byte(*r)?))
    }
}

/// The two kinds of script on the scenario disk.
#[derive(Copy, Clone, ValueEnum, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Map and town scripts
    #[default]
    Scenario,
    /// Battle scripts
    Combat,
}

impl ScriptKind {
    /// Address the script is loaded at
    pub fn base(&self) -> Address {
        match self {
            ScriptKind::Scenario => 0xe000,
            ScriptKind::Combat => 0xdc00,
        }
    }

    /// Directory translation files for this kind live in
    pub fn directory(&self) -> &'static str {
        match self {
            ScriptKind::Scenario => "Scenarios",
            ScriptKind::Combat => "Combats",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptKind::Scenario => write!(f, "scenario"),
            ScriptKind::Combat => write!(f, "combat"),
        }
    }
}

// Scenario header
const THIRD_ENTRY: u16 = 0x08;
/// First opcode bytes seen at e008 when it holds code
const CODE_LEADS: &[u8] = &[0x80, 0x94, 0xa0, 0xb8, 0xbe, 0xc3, 0xc6, 0xe8, 0xe9, 0xf6];
/// Scenarios whose e008 looks like both, but is a table
const TABLE_KEYS: &[ScriptKey] = &[
    ScriptKey(0x15, 0x00, 0x27),
    ScriptKey(0x19, 0x01, 0x23),
    ScriptKey(0x25, 0x00, 0x23),
    ScriptKey(0x28, 0x01, 0x27),
    ScriptKey(0x2a, 0x01, 0x23),
];
/// Scenarios with only the e000 entry
const SINGLE_ENTRY_KEYS: &[ScriptKey] = &[ScriptKey(0x20, 0x00, 0x20), ScriptKey(0x26, 0x01, 0x22)];
/// Shared routines outside the script that may appear in the entry table
const SHARED_ENTRIES: &[Address] = &[0x96c9, 0x96d4, 0x96ea];

// Combat header
const COMBAT_ENTRIES: &[Address] = &[0xdd0c, 0xdd0f, 0xdd12, 0xdd15];
const ENEMY_STRIDE: u16 = 0x40;
const ENEMY_NAME: u16 = 0x30;
/// Bytes between an enemy name and the next enemy record
const ENEMY_NAME_LENGTH: usize = 0x10;
const ENEMY_CODE_TABLE: u16 = 0x120;
const START_TEXT_POINTER: u16 = 0x104;
/// Memory slot the combat start text pointer is read from at runtime
pub const START_TEXT_SLOT: Address = 0xdd04;

fn enemy_count(key: ScriptKey) -> u16 {
    match key {
        ScriptKey(0x3e, 0x01, 0x24) | ScriptKey(0x3e, 0x01, 0x25) => 1,
        ScriptKey(0x3a, 0x01, 0x22) => 3,
        _ => 4,
    }
}

/// The roots exploration starts from.
pub fn entry_points(kind: ScriptKind, key: ScriptKey, region: Region<'_>) -> Result<Vec<EntryPoint>, Error> {
    match kind {
        ScriptKind::Scenario => scenario_entry_points(key, region),
        ScriptKind::Combat => combat_entry_points(key, region),
    }
}

fn scenario_entry_points(key: ScriptKey, region: Region<'_>) -> Result<Vec<EntryPoint>, Error> {
    let base = region.base();
    let mut entries = vec![EntryPoint::code(base)];
    if SINGLE_ENTRY_KEYS.contains(&key) {
        return Ok(entries);
    }
    entries.push(EntryPoint::code(base + 3));

    // e008 holds either code or a table of code pointers
    let third = base + THIRD_ENTRY;
    let lead = region.read_u8(third)?;
    let high = region.read_u8(third + 1)?;
    let looks_like_code = CODE_LEADS.contains(&lead);
    let page_limit = 0xe0u16 + (region.len() >> 8) as u16;
    let looks_like_table = (0xe0..=page_limit).contains(&u16::from(high)) || high == 0x96;

    let is_table = match (looks_like_code, looks_like_table) {
        (false, false) => {
            return Err(Error::AmbiguousEntryPattern(format!(
                "{}: e008 is neither code nor an entry table",
                key
            )))
        }
        (true, true) if TABLE_KEYS.contains(&key) => true,
        (true, true) => return Err(Error::AmbiguousEntryPattern(format!("{}: e008 is ambiguous", key))),
        (code, _) => !code,
    };

    if !is_table {
        entries.push(EntryPoint::code(third));
        return Ok(entries);
    }

    let mut field = third;
    loop {
        let target = match region.read_u16(field) {
            Ok(target) => target,
            Err(_) => break,
        };
        if region.contains(target) {
            entries.push(EntryPoint::code(target).with_source(field));
        } else if !SHARED_ENTRIES.contains(&target) {
            if field == third {
                return Err(Error::AmbiguousEntryPattern(format!("{}: no entries in the e008 table", key)));
            }
            break;
        }
        field += 2;
    }
    log::debug!("{} has {} entry points", key, entries.len());
    Ok(entries)
}

fn combat_entry_points(key: ScriptKey, region: Region<'_>) -> Result<Vec<EntryPoint>, Error> {
    let base = region.base();
    let mut entries: Vec<EntryPoint> = COMBAT_ENTRIES.iter().map(|&a| EntryPoint::code(a)).collect();

    for enemy in 0..enemy_count(key) {
        let name = base + enemy * ENEMY_STRIDE + ENEMY_NAME;
        if region.read_u8(name)? == 0 {
            break;
        }
        entries.push(EntryPoint::event(name));

        for slot in 0..4 {
            let field = base + ENEMY_CODE_TABLE + enemy * 8 + slot * 2;
            entries.push(EntryPoint::code(region.read_u16(field)?).with_source(field));
        }
    }

    let start_text = region.read_u16(base + START_TEXT_POINTER)?;
    if region.contains(start_text) {
        entries.push(EntryPoint::event(start_text).with_source(START_TEXT_SLOT));
    } else {
        log::debug!("{} has no start text in the script (0x{:04x})", key, start_text);
    }
    Ok(entries)
}

/// Length limits for fixed events that own more room than their text.
///
/// Combat enemy names may fill their whole name field.
pub fn slot_limits(kind: ScriptKind, entries: &[EntryPoint]) -> Vec<SlotLimit> {
    match kind {
        ScriptKind::Scenario => Vec::new(),
        ScriptKind::Combat => entries
            .iter()
            .filter(|e| e.kind == BlockKind::Event && e.source.is_none())
            .filter(|e| (e.target % ENEMY_STRIDE) == ENEMY_NAME)
            .map(|e| SlotLimit { addr: e.target, max_length: ENEMY_NAME_LENGTH })
            .collect(),
    }
}

/// Text lines loaded with a hard-coded `mov si` in scenario 18.01.22
const LIST_TEXT_LOADS: &[Address] = &[
    0xe553, 0xe595, 0xe5bc, 0xe5d2, 0xe6aa, 0xe724, 0xe7aa, 0xe7f7, 0xe84a, 0xe856, 0xe886, 0xe8da, 0xe912, 0xe919,
];

/// Recognizers for one script, most specific first.
pub fn recognizers(kind: ScriptKind, key: ScriptKey) -> Vec<Box<dyn Recognizer>> {
    let mut list: Vec<Box<dyn Recognizer>> = match kind {
        ScriptKind::Scenario => scenario_recognizers(key),
        ScriptKind::Combat => combat_recognizers(key),
    };

    list.push(Box::new(EventCall::default()));
    match kind {
        ScriptKind::Scenario => {
            list.push(Box::new(TerminatedTable::npc_list(&[0x6d32, 0x6d38])));
            list.push(Box::new(CountedTable::npc_moves(0x6e5c)));
            list.push(Box::new(PointerTable::called(BlockKind::Event, 0xa95a, Reg::Bx, 3, 2)));
            list.push(Box::new(PointerTable::called(BlockKind::Event, 0xa9df, Reg::Bx, 4, 2)));
        }
        ScriptKind::Combat => {
            list.push(Box::new(EventStore { slot: START_TEXT_SLOT }));
            // Display routines that leave the registers alone
            list.push(Box::new(Skip::calls(&[0x681b, 0x684f, 0x7ff0, 0x8350, 0x99fe])));
        }
    }
    list
}

fn event_table(at: Address, table: Address, count: usize, stride: u16, offset: u16, resume: Resume) -> Box<dyn Recognizer> {
    Box::new(PointerTable::at(BlockKind::Event, at, TableBase::Fixed(table), count, stride, offset, resume))
}

fn code_table(at: Address, table: Address, count: usize, stride: u16, offset: u16, resume: Resume) -> Box<dyn Recognizer> {
    Box::new(PointerTable::at(BlockKind::Code, at, TableBase::Fixed(table), count, stride, offset, resume))
}

fn scenario_recognizers(key: ScriptKey) -> Vec<Box<dyn Recognizer>> {
    match key {
        ScriptKey(0x10, 0x00, 0x20) => vec![Box::new(RecordTable::destinations(0xe27e, 0xe29c))],
        ScriptKey(0x10, 0x01, 0x20) => vec![code_table(0xe019, 0xe027, 63, 4, 2, Resume::Stop)],
        ScriptKey(0x11, 0x00, 0x24) => vec![Box::new(PointerTable::at(
            BlockKind::Event,
            0xe14f,
            TableBase::Register(Reg::Si),
            1,
            0,
            8,
            Resume::At(0xe168),
        ))],
        ScriptKey(0x11, 0x00, 0x25) => vec![event_table(0xe03b, 0xe0b1, 9, 10, 8, Resume::Stop)],
        ScriptKey(0x13, 0x01, 0x20) => vec![code_table(0xe0ca, 0xe117, 7, 2, 0, Resume::Next)],
        ScriptKey(0x18, 0x01, 0x22) => {
            let mut list: Vec<Box<dyn Recognizer>> = vec![Box::new(Skip { trigger: Trigger::At(0xe2f6), resume: Resume::Next })];
            list.extend(LIST_TEXT_LOADS.iter().map(|&at| Box::new(FixedValue { at }) as Box<dyn Recognizer>));
            list
        }
        ScriptKey(0x1b, 0x01, 0x25) => vec![Box::new(NoReturnCall { target: 0xe372 })],
        ScriptKey(0x1c, 0x00, 0x21) => vec![Box::new(NoReturnCall { target: 0xe363 })],
        ScriptKey(0x1c, 0x00, 0x25) => vec![Box::new(NoReturnCall { target: 0xe3eb })],
        ScriptKey(0x1c, 0x01, 0x21) => vec![Box::new(NoReturnCall { target: 0xe30e })],
        ScriptKey(0x1d, 0x00, 0x22) => vec![code_table(0xe07c, 0xe0a4, 6, 2, 0, Resume::Stop)],
        ScriptKey(0x1e, 0x01, 0x26) => vec![event_table(0xe093, 0xe0bb, 10, 2, 0, Resume::At(0xe09a))],
        ScriptKey(0x20, 0x00, 0x20) => vec![
            // Steps over increments that would skip the first character
            Box::new(Skip::range(0xe164, 0xe166)),
            Box::new(FixedEdges {
                at: 0xe200,
                edges: vec![
                    FixedEdge { source: None, target: 0xe373, kind: BlockKind::Event },
                    FixedEdge { source: None, target: 0xe383, kind: BlockKind::Event },
                ],
            }),
            Box::new(FixedEdges {
                at: 0xe154,
                edges: vec![FixedEdge { source: Some(0xe155), target: 0xe63b, kind: BlockKind::Event }],
            }),
        ],
        ScriptKey(0x24, 0x00, 0x26) => vec![event_table(0xe046, 0xe75d, 16, 2, 0, Resume::Stop)],
        ScriptKey(0x30, 0x00, 0x25) => vec![event_table(0xe084, 0xe08d, 4, 2, 0, Resume::Stop)],
        ScriptKey(0x30, 0x00, 0x26) => vec![event_table(0xe1ee, 0xe1f7, 4, 2, 0, Resume::Stop)],
        _ => Vec::new(),
    }
}

fn combat_recognizers(key: ScriptKey) -> Vec<Box<dyn Recognizer>> {
    match key {
        // Push/pop pairs around calls that do nothing for the walk
        ScriptKey(0x3c, 0x01, 0x23) => vec![Box::new(Skip::range(0xddd2, 0xddd7))],
        ScriptKey(0x3c, 0x01, 0x24) => vec![Box::new(Skip::range(0xdd5e, 0xdd63))],
        ScriptKey(0x3e, 0x01, 0x22) => vec![Box::new(Skip::range(0xdd56, 0xdd65))],
        _ => Vec::new(),
    }
}

/// One reference to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventReference {
    /// The 2-byte field holding the target; `None` if it cannot be rewritten
    pub source_addr: Option<Address>,
    pub target_addr: Address,
    /// Start of the event the field lives in, if any
    pub source_event: Option<Address>,
}

/// A discovered event with everything relocation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptEvent {
    pub addr: Address,
    pub length: usize,
    pub relocatable: bool,
    pub text: String,
    pub references: Vec<EventReference>,
}

impl ScriptEvent {
    /// One past the last byte
    pub fn end(&self) -> u32 {
        u32::from(self.addr) + self.length as u32
    }
}

/// Gather every event block of `graph` in address order.
pub fn collect_events(graph: &BlockGraph<'_>) -> Result<Vec<ScriptEvent>, Error> {
    let region = graph.region();
    graph
        .blocks()
        .filter(|b| b.kind() == BlockKind::Event)
        .map(|block| collect_event(graph, region, block))
        .collect()
}

fn collect_event(graph: &BlockGraph<'_>, region: Region<'_>, block: &Block) -> Result<ScriptEvent, Error> {
    let locators: BTreeSet<Address> = graph.entry_labels(block);
    let text = format_event(&region, block.start(), block.continuation_extent(), &locators)?;

    let mut references: Vec<EventReference> = graph
        .incoming(block)
        .map(|link| EventReference {
            source_addr: link.source_addr,
            target_addr: link.target_addr,
            source_event: link
                .source_block
                .map(|id| graph.block(id))
                .filter(|source| source.kind() == BlockKind::Event)
                .map(|source| source.start()),
        })
        .collect();
    references.extend(block.internal_references().iter().map(|r| EventReference {
        source_addr: Some(r.source_addr),
        target_addr: r.target_addr,
        source_event: Some(block.start()),
    }));

    Ok(ScriptEvent {
        addr: block.start(),
        length: block.length() as usize,
        relocatable: graph.is_relocatable(block),
        text,
        references,
    })
}

/// Where a script's bytes live in the disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLocation {
    /// Physical offset of each sector, in load order
    pub sector_addresses: Vec<u64>,
    pub sector_length: usize,
    /// Zero bytes at the end of the last sector holding data
    pub trailing_unused: usize,
}

impl ScriptLocation {
    /// Bytes loaded into memory
    pub fn data_length(&self) -> usize {
        self.sector_addresses.len() * self.sector_length
    }

    /// Read the script out of a disk image.
    pub fn read_from(&self, image: &[u8]) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(self.data_length());
        for &sector in &self.sector_addresses {
            let start = sector as usize;
            let bytes = image.get(start..start + self.sector_length).ok_or_else(|| {
                Error::InvalidRequest(format!("sector at 0x{:x} is past the end of the image", sector))
            })?;
            data.extend_from_slice(bytes);
        }
        Ok(data)
    }

    /// The unused tail of the script as a free span, keeping one zero byte
    /// after the last data byte.
    pub fn trailing_free_span(&self, base: Address) -> Option<FreeSpan> {
        let end = u32::from(base) + self.data_length() as u32;
        let start = end.checked_sub(self.trailing_unused as u32)? + 1;
        if self.trailing_unused == 0 || start > end - 1 || end - 1 > 0xffff {
            return None;
        }
        Some(FreeSpan { start: start as Address, end: (end - 1) as Address })
    }

    /// Disk offset of the byte loaded at `addr`.
    pub fn physical_offset(&self, base: Address, addr: Address) -> Option<u64> {
        if self.sector_length == 0 {
            return None;
        }
        let offset = usize::from(addr.checked_sub(base)?);
        let sector = self.sector_addresses.get(offset / self.sector_length)?;
        Some(sector + (offset % self.sector_length) as u64)
    }

    /// Translate in-memory writes to disk writes, splitting at sector
    /// boundaries.
    pub fn to_physical(&self, base: Address, records: &[WriteRecord]) -> Result<Vec<(u64, Vec<u8>)>, Error> {
        let mut out: Vec<(u64, Vec<u8>)> = Vec::new();
        for record in records {
            for (i, &byte) in record.bytes.iter().enumerate() {
                let addr = u32::from(record.address) + i as u32;
                let offset = Address::try_from(addr)
                    .ok()
                    .and_then(|a| self.physical_offset(base, a))
                    .ok_or(Error::OutOfRegion(record.address))?;
                match out.last_mut() {
                    Some((start, bytes)) if *start + bytes.len() as u64 == offset => bytes.push(byte),
                    _ => out.push((offset, vec![byte])),
                }
            }
        }
        Ok(out)
    }
}
