//! Relocation of re-encoded events into free space.
//!
//! A run moves through fixed phases and aborts on the first error, so a
//! failed run never yields a partial set of writes:
//!
//! 1. refuse references into event text outside the script,
//! 2. collect the extents of relocatable events (plus any declared unused
//!    tail) as free space and check fixed events still fit,
//! 3. allocate new homes, largest content first,
//! 4. rewrite the address fields inside every encoded buffer,
//! 5. rewrite the fields outside events that point at moved text.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::event::{encode_event, EncodedEvent};
use crate::explore::ExternalReference;
use crate::patch::PatchWriter;
use crate::script::ScriptEvent;
use crate::space::{FreeSpan, SpacePool};
use crate::strategy::PackingStrategy;
use crate::translation::TranslationTable;
use crate::{Address, Error};

/// An alternate maximum length for a fixed event, e.g. an enemy name slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLimit {
    pub addr: Address,
    pub max_length: usize,
}

fn slot_limit(limits: &[SlotLimit], addr: Address) -> Option<usize> {
    limits.iter().find(|l| l.addr == addr).map(|l| l.max_length)
}

/// Tunables for one relocation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocateOptions {
    pub strategy: PackingStrategy,
    /// Unused bytes after the script's data
    pub trailing_free: Option<FreeSpan>,
    pub slot_limits: Vec<SlotLimit>,
}

/// Encode every event, preferring its translation.
///
/// Relocatable events may grow freely; fixed events are held to their slot
/// limit or their original length.
///
/// A row keyed to an address where no event starts is text split out of
/// another event. It is encoded as a new event that must be placed in free
/// space, and some encoded event has to jump to or call it.
pub fn encode_translations(
    events: &[ScriptEvent],
    translations: &TranslationTable,
    slot_limits: &[SlotLimit],
) -> Result<BTreeMap<Address, EncodedEvent>, Error> {
    let mut encoded = BTreeMap::new();
    for event in events {
        let key = format!("{:04x}", event.addr);
        let text = translations.get(&key).map_or(event.text.as_str(), |entry| entry.text());
        let max_length = if event.relocatable {
            None
        } else {
            Some(slot_limit(slot_limits, event.addr).unwrap_or(event.length))
        };

        let content = encode_event(text, max_length).map_err(|e| e.at(event.addr))?;
        if content.truncated {
            log::warn!("Event at 0x{:04x} was truncated to {} bytes", event.addr, content.len());
        }
        encoded.insert(event.addr, content);
    }

    let mut split = Vec::new();
    for (key, entry) in translations {
        let Ok(addr) = Address::from_str_radix(key, 16) else {
            return Err(Error::UnmatchedTranslation(key.clone()));
        };
        if encoded.contains_key(&addr) {
            continue;
        }
        let content = encode_event(entry.text(), None).map_err(|e| e.at(addr))?;
        split.push((key, addr, content));
    }

    let targets: BTreeSet<Address> = encoded
        .values()
        .chain(split.iter().map(|(_, _, content)| content))
        .flat_map(|content| content.references.iter().map(|r| r.target))
        .collect();
    for (key, addr, content) in split {
        if !targets.contains(&addr) {
            return Err(Error::UnmatchedTranslation(key.clone()));
        }
        log::info!("New event 0x{:04x} split out ({} bytes)", addr, content.len());
        encoded.insert(addr, content);
    }
    Ok(encoded)
}

/// One event's final bytes and where they go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocatedBlock {
    pub original: Address,
    pub address: Address,
    pub bytes: Vec<u8>,
}

/// The outcome of a relocation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Relocation {
    /// Moved event starts and every locator, old address to new
    pub addresses: BTreeMap<Address, Address>,
    /// Address fields outside events to overwrite with a new 2-byte target
    pub fixups: BTreeMap<Address, Address>,
    /// Every event, split-out ones included, in original address order
    pub blocks: Vec<RelocatedBlock>,
}

impl Relocation {
    /// Final address of whatever used to live at `addr`
    pub fn address_of(&self, addr: Address) -> Address {
        self.addresses.get(&addr).copied().unwrap_or(addr)
    }

    /// Emit the event bytes, then the fixups.
    pub fn write_to(&self, writer: &mut dyn PatchWriter) -> Result<(), Error> {
        for block in &self.blocks {
            writer.write(block.address, &block.bytes)?;
        }
        for (&field, &target) in &self.fixups {
            writer.write(field, &target.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Relocates encoded events according to a set of options.
#[derive(Debug, Clone, Default)]
pub struct Relocator {
    options: RelocateOptions,
}

impl Relocator {
    pub fn new(options: RelocateOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RelocateOptions {
        &self.options
    }

    /// Place `encoded` content for `events` and compute every write needed.
    pub fn relocate(
        &self,
        events: &[ScriptEvent],
        mut encoded: BTreeMap<Address, EncodedEvent>,
        externals: &[ExternalReference],
    ) -> Result<Relocation, Error> {
        check_externals(externals)?;

        log::debug!("Collecting free space for {} events", events.len());
        let mut pool = self.collect_space(events, &encoded)?;
        log::debug!(
            "{} bytes free in {} spans, largest {}",
            pool.total_available(),
            pool.spans().len(),
            pool.largest_available()
        );

        let addresses = self.allocate(events, &encoded, &mut pool)?;
        let resolver = Resolver { events, addresses: &addresses };

        log::debug!("Rewriting references inside events");
        for content in encoded.values_mut() {
            for reference in &content.references {
                let target = resolver.resolve(reference.target)?;
                content.bytes[reference.offset..reference.offset + 2].copy_from_slice(&target.to_le_bytes());
            }
        }

        log::debug!("Rewriting references outside events");
        let mut fixups = BTreeMap::new();
        for reference in events.iter().flat_map(|e| &e.references) {
            let Some(field) = reference.source_addr else { continue };
            if reference.source_event.is_some() {
                continue;
            }
            let target = resolver.resolve(reference.target_addr)?;
            if target != reference.target_addr {
                fixups.insert(field, target);
            }
        }

        let blocks = encoded
            .into_iter()
            .map(|(original, content)| RelocatedBlock {
                original,
                address: addresses.get(&original).copied().unwrap_or(original),
                bytes: content.bytes,
            })
            .collect();

        Ok(Relocation { addresses, fixups, blocks })
    }

    fn collect_space(&self, events: &[ScriptEvent], encoded: &BTreeMap<Address, EncodedEvent>) -> Result<SpacePool, Error> {
        let mut pool = SpacePool::new();
        for event in events {
            let content = encoded.get(&event.addr).ok_or(Error::MissingContent(event.addr))?;
            if event.relocatable {
                pool.add_space(event.addr, (event.end() - 1) as Address)?;
                continue;
            }

            let limit = slot_limit(&self.options.slot_limits, event.addr).unwrap_or(event.length);
            if content.len() > limit {
                return Err(Error::OversizeTranslation {
                    addr: Some(event.addr),
                    original: limit,
                    translated: content.len(),
                });
            }
        }

        if let Some(span) = self.options.trailing_free {
            let fixed = events.iter().filter(|e| !e.relocatable).find(|e| {
                let extent = FreeSpan { start: e.addr, end: (e.end() - 1) as Address };
                extent.overlaps(&span)
            });
            if let Some(event) = fixed {
                return Err(Error::InvalidRequest(format!(
                    "free span {} overlaps the fixed event at 0x{:04x}",
                    span, event.addr
                )));
            }
            pool.add_span(span);
        }
        Ok(pool)
    }

    fn allocate(
        &self,
        events: &[ScriptEvent],
        encoded: &BTreeMap<Address, EncodedEvent>,
        pool: &mut SpacePool,
    ) -> Result<BTreeMap<Address, Address>, Error> {
        let mut addresses = BTreeMap::new();

        // Locators in fixed events move with the re-encoded text
        for event in events.iter().filter(|e| !e.relocatable) {
            if let Some(content) = encoded.get(&event.addr) {
                for (&label, &offset) in &content.locators {
                    addresses.insert(label, event.addr + offset as Address);
                }
            }
        }

        // Relocatable events plus content split out of them, which has no home yet
        let mut movable: Vec<(Address, usize, &EncodedEvent)> = events
            .iter()
            .filter(|e| e.relocatable)
            .filter_map(|e| encoded.get(&e.addr).map(|c| (e.addr, e.length, c)))
            .collect();
        movable.extend(
            encoded
                .iter()
                .filter(|(addr, _)| !events.iter().any(|e| e.addr == **addr))
                .map(|(&addr, content)| (addr, 0, content)),
        );
        movable.sort_by(|(a, _, ac), (b, _, bc)| bc.len().cmp(&ac.len()).then(a.cmp(b)));

        log::debug!("Allocating {} events with {}", movable.len(), self.options.strategy);
        for (original, length, content) in movable {
            let address = pool.take_space(content.len(), self.options.strategy)?;
            log::info!(
                "Event 0x{:04x} ({} -> {} bytes) relocated to 0x{:04x}",
                original,
                length,
                content.len(),
                address
            );
            addresses.insert(original, address);
            for (&label, &offset) in &content.locators {
                addresses.insert(label, address + offset as Address);
            }
        }
        Ok(addresses)
    }
}

/// A reference into event text outside this script cannot be followed.
fn check_externals(externals: &[ExternalReference]) -> Result<(), Error> {
    match externals.iter().find(|r| r.kind == BlockKind::Event) {
        Some(reference) => Err(Error::UnlinkedExternalReference {
            source_addr: reference.source_addr,
            target: reference.target_addr,
        }),
        None => Ok(()),
    }
}

struct Resolver<'e> {
    events: &'e [ScriptEvent],
    addresses: &'e BTreeMap<Address, Address>,
}

impl Resolver<'_> {
    /// Final address for a reference to `target`.
    fn resolve(&self, target: Address) -> Result<Address, Error> {
        if let Some(&address) = self.addresses.get(&target) {
            return Ok(address);
        }
        let inside = self
            .events
            .iter()
            .any(|e| target > e.addr && u32::from(target) < e.end());
        if inside {
            return Err(Error::MissingLocator { target });
        }
        Ok(target)
    }
}
