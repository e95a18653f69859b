//! Block registry: the arena of blocks and links, plus the per-block walks
//! that derive outgoing edges.
//!
//! Blocks never overlap. When a newly explored range swallows existing
//! blocks, the first of them moves its start back and the rest are merged
//! into it; absorbed blocks stay in the arena with `absorbed_into` set, so
//! identifiers held elsewhere can always be resolved to the live block.

use std::collections::BTreeSet;

use crate::block::{Block, BlockId, BlockKind, InternalRef, Link, LinkId};
use crate::context::{ExecutionContext, RegValue};
use crate::event::{decode_event, event_end, ASM, CALL, JUMP, LEADER, LEADER_SLOTS};
use crate::recognizer::Recognizer;
use crate::{Address, Error, FlowClass, InstructionSource, Region};

/// All blocks and links discovered in one region.
pub struct BlockRegistry<'a> {
    region: Region<'a>,
    source: &'a dyn InstructionSource,
    recognizers: &'a [Box<dyn Recognizer>],
    blocks: Vec<Block>,
    links: Vec<Link>,
}

impl<'a> BlockRegistry<'a> {
    pub fn new(
        region: Region<'a>,
        source: &'a dyn InstructionSource,
        recognizers: &'a [Box<dyn Recognizer>],
    ) -> Self {
        Self {
            region,
            source,
            recognizers,
            blocks: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn region(&self) -> Region<'a> {
        self.region
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    /// Follow absorption until a live block is reached.
    pub fn resolve(&self, mut id: BlockId) -> BlockId {
        while let Some(next) = self.blocks[id.0].absorbed_into {
            id = next;
        }
        id
    }

    /// The live block containing `addr`.
    pub fn find(&self, addr: Address) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|b| b.is_live() && b.contains(addr))
            .map(|b| b.id)
    }

    /// Live blocks with at least one path still to walk, in address order.
    pub fn unlinked(&self) -> Vec<BlockId> {
        let mut ids: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| b.is_live() && !b.is_linked())
            .collect();
        ids.sort_by_key(|b| b.start);
        ids.into_iter().map(|b| b.id).collect()
    }

    /// The block containing `addr`, creating and exploring one if needed.
    pub fn get_or_create(&mut self, addr: Address, kind: BlockKind) -> Result<BlockId, Error> {
        if let Some(id) = self.find(addr) {
            let found = self.blocks[id.0].kind;
            if found != kind {
                return Err(Error::BlockKindMismatch { addr, expected: kind, found });
            }
            return Ok(id);
        }

        let length = self.explore_extent(kind, addr, None)?;
        let end = u32::from(addr) + length;

        // Existing blocks starting inside the new range
        let mut inside: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| b.is_live() && b.start > addr && u32::from(b.start) < end)
            .collect();
        inside.sort_by_key(|b| b.start);

        if let Some(first) = inside.first() {
            let id = first.id;
            if first.kind != kind {
                return Err(Error::BlockKindMismatch { addr: first.start, expected: kind, found: first.kind });
            }
            log::debug!("Moving start of {} back to 0x{:04x}", first, addr);

            let old_end = first.end();
            let continuation = first.continuation_extent;
            let length = match continuation {
                Some(_) => self.explore_extent(kind, addr, continuation)?,
                None => length,
            };
            let block = &mut self.blocks[id.0];
            block.start = addr;
            block.length = length.max(old_end - u32::from(addr));
            block.invalidate();
            self.absorb_overlaps(id)?;
            return Ok(id);
        }

        let id = BlockId(self.blocks.len());
        let block = Block::new(id, kind, addr, length);
        log::debug!("New block {}", block);
        self.blocks.push(block);
        Ok(id)
    }

    /// Record `link` as an edge into a block of `kind`.
    ///
    /// Targets outside the region are kept as external references. Returns
    /// `None` if the same edge was already recorded.
    pub fn connect(&mut self, mut link: Link, kind: BlockKind) -> Result<Option<LinkId>, Error> {
        link.target_kind = kind;
        link.target_block = if self.region.contains(link.target_addr) {
            Some(self.get_or_create(link.target_addr, kind)?)
        } else {
            log::debug!(
                "External {} reference {:?} -> 0x{:04x}",
                kind,
                link.source_addr,
                link.target_addr
            );
            None
        };
        // Creating the target may have absorbed the source
        link.source_block = link.source_block.map(|id| self.resolve(id));

        if self.links.iter().any(|l| l.same_edge(&link)) {
            return Ok(None);
        }

        let id = LinkId(self.links.len());
        if let Some(source) = link.source_block {
            self.blocks[source.0].outgoing.push(id);
        }
        if let Some(target) = link.target_block {
            self.blocks[target.0].add_incoming(id, &link);
        }
        self.links.push(link);
        Ok(Some(id))
    }

    /// Grow the event block containing `within` so decoding continues past
    /// terminators up to `extent`.
    pub fn extend_event(&mut self, within: Address, extent: Address) -> Result<(), Error> {
        let id = self.find(within).ok_or(Error::OutOfRegion(within))?;
        let block = &self.blocks[id.0];
        if block.kind != BlockKind::Event {
            return Err(Error::BlockKindMismatch { addr: within, expected: BlockKind::Event, found: block.kind });
        }
        if block.continuation_extent.map_or(false, |current| current >= extent) {
            return Ok(());
        }

        let length = self.explore_extent(BlockKind::Event, block.start, Some(extent))?;
        let block = &mut self.blocks[id.0];
        log::debug!("Extending {} to continue up to 0x{:04x}", block, extent);
        block.continuation_extent = Some(extent);
        block.length = block.length.max(length);
        block.invalidate();
        self.absorb_overlaps(id)
    }

    /// Merge every live block that starts inside `id` into it.
    fn absorb_overlaps(&mut self, id: BlockId) -> Result<(), Error> {
        loop {
            let block = &self.blocks[id.0];
            let (start, end, kind) = (block.start, block.end(), block.kind);
            let victim = self
                .blocks
                .iter()
                .find(|b| b.is_live() && b.id != id && b.start >= start && u32::from(b.start) < end)
                .map(|b| b.id);
            let Some(victim) = victim else {
                return Ok(());
            };

            let other = &self.blocks[victim.0];
            if other.kind != kind {
                return Err(Error::BlockKindMismatch { addr: other.start, expected: kind, found: other.kind });
            }
            log::debug!("Absorbing {} into {}", other, self.blocks[id.0]);

            let other_end = other.end();
            let incoming = std::mem::take(&mut self.blocks[victim.0].incoming);
            let outgoing = std::mem::take(&mut self.blocks[victim.0].outgoing);
            let other_extent = self.blocks[victim.0].continuation_extent;
            {
                let other = &mut self.blocks[victim.0];
                other.paths.clear();
                other.internal.clear();
                other.absorbed_into = Some(id);
            }

            // An absorbed event must still be decoded whole from the new start
            let mut length = other_end - u32::from(start);
            if kind == BlockKind::Event {
                let current = self.blocks[id.0].continuation_extent;
                let extent = [current, other_extent, Some(self.blocks[victim.0].start)]
                    .into_iter()
                    .flatten()
                    .max();
                self.blocks[id.0].continuation_extent = extent;
                length = length.max(self.explore_extent(kind, start, extent)?);
            }

            for link_id in &outgoing {
                self.links[link_id.0].source_block = Some(id);
            }
            for link_id in &incoming {
                self.links[link_id.0].target_block = Some(id);
            }

            let block = &mut self.blocks[id.0];
            block.length = block.length.max(length);
            block.outgoing.extend(outgoing);
            for link_id in incoming {
                let link = self.links[link_id.0].clone();
                self.blocks[id.0].add_incoming(link_id, &link);
            }
            self.blocks[id.0].invalidate();
        }
    }

    /// Walk every unlinked path of `id` and record the edges found.
    pub fn link_block(&mut self, id: BlockId) -> Result<(), Error> {
        let id = self.resolve(id);
        let block = &self.blocks[id.0];
        let (kind, generation) = (block.kind, block.generation);

        match kind {
            BlockKind::Code => {
                let pending: Vec<(usize, Address, ExecutionContext)> = block
                    .paths
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| !p.linked)
                    .map(|(i, p)| (i, p.target.unwrap_or(block.start), p.context.clone()))
                    .collect();
                for (index, target, context) in pending {
                    self.walk_code_path(id, target, context)?;
                    self.mark_linked(id, generation, Some(index));
                }
            }
            BlockKind::Event => {
                self.link_event(id)?;
                self.mark_linked(id, generation, None);
            }
        }
        Ok(())
    }

    /// Flag a path (or all paths) as linked, unless the block changed under
    /// the walk.
    fn mark_linked(&mut self, id: BlockId, generation: u32, index: Option<usize>) {
        let block = &mut self.blocks[id.0];
        if !block.is_live() || block.generation != generation {
            return;
        }
        match index {
            Some(index) => block.paths[index].linked = true,
            None => block.paths.iter_mut().for_each(|p| p.linked = true),
        }
    }

    /// Explored length of a new block of `kind` at `start`.
    fn explore_extent(&self, kind: BlockKind, start: Address, continuation: Option<Address>) -> Result<u32, Error> {
        let end = match kind {
            BlockKind::Event => event_end(&self.region, start, continuation)?,
            BlockKind::Code => self.code_extent(start)?,
        };
        Ok((end - u32::from(start)).max(1))
    }

    /// End of the straight-line run of code starting at `start`.
    fn code_extent(&self, start: Address) -> Result<u32, Error> {
        let mut at = u32::from(start);
        for _ in 0..=self.region.len() {
            let addr = Address::try_from(at).map_err(|_| Error::InstructionDecode(start))?;
            let insn = self
                .source
                .decode(&self.region, addr)
                .ok_or(Error::InstructionDecode(addr))?;

            if let Some(recognizer) = self.recognizers.iter().find(|r| r.matches(&insn)) {
                match recognizer.resume_address(&insn) {
                    Some(next) => {
                        at = u32::from(next);
                        continue;
                    }
                    None => return Ok(insn.next_addr()),
                }
            }

            if matches!(insn.flow, FlowClass::Jump | FlowClass::Return) {
                return Ok(insn.next_addr());
            }
            at = insn.next_addr();
        }
        Err(Error::RunawayWalk(start))
    }

    /// Walk one code path from `target` with `context`.
    fn walk_code_path(&mut self, id: BlockId, target: Address, mut context: ExecutionContext) -> Result<(), Error> {
        let region = self.region;
        let source = self.source;
        let recognizers = self.recognizers;
        log::trace!("Walking code from 0x{:04x} with {} known registers", target, context.len());

        let mut at = u32::from(target);
        for _ in 0..=region.len() {
            let addr = Address::try_from(at).map_err(|_| Error::InstructionDecode(target))?;
            let insn = source.decode(&region, addr).ok_or(Error::InstructionDecode(addr))?;

            if let Some(recognizer) = recognizers.iter().find(|r| r.matches(&insn)) {
                log::trace!("{} claims 0x{:04x}: {}", recognizer.name(), insn.addr, insn);
                let mut linker = Linker { registry: self, block: id };
                recognizer.link(&insn, &mut linker, &mut context)?;
                match recognizer.resume_address(&insn) {
                    Some(next) => {
                        at = u32::from(next);
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            context.forget(&insn.regs_written);
            let field = Some(insn.addr.wrapping_add(1));

            match insn.flow {
                FlowClass::Jump | FlowClass::ConditionalJump | FlowClass::Loop => {
                    match insn.immediate_target() {
                        Some(dest) => {
                            let link = Link::new(field, dest)
                                .from_insn(insn.addr)
                                .with_context(context.clone())
                                .from_block(id);
                            self.connect(link, BlockKind::Code)?;
                        }
                        None => log::warn!("Indirect jump at 0x{:04x} is not followed: {}", insn.addr, insn),
                    }
                    if insn.flow == FlowClass::Jump {
                        return Ok(());
                    }
                }
                FlowClass::Call => {
                    match insn.immediate_target() {
                        Some(dest) => {
                            let link = Link::new(field, dest)
                                .from_insn(insn.addr)
                                .with_context(context.clone())
                                .from_block(id);
                            self.connect(link, BlockKind::Code)?;
                        }
                        None => log::warn!("Indirect call at 0x{:04x} is not followed: {}", insn.addr, insn),
                    }
                    context.clear();
                }
                FlowClass::Return => return Ok(()),
                FlowClass::None => {
                    if let Some((reg, value)) = insn.mov_immediate() {
                        context.set(reg, RegValue::assigned(value, insn.addr.wrapping_add(1)));
                    }
                }
            }
            at = insn.next_addr();
        }
        Err(Error::RunawayWalk(target))
    }

    /// Decode an event block and record its references.
    fn link_event(&mut self, id: BlockId) -> Result<(), Error> {
        let block = &self.blocks[id.0];
        let instructions = decode_event(&self.region, block.start, block.continuation_extent)?;
        let addresses: BTreeSet<Address> = instructions.iter().map(|i| i.addr).collect();

        let mut internal = Vec::new();
        let mut pending = Vec::new();
        for insn in &instructions {
            let field = insn.addr.wrapping_add(1);
            match insn.code() {
                Some(JUMP) => {
                    let Some(dest) = insn.operand() else { continue };
                    if addresses.contains(&dest) {
                        internal.push(InternalRef { source_addr: field, target_addr: dest, source_insn: insn.addr });
                    } else {
                        pending.push((Link::new(Some(field), dest).from_insn(insn.addr), BlockKind::Event));
                    }
                }
                Some(CALL) => {
                    if let Some(dest) = insn.operand() {
                        pending.push((Link::new(Some(field), dest).from_insn(insn.addr), BlockKind::Event));
                    }
                }
                Some(ASM) => {
                    if let Some(dest) = insn.operand() {
                        pending.push((Link::new(Some(field), dest).from_insn(insn.addr), BlockKind::Code));
                    }
                }
                Some(LEADER) => {
                    for slot in 0..LEADER_SLOTS {
                        if let Some(dest) = insn.operand_at(slot) {
                            let slot_field = field.wrapping_add(2 * slot as u16);
                            pending.push((Link::new(Some(slot_field), dest).from_insn(insn.addr), BlockKind::Event));
                        }
                    }
                }
                _ => {}
            }
        }

        self.blocks[id.0].internal = internal;
        for (link, kind) in pending {
            self.connect(link.from_block(id), kind)?;
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<Block>, Vec<Link>) {
        (self.blocks, self.links)
    }
}

/// What a recognizer may do to the registry while the walk is paused on its
/// instruction.
pub struct Linker<'r, 'a> {
    registry: &'r mut BlockRegistry<'a>,
    block: BlockId,
}

impl<'r, 'a> Linker<'r, 'a> {
    pub fn region(&self) -> Region<'a> {
        self.registry.region
    }

    /// The block being walked
    pub fn current_block(&self) -> BlockId {
        self.block
    }

    /// Record an edge from the current block.
    pub fn connect(&mut self, link: Link, kind: BlockKind) -> Result<(), Error> {
        let block = self.registry.resolve(self.block);
        self.registry.connect(link.from_block(block), kind)?;
        Ok(())
    }

    /// Grow the event block containing `within` up to `extent`.
    pub fn extend_event(&mut self, within: Address, extent: Address) -> Result<(), Error> {
        self.registry.extend_event(within, extent)
    }

    /// One past the end of the event at `start`, decoded on its own.
    pub fn event_end(&self, start: Address) -> Result<u32, Error> {
        event_end(&self.registry.region, start, None)
    }

    pub fn read_u8(&self, addr: Address) -> Result<u8, Error> {
        self.registry.region.read_u8(addr)
    }

    pub fn read_u16(&self, addr: Address) -> Result<u16, Error> {
        self.registry.region.read_u16(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use crate::Reg;

    fn no_recognizers() -> Vec<Box<dyn Recognizer>> {
        Vec::new()
    }

    #[test]
    fn test_get_or_create_finds_containing_block() {
        let data = [0u8; 0x10];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new().nop(0x100).nop(0x101).ret(0x102);
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        let id = registry.get_or_create(0x100, BlockKind::Code).unwrap();
        assert_eq!(registry.block(id).length(), 3);
        assert_eq!(registry.get_or_create(0x102, BlockKind::Code).unwrap(), id);

        let err = registry.get_or_create(0x101, BlockKind::Event).unwrap_err();
        assert!(matches!(err, Error::BlockKindMismatch { addr: 0x101, .. }));
    }

    #[test]
    fn test_earlier_entry_moves_block_start() {
        let data = [0u8; 0x10];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new().nop(0x100).nop(0x101).ret(0x102);
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        let late = registry.get_or_create(0x102, BlockKind::Code).unwrap();
        let early = registry.get_or_create(0x100, BlockKind::Code).unwrap();

        assert_eq!(early, late);
        assert_eq!(registry.block(early).start(), 0x100);
        assert_eq!(registry.block(early).length(), 3);
    }

    #[test]
    fn test_connect_dedupes_and_keeps_externals() {
        let data = [0u8; 0x10];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new().ret(0x100);
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        assert!(registry.connect(Link::new(None, 0x100), BlockKind::Code).unwrap().is_some());
        assert!(registry.connect(Link::new(None, 0x100), BlockKind::Code).unwrap().is_none());

        let external = registry.connect(Link::new(Some(0x105), 0x6000), BlockKind::Event).unwrap().unwrap();
        assert_eq!(registry.link(external).target_block, None);
        assert_eq!(registry.link(external).target_kind, BlockKind::Event);
    }

    #[test]
    fn test_code_walk_records_context_per_edge() {
        let data = [0u8; 0x20];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new()
            .mov_imm(0x100, Reg::Bx, 0x1234)
            .jz(0x103, 0x110)
            .ret(0x105)
            .ret(0x110);
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        registry.connect(Link::new(None, 0x100), BlockKind::Code).unwrap();
        while let Some(&id) = registry.unlinked().first() {
            registry.link_block(id).unwrap();
        }

        let target = registry.find(0x110).unwrap();
        let incoming = registry.block(target).incoming()[0];
        let link = registry.link(incoming);
        assert_eq!(link.source_addr, Some(0x104));
        assert_eq!(link.context.get(Reg::Bx).unwrap().value, 0x1234);
        assert_eq!(link.context.get(Reg::Bx).unwrap().source_addr, Some(0x101));
    }

    #[test]
    fn test_event_links_and_internal_jumps() {
        // 0x100: "A" jump 0x104 "B" ret; 0x108: call 0x10c; ret; 0x10c: "C" end
        let data = [
            0x41, 0x0f, 0x04, 0x01, 0x42, 0x07, 0x00, 0x00, 0x10, 0x0c, 0x01, 0x07, 0x43, 0x00,
        ];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new();
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        registry.connect(Link::new(None, 0x100), BlockKind::Event).unwrap();
        registry.connect(Link::new(None, 0x108), BlockKind::Event).unwrap();
        while let Some(&id) = registry.unlinked().first() {
            registry.link_block(id).unwrap();
        }

        let first = registry.block(registry.find(0x100).unwrap());
        assert_eq!(first.length(), 6);
        assert_eq!(
            first.internal_references(),
            &[InternalRef { source_addr: 0x102, target_addr: 0x104, source_insn: 0x101 }]
        );

        let called = registry.block(registry.find(0x10c).unwrap());
        let link = registry.link(called.incoming()[0]);
        assert_eq!(link.source_addr, Some(0x109));
        assert_eq!(link.source_block, registry.find(0x108));
    }

    #[test]
    fn test_extend_event_absorbs_following_block() {
        // Two chunks: "A" ret | "B" ret
        let data = [0x41, 0x07, 0x42, 0x07];
        let region = Region::new(0x100, &data);
        let source = ScriptedSource::new();
        let recognizers = no_recognizers();
        let mut registry = BlockRegistry::new(region, &source, &recognizers);

        let first = registry.get_or_create(0x100, BlockKind::Event).unwrap();
        let second = registry.get_or_create(0x102, BlockKind::Event).unwrap();
        registry.connect(Link::new(Some(0x200), 0x102), BlockKind::Event).unwrap();

        registry.extend_event(0x100, 0x102).unwrap();

        assert_eq!(registry.resolve(second), first);
        let block = registry.block(first);
        assert_eq!(block.length(), 4);
        assert_eq!(block.continuation_extent(), Some(0x102));
        assert_eq!(block.incoming().len(), 1);
        assert!(!block.is_linked());
    }
}
