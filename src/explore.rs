//! Fixed-point exploration of a region from its entry points.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::block::{Block, BlockId, BlockKind, Link, LinkId};
use crate::recognizer::Recognizer;
use crate::registry::BlockRegistry;
use crate::{Address, Error, InstructionSource, Region};

/// A root of exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    pub target: Address,
    pub kind: BlockKind,
    /// The 2-byte field holding `target`, if it may be rewritten
    pub source: Option<Address>,
}

impl EntryPoint {
    /// A fixed code entry
    pub fn code(target: Address) -> Self {
        Self { target, kind: BlockKind::Code, source: None }
    }

    /// A fixed event entry
    pub fn event(target: Address) -> Self {
        Self { target, kind: BlockKind::Event, source: None }
    }

    /// Mark the entry as stored in a patchable pointer at `source`.
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }
}

/// An edge leaving the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExternalReference {
    pub source_addr: Option<Address>,
    pub target_addr: Address,
    pub kind: BlockKind,
}

/// The result of exploration: every live block and link of a region.
#[derive(Debug)]
pub struct BlockGraph<'a> {
    region: Region<'a>,
    blocks: Vec<Block>,
    links: Vec<Link>,
    order: Vec<BlockId>,
    externals: Vec<ExternalReference>,
}

impl<'a> BlockGraph<'a> {
    fn new(region: Region<'a>, blocks: Vec<Block>, links: Vec<Link>) -> Self {
        let mut live: Vec<&Block> = blocks.iter().filter(|b| b.is_live()).collect();
        live.sort_by_key(|b| b.start());
        let order = live.into_iter().map(|b| b.id()).collect();

        let externals = links
            .iter()
            .filter(|l| l.target_block.is_none())
            .map(|l| ExternalReference {
                source_addr: l.source_addr,
                target_addr: l.target_addr,
                kind: l.target_kind,
            })
            .collect();

        Self { region, blocks, links, order, externals }
    }

    pub fn region(&self) -> Region<'a> {
        self.region
    }

    /// Live blocks in address order
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().map(|id| &self.blocks[id.0])
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// The live block containing `addr`.
    pub fn block_at(&self, addr: Address) -> Option<&Block> {
        self.blocks().find(|b| b.contains(addr))
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    /// Edges entering `block`
    pub fn incoming<'g>(&'g self, block: &'g Block) -> impl Iterator<Item = &'g Link> + 'g {
        block.incoming().iter().map(move |id| &self.links[id.0])
    }

    /// Edges leaving `block`
    pub fn outgoing<'g>(&'g self, block: &'g Block) -> impl Iterator<Item = &'g Link> + 'g {
        block.outgoing().iter().map(move |id| &self.links[id.0])
    }

    /// A block may move only if every edge into it can be rewritten.
    pub fn is_relocatable(&self, block: &Block) -> bool {
        self.incoming(block).all(|l| l.source_addr.is_some())
    }

    /// Incoming targets that do not coincide with the block start.
    pub fn entry_labels(&self, block: &Block) -> BTreeSet<Address> {
        self.incoming(block)
            .map(|l| l.target_addr)
            .filter(|&t| t != block.start())
            .collect()
    }

    /// Edges whose target lies outside the region
    pub fn external_references(&self) -> &[ExternalReference] {
        &self.externals
    }
}

/// Explore `region` from `entries` until no block has an unwalked path.
pub fn explore<'a>(
    region: Region<'a>,
    entries: &[EntryPoint],
    recognizers: &'a [Box<dyn Recognizer>],
    source: &'a dyn InstructionSource,
) -> Result<BlockGraph<'a>, Error> {
    log::debug!(
        "Exploring {} bytes at 0x{:04x} from {} entry points",
        region.len(),
        region.base(),
        entries.len()
    );

    let mut registry = BlockRegistry::new(region, source, recognizers);
    for entry in entries {
        registry.connect(Link::new(entry.source, entry.target), entry.kind)?;
    }

    let mut rounds = 0;
    loop {
        let unlinked = registry.unlinked();
        if unlinked.is_empty() {
            break;
        }
        rounds += 1;
        log::trace!("Round {}: {} blocks to link", rounds, unlinked.len());
        for id in unlinked {
            registry.link_block(id)?;
        }
    }

    let (blocks, links) = registry.into_parts();
    let graph = BlockGraph::new(region, blocks, links);
    log::debug!(
        "Exploration complete after {} rounds: {} blocks, {} external references",
        rounds,
        graph.order.len(),
        graph.externals.len()
    );
    Ok(graph)
}
