//! Blocks, edges and internal references of a discovered script.

use std::fmt;

use serde::Serialize;

use crate::context::ExecutionContext;
use crate::Address;

/// Stable arena index of a block; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

/// Stable arena index of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) usize);

/// The two kinds of block a region is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BlockKind {
    /// Native machine code
    Code,
    /// Event script bytecode
    Event,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Code => write!(f, "code"),
            BlockKind::Event => write!(f, "event"),
        }
    }
}

/// A discovered control-flow edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Address of the 2-byte field holding the target, `None` for synthetic roots
    pub source_addr: Option<Address>,
    /// Where control goes
    pub target_addr: Address,
    /// Address of the instruction the edge leaves from
    pub source_insn: Option<Address>,
    /// Registers known when the edge was taken
    pub context: ExecutionContext,
    /// Block the edge leaves from
    pub source_block: Option<BlockId>,
    /// Block the edge enters; `None` for targets outside the region
    pub target_block: Option<BlockId>,
    /// What the target is interpreted as
    pub target_kind: BlockKind,
}

impl Link {
    /// An edge whose target is stored at `source_addr`.
    pub fn new(source_addr: Option<Address>, target_addr: Address) -> Self {
        Self {
            source_addr,
            target_addr,
            source_insn: None,
            context: ExecutionContext::default(),
            source_block: None,
            target_block: None,
            target_kind: BlockKind::Code,
        }
    }

    /// Record the instruction the edge leaves from.
    pub fn from_insn(mut self, insn_addr: Address) -> Self {
        self.source_insn = Some(insn_addr);
        self
    }

    /// Capture the context at the edge.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn from_block(mut self, block: BlockId) -> Self {
        self.source_block = Some(block);
        self
    }

    /// True if the same edge was already recorded.
    pub(crate) fn same_edge(&self, other: &Link) -> bool {
        self.source_addr == other.source_addr
            && self.target_addr == other.target_addr
            && self.source_insn == other.source_insn
            && self.source_block == other.source_block
            && self.target_kind == other.target_kind
            && self.context == other.context
    }
}

/// A jump whose source and target both lie inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InternalRef {
    /// Address of the 2-byte target field
    pub source_addr: Address,
    /// Jump destination
    pub target_addr: Address,
    /// Address of the jump instruction
    pub source_insn: Address,
}

/// Incoming edges that share one outgoing-edge derivation.
#[derive(Debug, Clone)]
pub(crate) struct PathClass {
    /// Walk start; `None` for event blocks, which are always decoded whole
    pub target: Option<Address>,
    pub context: ExecutionContext,
    pub links: Vec<LinkId>,
    pub linked: bool,
}

/// A typed, explored address range.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) kind: BlockKind,
    pub(crate) start: Address,
    pub(crate) length: u32,
    pub(crate) incoming: Vec<LinkId>,
    pub(crate) outgoing: Vec<LinkId>,
    pub(crate) internal: Vec<InternalRef>,
    pub(crate) paths: Vec<PathClass>,
    pub(crate) continuation_extent: Option<Address>,
    /// Bumped whenever the extent changes; in-flight walks compare it
    pub(crate) generation: u32,
    pub(crate) absorbed_into: Option<BlockId>,
}

impl Block {
    pub(crate) fn new(id: BlockId, kind: BlockKind, start: Address, length: u32) -> Self {
        Self {
            id,
            kind,
            start,
            length,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            internal: Vec::new(),
            paths: Vec::new(),
            continuation_extent: None,
            generation: 0,
            absorbed_into: None,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// First address of the block
    pub fn start(&self) -> Address {
        self.start
    }

    /// Explored length in bytes
    pub fn length(&self) -> u32 {
        self.length
    }

    /// One past the last byte; may be 0x10000.
    pub fn end(&self) -> u32 {
        u32::from(self.start) + self.length
    }

    /// Event decoding keeps going past terminators up to this address.
    pub fn continuation_extent(&self) -> Option<Address> {
        self.continuation_extent
    }

    /// True if `addr` falls inside the explored range.
    pub fn contains(&self, addr: Address) -> bool {
        if self.length == 0 {
            return addr == self.start;
        }
        addr >= self.start && u32::from(addr) < self.end()
    }

    pub fn incoming(&self) -> &[LinkId] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[LinkId] {
        &self.outgoing
    }

    pub fn internal_references(&self) -> &[InternalRef] {
        &self.internal
    }

    /// Number of distinct outgoing-edge derivations
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// True once every path class has been linked.
    pub fn is_linked(&self) -> bool {
        self.paths.iter().all(|p| p.linked)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.absorbed_into.is_none()
    }

    /// Drop every linked flag so all paths are walked again.
    pub(crate) fn invalidate(&mut self) {
        self.generation += 1;
        for path in &mut self.paths {
            path.linked = false;
        }
    }

    /// File `link` under its path class, creating the class if needed.
    pub(crate) fn add_incoming(&mut self, id: LinkId, link: &Link) {
        self.incoming.push(id);
        let (target, context) = match self.kind {
            BlockKind::Code => (Some(link.target_addr), link.context.clone()),
            BlockKind::Event => (None, ExecutionContext::default()),
        };
        match self
            .paths
            .iter_mut()
            .find(|p| p.target == target && p.context == context)
        {
            Some(path) => path.links.push(id),
            None => self.paths.push(PathClass {
                target,
                context,
                links: vec![id],
                linked: false,
            }),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            BlockKind::Code => "CodeBlock",
            BlockKind::Event => "EventBlock",
        };
        write!(f, "<{} {:04x}", name, self.start)?;
        if self.length > 0 {
            write!(f, "~{:04x}", self.end() - 1)?;
        }
        write!(
            f,
            ", {} incoming, {} outgoing>",
            self.incoming.len(),
            self.outgoing.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RegValue;
    use crate::Reg;

    #[test]
    fn test_code_paths_split_by_context() {
        let mut block = Block::new(BlockId(0), BlockKind::Code, 0x300, 4);

        let mut ctx = ExecutionContext::new();
        ctx.set(Reg::Bx, RegValue::assigned(0x180, 0x101));
        let a = Link::new(Some(0x104), 0x300).with_context(ctx.clone());
        let b = Link::new(Some(0x114), 0x300).with_context(ctx);
        let c = Link::new(Some(0x124), 0x300);

        block.add_incoming(LinkId(0), &a);
        block.add_incoming(LinkId(1), &b);
        block.add_incoming(LinkId(2), &c);

        assert_eq!(block.incoming().len(), 3);
        assert_eq!(block.path_count(), 2);
        assert!(!block.is_linked());
    }

    #[test]
    fn test_event_paths_collapse() {
        let mut block = Block::new(BlockId(0), BlockKind::Event, 0x300, 4);
        block.add_incoming(LinkId(0), &Link::new(Some(0x101), 0x300));
        block.add_incoming(LinkId(1), &Link::new(Some(0x201), 0x302));

        assert_eq!(block.path_count(), 1);
    }

    #[test]
    fn test_contains_and_display() {
        let block = Block::new(BlockId(0), BlockKind::Event, 0xe010, 0x10);
        assert!(block.contains(0xe010));
        assert!(block.contains(0xe01f));
        assert!(!block.contains(0xe020));
        assert_eq!(block.to_string(), "<EventBlock e010~e01f, 0 incoming, 0 outgoing>");
    }
}
