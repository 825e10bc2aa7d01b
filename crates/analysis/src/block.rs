use std::collections::{BTreeSet, VecDeque};

use cranelift_entity::{entity_impl, packed_option::PackedOption};
use evmflow_asm::U256;

use crate::node::NodeId;
use crate::stack::Stack;

/// An opaque handle to a basic block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// A basic block: a half-open byte range of the code, its nodes (phis
/// first), its symbolic stack, and its CFG edges.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub offset: u32,
    pub end: u32,
    /// Nodes in order; phis sit at the front.
    pub ns: VecDeque<NodeId>,
    pub phis: Vec<NodeId>,
    /// The memory-merge phi, created lazily on first memory access.
    pub mem_phi: PackedOption<NodeId>,
    /// Current memory producer while filling; the last memory writer, or
    /// the memory phi.
    pub mem: PackedOption<NodeId>,
    pub stack: Stack,
    /// Excluded from the analysis. Monotone: never unset once set.
    pub skip: bool,
    pub in_edges: Vec<BlockId>,
    pub fallthrough: PackedOption<BlockId>,
    pub jump_edges: BTreeSet<BlockId>,
    pub marked: bool,
    /// Concrete words that flowed into marked nodes of this block.
    pub marked_ints: BTreeSet<U256>,
    next_local_id: u32,
}

impl BlockData {
    pub fn new(offset: u32, end: u32) -> Self {
        Self {
            offset,
            end,
            ns: VecDeque::new(),
            phis: Vec::new(),
            mem_phi: None.into(),
            mem: None.into(),
            stack: Stack::default(),
            skip: false,
            in_edges: Vec::new(),
            fallthrough: None.into(),
            jump_edges: BTreeSet::new(),
            marked: false,
            marked_ints: BTreeSet::new(),
            next_local_id: 0,
        }
    }

    pub(crate) fn new_local_id(&mut self) -> u32 {
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }

    pub fn last_node(&self) -> Option<NodeId> {
        self.ns.back().copied()
    }

    pub fn out_edges(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.fallthrough
            .expand()
            .into_iter()
            .chain(self.jump_edges.iter().copied())
    }

    /// More than one way out: several jump targets, or one plus a
    /// fallthrough.
    pub fn has_multiple_out_edges(&self) -> bool {
        self.jump_edges.len() > 1 || (self.jump_edges.len() == 1 && self.fallthrough.is_some())
    }
}
