use std::collections::BTreeSet;

use cranelift_entity::entity_impl;
use evmflow_asm::{EvmInst, Opcode, U256};
use smallvec::SmallVec;

use crate::block::BlockId;
use crate::valuation::Value;

/// An opaque handle to a node in the instruction graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);
entity_impl!(NodeId, "n");

/// What a node is, beyond its opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An instruction taken from the code.
    Real,
    /// A push; the payload is the pushed word.
    Const(U256),
    /// Placeholder for a stack slot consumed below the entry block's stack.
    /// Never resolves.
    Dummy,
    /// Merge of one stack slot across in-edges. `sp` is the negative depth
    /// relative to the block's entry stack.
    StackPhi { sp: i64 },
    /// Like [`NodeKind::StackPhi`] but for very deep digs; its arguments are
    /// fresh opaque placeholders, cutting unbounded phi recursion in
    /// stack-shuffling loops.
    LoopBreakerPhi { sp: i64 },
    /// Merge of the abstract memory state across in-edges.
    MemPhi,
}

/// One vertex of the instruction graph: an instruction, a constant, or a
/// phi, with def-use edges and the valuation attached by the optimizer.
#[derive(Debug, Clone)]
pub struct Node {
    pub block: BlockId,
    /// Position tag within the block, for display.
    pub local_id: u32,
    pub inst: EvmInst,
    pub kind: NodeKind,
    /// Argument order is pop order; memory-touching instructions carry the
    /// incoming memory state as argument 0.
    pub args: SmallVec<[NodeId; 2]>,
    pub uses: BTreeSet<NodeId>,
    pub valuation: Option<Value>,
    /// Human-readable rendering of the valuation. Diagnostics only.
    pub annot: Option<String>,
    pub marked: bool,
}

impl Node {
    pub fn new(block: BlockId, local_id: u32, inst: EvmInst, kind: NodeKind) -> Self {
        Self {
            block,
            local_id,
            inst,
            kind,
            args: SmallVec::new(),
            uses: BTreeSet::new(),
            valuation: None,
            annot: None,
            marked: false,
        }
    }

    pub fn op(&self) -> Opcode {
        self.inst.op
    }

    pub fn is_phi(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::StackPhi { .. } | NodeKind::LoopBreakerPhi { .. } | NodeKind::MemPhi
        )
    }

    pub fn is_mem_phi(&self) -> bool {
        self.kind == NodeKind::MemPhi
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Const(_))
    }

    pub fn const_value(&self) -> Option<U256> {
        match self.kind {
            NodeKind::Const(x) => Some(x),
            _ => None,
        }
    }
}
