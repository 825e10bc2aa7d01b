//! The symbolic operand stack a block is filled against.
//!
//! `raw` models the slots the block itself pushed. Consuming below it
//! "digs": the missing slot is materialized as a stack phi (or a dummy in
//! the entry block) and memoized in `buried`, keyed by negative depth
//! relative to the block's entry stack. `pops` counts how far below entry
//! the block has consumed so far.
//!
//! Digging lives on [`crate::Analysis`] because it creates nodes; the plain
//! data operations live here.

use std::collections::BTreeMap;

use crate::node::NodeId;

#[derive(Debug, Clone, Default)]
pub struct Stack {
    pub(crate) raw: Vec<NodeId>,
    pub(crate) buried: BTreeMap<i64, NodeId>,
    pub(crate) pops: u32,
}

impl Stack {
    pub fn push(&mut self, n: NodeId) {
        self.raw.push(n);
    }

    pub fn height(&self) -> usize {
        self.raw.len()
    }

    /// The memoized below-entry slots, deepest first.
    pub fn buried(&self) -> impl Iterator<Item = (i64, NodeId)> + '_ {
        self.buried.iter().map(|(&sp, &n)| (sp, n))
    }
}
