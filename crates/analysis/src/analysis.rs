//! The analysis state: node and block arenas, the valuation store, and the
//! graph surgery (stack digging, phi refresh, edge add/remove) that both the
//! builder and the fixpoint engine go through.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use cranelift_entity::{EntityRef, PrimaryMap};
use evmflow_asm::{EvmInst, Opcode, U256};
use rustc_hash::FxHashSet;
use tracing::{trace, warn};

use crate::block::{BlockData, BlockId};
use crate::config::AnalysisConfig;
use crate::node::{Node, NodeId, NodeKind};
use crate::valuation::{Value, ValueStore};

pub struct Analysis {
    pub(crate) nodes: PrimaryMap<NodeId, Node>,
    pub(crate) blocks: PrimaryMap<BlockId, BlockData>,
    /// Start offset to block, for jump-target resolution.
    pub(crate) block_map: BTreeMap<u32, BlockId>,
    pub(crate) values: ValueStore,
    /// Phis created since the last drain; the fixpoint engine turns these
    /// into refresh work.
    pub(crate) pending_phis: Vec<NodeId>,
    pub(crate) jumps_known: bool,
    pub(crate) config: AnalysisConfig,
    /// One past the last code offset.
    pub(crate) end: u32,
}

impl Analysis {
    pub(crate) fn new(config: AnalysisConfig) -> Self {
        Self {
            nodes: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            block_map: BTreeMap::new(),
            values: ValueStore::default(),
            pending_phis: Vec::new(),
            jumps_known: false,
            config,
            end: 0,
        }
    }

    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n]
    }

    pub fn block(&self, b: BlockId) -> &BlockData {
        &self.blocks[b]
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Whether the CFG came from an external jump table rather than
    /// speculation.
    pub fn jumps_known(&self) -> bool {
        self.jumps_known
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.keys().next()
    }

    /// All blocks in offset order, skipped ones included.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys()
    }

    /// Non-skipped blocks in offset order.
    pub fn live_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().filter(|&b| !self.blocks[b].skip)
    }

    /// The block starting exactly at `offset`. Offset 0 is not addressable;
    /// jumps to it never link.
    pub fn block_at(&self, offset: u32) -> Option<BlockId> {
        if offset == 0 {
            return None;
        }
        self.block_map.get(&offset).copied()
    }

    /// The block whose byte range contains `offset`.
    pub fn block_containing(&self, offset: u32) -> Option<BlockId> {
        let (_, &b) = self.block_map.range(..=offset).next_back()?;
        (offset < self.blocks[b].end).then_some(b)
    }

    // -- node and def-use plumbing ------------------------------------------

    pub(crate) fn new_node(&mut self, b: BlockId, inst: EvmInst, kind: NodeKind) -> NodeId {
        let local_id = self.blocks[b].new_local_id();
        self.nodes.push(Node::new(b, local_id, inst, kind))
    }

    pub(crate) fn append_arg(&mut self, n: NodeId, a: NodeId) {
        self.nodes[n].args.push(a);
        self.nodes[a].uses.insert(n);
    }

    pub(crate) fn clear_args(&mut self, n: NodeId) {
        let args = std::mem::take(&mut self.nodes[n].args);
        for a in args {
            self.nodes[a].uses.remove(&n);
        }
    }

    // -- phis ----------------------------------------------------------------

    fn add_phi(&mut self, b: BlockId, phi: NodeId) {
        self.blocks[b].phis.push(phi);
        self.blocks[b].ns.push_front(phi);
        self.pending_phis.push(phi);
    }

    fn new_dummy(&mut self, b: BlockId) -> NodeId {
        let offset = self.blocks[b].offset;
        self.new_node(b, EvmInst::new(offset, Opcode::Dummy), NodeKind::Dummy)
    }

    /// Materialize the phi (or entry-block placeholder) for stack slot `sp`
    /// below block entry.
    pub(crate) fn create_stack_phi(&mut self, b: BlockId, sp: i64) -> NodeId {
        let offset = self.blocks[b].offset;
        if offset == 0 {
            // Consuming below the entry block's empty stack can never
            // resolve to anything.
            return self.new_dummy(b);
        }
        let kind = if sp >= self.config.loop_breaker_depth {
            NodeKind::StackPhi { sp }
        } else {
            NodeKind::LoopBreakerPhi { sp }
        };
        let phi = self.new_node(b, EvmInst::new(offset, Opcode::Phi), kind);
        self.add_phi(b, phi);
        phi
    }

    /// The node currently producing this block's memory state, creating the
    /// merge phi on first use.
    pub(crate) fn get_mem(&mut self, b: BlockId) -> NodeId {
        if let Some(m) = self.blocks[b].mem.expand() {
            return m;
        }
        let offset = self.blocks[b].offset;
        let phi = self.new_node(b, EvmInst::new(offset, Opcode::Phi), NodeKind::MemPhi);
        self.add_phi(b, phi);
        self.blocks[b].mem_phi = Some(phi).into();
        self.blocks[b].mem = Some(phi).into();
        phi
    }

    pub(crate) fn set_mem(&mut self, b: BlockId, n: NodeId) {
        self.blocks[b].mem = Some(n).into();
    }

    /// Rebuild a phi's arguments from the current in-edges. Stack phis read
    /// the predecessor's exit stack (digging it if needed), memory phis read
    /// the predecessor's memory producer, loop breakers get fresh opaque
    /// placeholders.
    pub(crate) fn refresh_phi(&mut self, phi: NodeId) {
        self.clear_args(phi);
        let b = self.nodes[phi].block;
        let kind = self.nodes[phi].kind;
        let preds = self.blocks[b].in_edges.clone();
        for e in preds {
            let a = match kind {
                NodeKind::StackPhi { sp } => self.stack_get(e, sp),
                NodeKind::LoopBreakerPhi { .. } => self.new_dummy(b),
                NodeKind::MemPhi => self.get_mem(e),
                NodeKind::Real | NodeKind::Const(_) | NodeKind::Dummy => {
                    unreachable!("refresh of a non-phi node")
                }
            };
            self.append_arg(phi, a);
        }
    }

    pub(crate) fn take_pending_phis(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending_phis)
    }

    // -- symbolic stack ------------------------------------------------------

    pub(crate) fn stack_push(&mut self, b: BlockId, n: NodeId) {
        self.blocks[b].stack.push(n);
    }

    pub(crate) fn stack_pop(&mut self, b: BlockId) -> NodeId {
        if let Some(n) = self.blocks[b].stack.raw.pop() {
            return n;
        }
        self.blocks[b].stack.pops += 1;
        let sp = -(self.blocks[b].stack.pops as i64);
        self.stack_dig(b, sp)
    }

    fn stack_dig(&mut self, b: BlockId, sp: i64) -> NodeId {
        if let Some(&n) = self.blocks[b].stack.buried.get(&sp) {
            return n;
        }
        let n = self.create_stack_phi(b, sp);
        self.blocks[b].stack.buried.insert(sp, n);
        n
    }

    /// Peek at depth `diff` (negative, -1 is the top) without popping.
    pub(crate) fn stack_get(&mut self, b: BlockId, diff: i64) -> NodeId {
        let st = &self.blocks[b].stack;
        let idx = st.raw.len() as i64 + diff;
        if idx >= 0 {
            st.raw[idx as usize]
        } else {
            let sp = idx - st.pops as i64;
            self.stack_dig(b, sp)
        }
    }

    pub(crate) fn stack_dup(&mut self, b: BlockId, diff: i64) {
        let n = self.stack_get(b, diff);
        self.blocks[b].stack.push(n);
    }

    pub(crate) fn stack_swap(&mut self, b: BlockId, diff: i64) {
        let st = &self.blocks[b].stack;
        let idx = st.raw.len() as i64 + diff;
        if idx >= 0 {
            let idx = idx as usize;
            let n1 = st.raw[idx];
            let n2 = self.stack_pop(b);
            let st = &mut self.blocks[b].stack;
            st.raw.push(n1);
            st.raw[idx] = n2;
        } else {
            let sp = idx - st.pops as i64;
            let n1 = self.stack_dig(b, sp);
            let n2 = self.stack_pop(b);
            let st = &mut self.blocks[b].stack;
            st.raw.push(n1);
            st.buried.insert(sp, n2);
        }
    }

    // -- edges ---------------------------------------------------------------

    pub(crate) fn accept_edge(&mut self, dst: BlockId, src: BlockId) {
        assert!(!self.blocks[src].skip, "edge out of a skipped block");
        assert!(
            !self.blocks[dst].in_edges.contains(&src),
            "duplicate in-edge"
        );
        trace!(src = ?src, dst = ?dst, "edge added");
        self.blocks[dst].in_edges.push(src);
        let phis = self.blocks[dst].phis.clone();
        for phi in phis {
            self.refresh_phi(phi);
        }
    }

    pub(crate) fn forget_edge(&mut self, dst: BlockId, src: BlockId) {
        trace!(src = ?src, dst = ?dst, "edge removed");
        self.blocks[dst].in_edges.retain(|&e| e != src);
        let phis = self.blocks[dst].phis.clone();
        for phi in phis {
            self.refresh_phi(phi);
        }
    }

    /// Link `b -> block at dst_offset` as a jump edge. Returns the target
    /// only when a new edge was added.
    pub(crate) fn add_jump_to(&mut self, b: BlockId, dst_offset: u32) -> Option<BlockId> {
        let b2 = self.block_at(dst_offset)?;
        // A jump onto the existing fallthrough target is the same edge;
        // in-edges stay duplicate-free.
        if self.blocks[b].fallthrough.expand() == Some(b2) {
            return None;
        }
        if !self.blocks[b].jump_edges.insert(b2) {
            return None;
        }
        self.accept_edge(b2, b);
        Some(b2)
    }

    pub(crate) fn set_fallthrough_to(&mut self, b: BlockId, offset: u32) {
        debug_assert!(self.blocks[b].fallthrough.is_none());
        match self.block_map.get(&offset).copied() {
            Some(b2) => {
                self.blocks[b].fallthrough = Some(b2).into();
                self.accept_edge(b2, b);
            }
            None => warn!(offset, "fallthrough target outside any block"),
        }
    }

    pub(crate) fn remove_fallthrough_edge(&mut self, b: BlockId) -> Option<BlockId> {
        let b2 = self.blocks[b].fallthrough.take()?;
        self.forget_edge(b2, b);
        Some(b2)
    }

    pub(crate) fn remove_jump_edge(&mut self, b: BlockId, b2: BlockId) -> bool {
        if self.blocks[b].jump_edges.remove(&b2) {
            self.forget_edge(b2, b);
            true
        } else {
            false
        }
    }

    pub(crate) fn remove_edge(&mut self, b: BlockId, b2: BlockId) {
        if self.blocks[b].fallthrough.expand() == Some(b2) {
            self.remove_fallthrough_edge(b);
        }
        self.remove_jump_edge(b, b2);
    }

    /// Blocks reachable from the entry traversing out of live blocks only.
    pub(crate) fn reachable_from_entry(&self) -> FxHashSet<BlockId> {
        let mut seen = FxHashSet::default();
        let mut todo: Vec<BlockId> = self.entry_block().into_iter().collect();
        while let Some(b) = todo.pop() {
            if !seen.insert(b) {
                continue;
            }
            if self.blocks[b].skip {
                continue;
            }
            todo.extend(self.blocks[b].out_edges());
        }
        seen
    }

    // -- valuation queries ---------------------------------------------------

    /// Candidate concrete words `n` could evaluate to, walking constants and
    /// phi arguments to a bounded depth. When `n`'s valuation already
    /// carries a possible-value set, that set is unioned in and the walk is
    /// shallower.
    pub fn some_possible_values(&self, n: NodeId) -> BTreeSet<U256> {
        let mut res = BTreeSet::new();
        if let Some(Value::Sym(id, _)) = self.nodes[n].valuation {
            if let Some(pv) = &self.values.data(id).possible_values {
                self.collect_possible(n, self.config.possible_value_depth_with_set, &mut res);
                res.extend(pv.iter().copied());
                return res;
            }
        }
        self.collect_possible(n, self.config.possible_value_depth, &mut res);
        res
    }

    fn collect_possible(&self, n: NodeId, depth: u32, res: &mut BTreeSet<U256>) {
        let node = &self.nodes[n];
        if let Some(Value::Int(x)) = node.valuation {
            res.insert(x);
        } else if let Some(x) = node.const_value() {
            res.insert(x);
        } else if node.is_phi() && depth > 0 {
            for &a in &node.args {
                self.collect_possible(a, depth - 1, res);
            }
        }
    }

    /// Chase a value to the current valuation of its producing node. `None`
    /// means the chain hits an unresolved node.
    pub fn latest_value(&self, v: Value) -> Option<Value> {
        let mut v = v;
        // The chase is finite in practice; the guard only caps degenerate
        // fingerprint-collision cycles.
        for _ in 0..10_000 {
            let Value::Sym(id, _) = v else {
                return Some(v);
            };
            match self.nodes[self.values.data(id).node].valuation {
                None => return None,
                Some(nv) if nv != v => v = nv,
                Some(_) => return Some(v),
            }
        }
        Some(v)
    }

    // -- display -------------------------------------------------------------

    pub fn describe_value(&self, v: Value) -> String {
        match v {
            Value::Int(x) => format!("#{x:x}"),
            Value::Sym(id, h) => {
                let d = self.values.data(id);
                let mut s = format!("{}(", d.op);
                for (i, &av) in d.args.iter().enumerate() {
                    if i > 0 {
                        s.push(',');
                    }
                    s.push_str(&self.describe_arg(av));
                }
                s.push(')');
                if let Some(pv) = d.possible_values.as_deref() {
                    if !pv.is_empty() {
                        s.push('{');
                        for (i, x) in pv.iter().enumerate() {
                            if i > 0 {
                                s.push(',');
                            }
                            let _ = write!(s, "#{x:x}");
                        }
                        s.push('}');
                    }
                }
                let _ = write!(s, "~{:05x}", h & 0xf_ffff);
                s
            }
        }
    }

    fn describe_arg(&self, av: Option<Value>) -> String {
        match av {
            None => "?".to_string(),
            Some(Value::Int(x)) => format!("#{x:x}"),
            Some(Value::Sym(id, _)) => format!("n{}", self.values.data(id).node.index()),
        }
    }
}
