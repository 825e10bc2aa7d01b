//! Graph construction: split the instruction stream into basic blocks, fill
//! each against a symbolic stack, then link fallthrough and jump edges.

use evmflow_asm::EvmInst;
use tracing::{debug, warn};

use crate::analysis::Analysis;
use crate::block::BlockData;
use crate::config::AnalysisConfig;
use crate::node::NodeKind;

/// Externally supplied `(jump offset, target offset)` pairs. When present,
/// the CFG is taken as ground truth and the fixpoint engine neither adds nor
/// removes jump edges speculatively.
#[derive(Debug, Clone, Default)]
pub struct JumpOracle {
    edges: Vec<(u32, u32)>,
}

impl JumpOracle {
    pub fn new(mut edges: Vec<(u32, u32)>) -> Self {
        edges.sort_unstable();
        edges.dedup();
        Self { edges }
    }

    pub fn edges(&self) -> &[(u32, u32)] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl Analysis {
    /// Build the SSA-form CFG for an instruction stream. The result is ready
    /// for [`crate::optimize`].
    pub fn analyze(ens: &[EvmInst], config: AnalysisConfig, oracle: Option<&JumpOracle>) -> Self {
        let mut a = Analysis::new(config);
        a.prepare_blocks(ens);
        a.fill_blocks(ens);
        a.link_fallthroughs();
        match oracle {
            Some(o) => a.link_oracle_jumps(o),
            None => a.link_some_jumps(),
        }
        a.settle_phis();
        a
    }

    /// Convenience entry point that disassembles first.
    pub fn analyze_code(
        code: &[u8],
        config: AnalysisConfig,
        oracle: Option<&JumpOracle>,
    ) -> Self {
        Self::analyze(&evmflow_asm::disassemble(code), config, oracle)
    }

    /// Block boundaries: offset 0, every `JUMPDEST`, and the instruction
    /// after every terminator.
    fn prepare_blocks(&mut self, ens: &[EvmInst]) {
        let mut breaks = vec![0u32];
        for en in ens {
            if en.op.is_jumpdest() {
                breaks.push(en.offset);
            }
            if en.op.is_terminator() {
                breaks.push(en.end());
            }
        }
        breaks.push(ens.last().map_or(0, EvmInst::end));
        breaks.sort_unstable();
        breaks.dedup();
        for w in breaks.windows(2) {
            let b = self.blocks.push(BlockData::new(w[0], w[1]));
            self.block_map.insert(w[0], b);
        }
        self.end = breaks.last().copied().unwrap_or(0);
        debug!(blocks = self.blocks.len(), end = self.end, "split blocks");
    }

    /// Run each block's instructions against its symbolic stack, creating
    /// value nodes and def-use edges. Stack shuffles mutate the stack and
    /// leave no node behind.
    fn fill_blocks(&mut self, ens: &[EvmInst]) {
        let allow_skip = self.config.allow_skip;
        let block_ids: Vec<_> = self.blocks.keys().collect();
        let mut i = 0usize;
        for b in block_ids {
            let end = self.blocks[b].end;
            while i < ens.len() && ens[i].offset < end {
                let en = ens[i];
                i += 1;
                let op = en.op;
                if op.is_jumpdest() {
                    continue;
                }
                if op.is_pop() {
                    self.stack_pop(b);
                    continue;
                }
                if op.is_dup() {
                    self.stack_dup(b, -(op.pops() as i64));
                    continue;
                }
                if op.is_swap() {
                    self.stack_swap(b, -(op.pops() as i64));
                    continue;
                }
                let kind = if op.is_push() {
                    NodeKind::Const(en.push_value())
                } else {
                    NodeKind::Real
                };
                let n = self.new_node(b, en, kind);
                if op.needs_memory() {
                    let m = self.get_mem(b);
                    self.append_arg(n, m);
                }
                if op.writes_memory() {
                    self.set_mem(b, n);
                }
                for _ in 0..op.pops() {
                    let a = self.stack_pop(b);
                    self.append_arg(n, a);
                }
                if op.pushes() > 0 {
                    debug_assert_eq!(op.pushes(), 1);
                    self.stack_push(b, n);
                }
                self.blocks[b].ns.push_back(n);
                if allow_skip && op.is_rare() {
                    debug!(block = ?b, op = %op, "rare opcode, block skipped");
                    self.blocks[b].skip = true;
                }
            }
        }
    }

    /// Every live block except the lexically last falls through to its end
    /// offset, unless its last instruction never does.
    fn link_fallthroughs(&mut self) {
        let mut bs: Vec<_> = self.live_blocks().collect();
        if bs.last() == self.blocks.keys().last().as_ref() {
            bs.pop();
        }
        for b in bs {
            let stops = self.blocks[b]
                .last_node()
                .map_or(false, |n| self.nodes[n].op().stops_fallthrough());
            if stops {
                continue;
            }
            let end = self.blocks[b].end;
            self.set_fallthrough_to(b, end);
        }
    }

    /// Without an oracle, seed jump edges from the candidate values of each
    /// jump's target argument. The fixpoint engine revises them later.
    fn link_some_jumps(&mut self) {
        let bs: Vec<_> = self.live_blocks().collect();
        for b in bs {
            let Some(last) = self.blocks[b].last_node() else {
                continue;
            };
            if !self.nodes[last].op().is_jump() {
                continue;
            }
            let target = self.nodes[last].args[0];
            for dst in self.some_possible_values(target) {
                if dst.bits() <= 32 {
                    self.add_jump_to(b, dst.low_u32());
                }
            }
        }
    }

    fn link_oracle_jumps(&mut self, oracle: &JumpOracle) {
        self.jumps_known = true;
        for &(src, dst) in oracle.edges() {
            let Some(b) = self.block_containing(src) else {
                warn!(src, dst, "jump source outside any block");
                continue;
            };
            if self.blocks[b].skip {
                continue;
            }
            if self.block_at(dst).is_none() {
                warn!(src, dst, "jump target is not a block start");
                continue;
            }
            self.add_jump_to(b, dst);
        }
    }

    /// Phis created while filling may predate the edges (and the predecessor
    /// stacks) they merge over; refresh until no new ones appear.
    fn settle_phis(&mut self) {
        loop {
            let pending = self.take_pending_phis();
            if pending.is_empty() {
                break;
            }
            for phi in pending {
                self.refresh_phi(phi);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use evmflow_asm::disassemble;

    use super::*;
    use crate::node::NodeKind;

    fn build(code: &[u8]) -> Analysis {
        Analysis::analyze(&disassemble(code), AnalysisConfig::default(), None)
    }

    #[test]
    fn splits_at_jumpdests_and_terminators() {
        // PUSH1 5; PUSH1 3; ADD; PUSH1 0; JUMPI; JUMPDEST; STOP
        let a = build(&[0x60, 0x05, 0x60, 0x03, 0x01, 0x60, 0x00, 0x57, 0x5b, 0x00]);
        let blocks: Vec<_> = a.block_ids().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(a.block(blocks[0]).offset, 0);
        assert_eq!(a.block(blocks[0]).end, 8);
        assert_eq!(a.block(blocks[1]).offset, 8);
        assert_eq!(a.block(blocks[1]).end, 10);
        assert_eq!(a.end(), 10);
        // The conditional jump falls through to the JUMPDEST block.
        assert_eq!(a.block(blocks[0]).fallthrough.expand(), Some(blocks[1]));
        assert_eq!(a.block(blocks[1]).in_edges, vec![blocks[0]]);
    }

    #[test]
    fn fill_wires_pop_order_args() {
        // PUSH1 5; PUSH1 3; SUB; STOP
        let a = build(&[0x60, 0x05, 0x60, 0x03, 0x03, 0x00]);
        let b = a.entry_block().unwrap();
        let ns: Vec<_> = a.block(b).ns.iter().copied().collect();
        assert_eq!(ns.len(), 4);
        let sub = a.node(ns[2]);
        // First pop is the top of stack: the later push.
        assert_eq!(a.node(sub.args[0]).const_value(), Some(3.into()));
        assert_eq!(a.node(sub.args[1]).const_value(), Some(5.into()));
        assert!(a.node(ns[0]).uses.contains(&ns[2]));
    }

    #[test]
    fn shuffles_leave_no_nodes() {
        // PUSH1 1; PUSH1 2; SWAP1; DUP2; POP; STOP
        let a = build(&[0x60, 0x01, 0x60, 0x02, 0x90, 0x81, 0x50, 0x00]);
        let b = a.entry_block().unwrap();
        // Two constants and the STOP; no nodes for SWAP/DUP/POP.
        assert_eq!(a.block(b).ns.len(), 3);
        // After SWAP1 the stack is [2, 1]; DUP2 copies 2; POP drops it.
        let st = &a.block(b).stack;
        assert_eq!(st.height(), 2);
        assert_eq!(a.node(st.raw[0]).const_value(), Some(2.into()));
        assert_eq!(a.node(st.raw[1]).const_value(), Some(1.into()));
    }

    #[test]
    fn consuming_below_a_block_digs_a_phi() {
        // Block at 2 pops a value produced by its predecessor.
        // PUSH1 7; JUMPDEST; POP; STOP
        let a = build(&[0x60, 0x07, 0x5b, 0x50, 0x00]);
        let blocks: Vec<_> = a.block_ids().collect();
        let b1 = blocks[1];
        assert_eq!(a.block(b1).phis.len(), 1);
        let phi = a.block(b1).phis[0];
        assert_eq!(a.node(phi).kind, NodeKind::StackPhi { sp: -1 });
        // Settled: one argument per in-edge, wired to the predecessor's 7.
        assert_eq!(a.node(phi).args.len(), 1);
        assert_eq!(a.node(a.node(phi).args[0]).const_value(), Some(7.into()));
    }

    #[test]
    fn repeated_digs_return_the_same_phi() {
        // The JUMPDEST block peeks below its entry twice; the second dig
        // must hit the memoized slot instead of minting another phi.
        // PUSH1 7; JUMPDEST; DUP1; POP; DUP1; POP; STOP
        let a = build(&[0x60, 0x07, 0x5b, 0x80, 0x50, 0x80, 0x50, 0x00]);
        let blocks: Vec<_> = a.block_ids().collect();
        let b1 = blocks[1];
        assert_eq!(a.block(b1).phis.len(), 1);
        let buried: Vec<_> = a.block(b1).stack.buried().collect();
        assert_eq!(buried, vec![(-1, a.block(b1).phis[0])]);
    }

    #[test]
    fn entry_block_digs_are_dummies() {
        // POP at offset 0 consumes below an empty entry stack.
        let a = build(&[0x50, 0x00]);
        let b = a.entry_block().unwrap();
        assert_eq!(a.block(b).phis.len(), 0);
        let (sp, n) = a.block(b).stack.buried().next().unwrap();
        assert_eq!(sp, -1);
        assert_eq!(a.node(n).kind, NodeKind::Dummy);
    }

    #[test]
    fn speculative_jump_linking() {
        // PUSH1 4; JUMP; STOP; JUMPDEST; STOP
        let a = build(&[0x60, 0x04, 0x56, 0x00, 0x5b, 0x00]);
        let blocks: Vec<_> = a.block_ids().collect();
        assert_eq!(blocks.len(), 3);
        let (b0, b2) = (blocks[0], blocks[2]);
        assert!(a.block(b0).jump_edges.contains(&b2));
        assert_eq!(a.block(b2).in_edges, vec![b0]);
        // JUMP stops fallthrough.
        assert!(a.block(b0).fallthrough.is_none());
        assert!(!a.jumps_known());
    }

    #[test]
    fn jump_onto_the_fallthrough_links_once() {
        // PUSH1 1; PUSH1 5; JUMPI; JUMPDEST; STOP
        //
        // Both the branch and the fallthrough land on the JUMPDEST block;
        // only one in-edge results.
        let a = build(&[0x60, 0x01, 0x60, 0x05, 0x57, 0x5b, 0x00]);
        let blocks: Vec<_> = a.block_ids().collect();
        let (b0, b1) = (blocks[0], blocks[1]);
        assert_eq!(a.block(b0).fallthrough.expand(), Some(b1));
        assert!(a.block(b0).jump_edges.is_empty());
        assert_eq!(a.block(b1).in_edges, vec![b0]);
    }

    #[test]
    fn jump_to_offset_zero_never_links() {
        // PUSH1 0; JUMP
        let a = build(&[0x60, 0x00, 0x56]);
        let b = a.entry_block().unwrap();
        assert!(a.block(b).jump_edges.is_empty());
    }

    #[test]
    fn oracle_overrides_speculation() {
        // CALLDATALOAD target: speculation finds nothing.
        // PUSH1 0; CALLDATALOAD; JUMP; JUMPDEST; STOP
        let code = [0x60, 0x00, 0x35, 0x56, 0x5b, 0x00];
        let free = build(&code);
        let b0 = free.entry_block().unwrap();
        assert!(free.block(b0).jump_edges.is_empty());

        let oracle = JumpOracle::new(vec![(3, 4)]);
        let a = Analysis::analyze(
            &disassemble(&code),
            AnalysisConfig::default(),
            Some(&oracle),
        );
        let blocks: Vec<_> = a.block_ids().collect();
        assert!(a.block(blocks[0]).jump_edges.contains(&blocks[1]));
        assert!(a.jumps_known());
    }

    #[test]
    fn rare_blocks_are_skipped_when_allowed() {
        // PUSH1 0; PUSH1 0; REVERT; JUMPDEST; STOP
        let code = [0x60, 0x00, 0x60, 0x00, 0xfd, 0x5b, 0x00];
        let a = Analysis::analyze(&disassemble(&code), AnalysisConfig::with_skip(), None);
        let blocks: Vec<_> = a.block_ids().collect();
        assert!(a.block(blocks[0]).skip);
        assert!(!a.block(blocks[1]).skip);
        assert_eq!(a.live_blocks().count(), 1);
    }
}
