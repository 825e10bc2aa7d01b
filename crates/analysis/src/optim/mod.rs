//! The fixpoint engine.
//!
//! A LIFO worklist of updates runs node valuations, phi refreshes, block
//! skipping and block killing to a fixed point. Valuation updates are
//! deduplicated while queued; everything else is cheap enough to repeat.
//! When the queue drains, fallback passes reseed it: first kills for blocks
//! no longer reachable from the entry, then refreshes for phis created since
//! the last drain, then (in speculative mode) kills for blocks whose
//! terminating jump never resolved a target.

mod transfer;

use std::time::Instant;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::analysis::Analysis;
use crate::block::BlockId;
use crate::node::NodeId;
use crate::valuation::Value;

/// Hooks into the run, for rendering or tracing. All methods default to
/// doing nothing.
pub trait OptimizeObserver {
    /// The CFG changed shape (an edge was added or removed).
    fn on_edges_changed(&mut self, _analysis: &Analysis) {}
    /// The fixpoint was reached.
    fn on_complete(&mut self, _analysis: &Analysis) {}
}

/// The do-nothing observer.
pub struct NullObserver;

impl OptimizeObserver for NullObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Update {
    /// Recompute a node's valuation.
    Valuation(NodeId),
    /// Rebuild a phi's arguments, then revalue it.
    PhiRefresh(NodeId),
    /// Check whether a block has become skippable.
    BlockSkip(BlockId),
    /// Force a block dead and sever its out-edges.
    KillBlock(BlockId),
}

#[derive(Default)]
pub(crate) struct Worklist {
    stack: Vec<Update>,
    queued_valuations: FxHashSet<NodeId>,
}

impl Worklist {
    pub(crate) fn push(&mut self, u: Update) {
        if let Update::Valuation(n) = u {
            if !self.queued_valuations.insert(n) {
                return;
            }
        }
        self.stack.push(u);
    }

    fn pop(&mut self) -> Option<Update> {
        let u = self.stack.pop()?;
        if let Update::Valuation(n) = u {
            self.queued_valuations.remove(&n);
        }
        Some(u)
    }
}

/// What the engine is allowed to do to the CFG. Derived once from whether
/// the jump edges came from an oracle.
#[derive(Debug, Clone, Copy)]
struct OptimConfig {
    /// Add jump edges from candidate target values as they appear.
    speculate_jump_edges: bool,
    /// Drop jump edges whose target is no longer a candidate.
    refine_jump_edges: bool,
    /// Drop the untaken side of a conditional jump with a concrete guard.
    certain_branch_pruning: bool,
    /// A block ending in a jump may only be skipped once the jump's target
    /// argument folded.
    skip_needs_resolved_jump: bool,
    /// Drain fallback: kill blocks unreachable from the entry.
    kill_unreachable: bool,
    /// Drain fallback: kill blocks whose jump target never folded.
    kill_unresolved_jumps: bool,
}

impl OptimConfig {
    fn for_graph(jumps_known: bool) -> Self {
        Self {
            speculate_jump_edges: !jumps_known,
            refine_jump_edges: !jumps_known,
            certain_branch_pruning: true,
            skip_needs_resolved_jump: !jumps_known,
            kill_unreachable: true,
            kill_unresolved_jumps: !jumps_known,
        }
    }
}

struct Optimizer {
    cfg: OptimConfig,
    /// Phis whose last valuation was forwarded from their single distinct
    /// argument; cyclic references through them are ignored.
    dead_phis: FxHashSet<NodeId>,
    edges_dirty: bool,
}

/// Run the fixpoint to completion.
///
/// # Panics
/// Panics when the configured update or wall-clock budget is exhausted;
/// an unconverged analysis is unusable and the caller cannot fix it.
pub fn optimize(analysis: &mut Analysis) {
    optimize_with(analysis, &mut NullObserver)
}

pub fn optimize_with(analysis: &mut Analysis, obs: &mut dyn OptimizeObserver) {
    let mut opt = Optimizer {
        cfg: OptimConfig::for_graph(analysis.jumps_known()),
        dead_phis: FxHashSet::default(),
        edges_dirty: false,
    };
    let mut wl = Worklist::default();

    for phi in analysis.take_pending_phis() {
        wl.push(Update::PhiRefresh(phi));
    }
    let live: Vec<BlockId> = analysis.live_blocks().collect();
    for &b in &live {
        wl.push(Update::BlockSkip(b));
        for &phi in &analysis.blocks[b].phis {
            wl.push(Update::Valuation(phi));
        }
    }
    // Nodes without arguments are the heads everything folds from.
    for &b in &live {
        for &n in &analysis.blocks[b].ns {
            if analysis.nodes[n].args.is_empty() {
                wl.push(Update::Valuation(n));
            }
        }
    }

    let deadline = Instant::now() + analysis.config.max_duration;
    let mut steps = 0usize;
    loop {
        for phi in analysis.take_pending_phis() {
            wl.push(Update::PhiRefresh(phi));
        }
        let Some(u) = wl.pop() else {
            if opt.reseed(analysis, &mut wl) {
                continue;
            }
            break;
        };
        steps += 1;
        assert!(
            steps <= analysis.config.max_updates,
            "fixpoint did not converge within {} updates",
            analysis.config.max_updates,
        );
        if steps % 1024 == 0 {
            assert!(
                Instant::now() < deadline,
                "fixpoint did not converge within {:?}",
                analysis.config.max_duration,
            );
        }
        match u {
            Update::Valuation(n) => opt.valuation_update(analysis, &mut wl, n),
            Update::PhiRefresh(n) => {
                analysis.refresh_phi(n);
                wl.push(Update::Valuation(n));
            }
            Update::BlockSkip(b) => opt.block_skip_update(analysis, &mut wl, b),
            Update::KillBlock(b) => opt.kill_block(analysis, &mut wl, b),
        }
        if opt.edges_dirty {
            opt.edges_dirty = false;
            obs.on_edges_changed(analysis);
        }
    }
    debug!(
        steps,
        values = analysis.values.len(),
        live = analysis.live_blocks().count(),
        "fixpoint reached"
    );
    obs.on_complete(analysis);
}

impl Optimizer {
    /// A block becomes skippable when everything it can reach is skipped:
    /// no live fallthrough, no live jump edge, it does not itself leave the
    /// contract, and (in speculative mode) its terminating jump resolved a
    /// concrete target. Skipping propagates backwards.
    fn block_skip_update(&mut self, a: &mut Analysis, wl: &mut Worklist, b: BlockId) {
        if a.blocks[b].skip {
            return;
        }
        let bd = &a.blocks[b];
        if let Some(ft) = bd.fallthrough.expand() {
            if !a.blocks[ft].skip {
                return;
            }
        }
        if !bd.jump_edges.iter().all(|&j| a.blocks[j].skip) {
            return;
        }
        if bd.last_node().map_or(false, |n| a.nodes[n].op().is_final()) {
            return;
        }
        if self.cfg.skip_needs_resolved_jump && !jump_target_resolved(a, b) {
            return;
        }
        debug!(block = ?b, "block skipped");
        a.blocks[b].skip = true;
        let preds = a.blocks[b].in_edges.clone();
        for p in preds {
            wl.push(Update::BlockSkip(p));
        }
    }

    /// Force a block dead: mark it skipped and sever its out-edges.
    /// Successors left without a live in-edge die too; surviving successors
    /// get their phis revalued. The entry block is never killed.
    fn kill_block(&mut self, a: &mut Analysis, wl: &mut Worklist, b: BlockId) {
        if Some(b) == a.entry_block() {
            return;
        }
        let newly = !a.blocks[b].skip;
        a.blocks[b].skip = true;
        let outs: Vec<BlockId> = a.blocks[b].out_edges().collect();
        if newly || !outs.is_empty() {
            debug!(block = ?b, "block killed");
        }
        if !outs.is_empty() {
            self.edges_dirty = true;
        }
        for b2 in outs {
            a.remove_edge(b, b2);
            if a.blocks[b2].skip {
                continue;
            }
            let has_live_pred = a.blocks[b2].in_edges.iter().any(|&p| !a.blocks[p].skip);
            if has_live_pred {
                for &phi in &a.blocks[b2].phis {
                    wl.push(Update::Valuation(phi));
                }
            } else {
                wl.push(Update::KillBlock(b2));
            }
        }
        if newly {
            let preds = a.blocks[b].in_edges.clone();
            for p in preds {
                if !a.blocks[p].skip {
                    wl.push(Update::BlockSkip(p));
                }
            }
        }
    }

    /// Reseed an empty queue. Returns false when there is nothing left to
    /// do and the fixpoint is reached.
    fn reseed(&mut self, a: &mut Analysis, wl: &mut Worklist) -> bool {
        if self.cfg.kill_unreachable {
            let reach = a.reachable_from_entry();
            let live: Vec<BlockId> = a.live_blocks().collect();
            let mut any = false;
            for b in live {
                if !reach.contains(&b) {
                    wl.push(Update::KillBlock(b));
                    any = true;
                }
            }
            if any {
                debug!("reseeding kills for unreachable blocks");
                return true;
            }
        }
        let pending = a.take_pending_phis();
        if !pending.is_empty() {
            for phi in pending {
                wl.push(Update::PhiRefresh(phi));
            }
            return true;
        }
        if self.cfg.kill_unresolved_jumps {
            let live: Vec<BlockId> = a.live_blocks().collect();
            let mut any = false;
            for b in live {
                if Some(b) == a.entry_block() {
                    continue;
                }
                let Some(last) = a.blocks[b].last_node() else {
                    continue;
                };
                if !a.nodes[last].op().is_jump() {
                    continue;
                }
                let target = a.nodes[last].args[0];
                if matches!(a.nodes[target].valuation, Some(Value::Int(_))) {
                    continue;
                }
                // A conditional jump certain not to be taken does not need
                // its target.
                if a.nodes[last].op().is_cond_jump() {
                    let guard = a.nodes[last].args[1];
                    if matches!(a.nodes[guard].valuation, Some(Value::Int(g)) if g.is_zero()) {
                        continue;
                    }
                }
                debug!(block = ?b, "jump target never resolved, killing block");
                wl.push(Update::KillBlock(b));
                any = true;
            }
            if any {
                return true;
            }
        }
        false
    }
}

fn jump_target_resolved(a: &Analysis, b: BlockId) -> bool {
    let Some(last) = a.blocks[b].last_node() else {
        return true;
    };
    if !a.nodes[last].op().is_jump() {
        return true;
    }
    let target = a.nodes[last].args[0];
    matches!(a.nodes[target].valuation, Some(Value::Int(_)))
}

// -- post-fixpoint marking passes -------------------------------------------

/// Mark the given blocks and everything that can reach them.
pub fn mark_blocks(a: &mut Analysis, roots: impl IntoIterator<Item = BlockId>) {
    let mut todo: Vec<BlockId> = roots.into_iter().collect();
    while let Some(b) = todo.pop() {
        if a.blocks[b].marked {
            continue;
        }
        a.blocks[b].marked = true;
        todo.extend(a.blocks[b].in_edges.iter().copied());
    }
}

/// Mark the given nodes and their argument trees.
pub fn mark_instructions(a: &mut Analysis, roots: impl IntoIterator<Item = NodeId>) {
    let mut todo: Vec<NodeId> = roots.into_iter().collect();
    while let Some(n) = todo.pop() {
        if a.nodes[n].marked {
            continue;
        }
        a.nodes[n].marked = true;
        todo.extend(a.nodes[n].args.iter().copied());
    }
}

/// Mark the producing nodes of the given valuations, chasing each argument
/// to its current valuation. Concrete argument words are collected on the
/// producing node's block instead of recursed into, and a valuation with an
/// unresolved argument ends the walk at that node.
pub fn mark_by_valuation(a: &mut Analysis, roots: impl IntoIterator<Item = Value>) {
    let mut todo: Vec<Value> = roots.into_iter().collect();
    while let Some(v) = todo.pop() {
        let Value::Sym(id, _) = v else {
            continue;
        };
        let n = a.values.data(id).node;
        if a.nodes[n].marked {
            continue;
        }
        a.nodes[n].marked = true;
        let args = a.values.data(id).args.clone();
        let mut next = Vec::new();
        let mut complete = true;
        for av in args {
            let Some(av) = av else {
                complete = false;
                break;
            };
            match a.latest_value(av) {
                None => {
                    complete = false;
                    break;
                }
                Some(Value::Int(x)) => {
                    let b = a.nodes[n].block;
                    a.blocks[b].marked_ints.insert(x);
                }
                Some(v2) => next.push(v2),
            }
        }
        if complete {
            todo.extend(next);
        }
    }
}

#[cfg(test)]
mod test {
    use cranelift_entity::EntityRef;
    use evmflow_asm::disassemble;

    use super::*;
    use crate::config::AnalysisConfig;

    #[test]
    fn worklist_dedups_queued_valuations() {
        let mut wl = Worklist::default();
        let n = NodeId::new(3);
        wl.push(Update::Valuation(n));
        wl.push(Update::Valuation(n));
        wl.push(Update::PhiRefresh(n));
        wl.push(Update::PhiRefresh(n));
        assert_eq!(wl.pop(), Some(Update::PhiRefresh(n)));
        assert_eq!(wl.pop(), Some(Update::PhiRefresh(n)));
        assert_eq!(wl.pop(), Some(Update::Valuation(n)));
        assert_eq!(wl.pop(), None);
        // Popping released the slot.
        wl.push(Update::Valuation(n));
        assert_eq!(wl.pop(), Some(Update::Valuation(n)));
    }

    #[test]
    fn observer_sees_edge_changes_and_completion() {
        #[derive(Default)]
        struct Counter {
            edge_changes: usize,
            completed: bool,
        }
        impl OptimizeObserver for Counter {
            fn on_edges_changed(&mut self, _analysis: &Analysis) {
                self.edge_changes += 1;
            }
            fn on_complete(&mut self, _analysis: &Analysis) {
                self.completed = true;
            }
        }

        // PUSH1 1; PUSH1 6; JUMPI; STOP; JUMPDEST; STOP
        // The taken branch drops the fallthrough edge and kills the STOP
        // block in between.
        let code = [0x60, 0x01, 0x60, 0x06, 0x57, 0x00, 0x5b, 0x00];
        let mut a = Analysis::analyze(&disassemble(&code), AnalysisConfig::default(), None);
        let mut counter = Counter::default();
        optimize_with(&mut a, &mut counter);
        assert!(counter.completed);
        assert!(counter.edge_changes >= 1);
    }
}
