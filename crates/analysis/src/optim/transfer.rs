//! Per-opcode transfer rules: constant folding, algebraic identities, the
//! abstract memory effects, and jump-edge revision.

use evmflow_asm::{Opcode, U256};
use primitive_types::U512;
use smallvec::SmallVec;
use tracing::debug;

use crate::analysis::Analysis;
use crate::block::BlockId;
use crate::mempad::{as_mem_addr, load32, load_region, ByteMap, MempadBuilder};
use crate::node::{NodeId, NodeKind};
use crate::valuation::{
    args_hash, plain_hash, phi_hash, value_hash, ArgValues, ValOp, ValuationData, Value,
};

use super::{Optimizer, Update, Worklist};

impl Optimizer {
    /// Recompute the valuation of `n` from its arguments' valuations.
    ///
    /// Early exits: a symbolic valuation computed from the same argument
    /// fingerprints is already current, and a non-phi with any unresolved
    /// argument stays unresolved. Phis tolerate unresolved arguments.
    pub(super) fn valuation_update(&mut self, a: &mut Analysis, wl: &mut Worklist, n: NodeId) {
        let v_old = a.nodes[n].valuation;
        let op = a.nodes[n].op();
        let args: SmallVec<[NodeId; 2]> = a.nodes[n].args.clone();
        let mut avs: ArgValues = args.iter().map(|&x| a.nodes[x].valuation).collect();
        if op.commutes_first_two() && avs.len() >= 2 && value_hash(avs[0]) > value_hash(avs[1]) {
            avs.swap(0, 1);
        }
        let avsh = args_hash(&avs);
        if let Some(Value::Sym(id, _)) = v_old {
            if a.values.data(id).args_hash == avsh {
                return;
            }
        }
        let is_phi = a.nodes[n].is_phi();
        if !is_phi && avs.iter().any(Option::is_none) {
            return;
        }

        let v = if is_phi {
            Some(self.phi_valuation(a, n, &avs, avsh, v_old))
        } else {
            self.fold(a, wl, n, op, &args, &avs, avsh)
        };
        let v = v.unwrap_or_else(|| {
            a.values.intern(ValuationData::plain(
                n,
                ValOp::Op(op),
                avs.clone(),
                avsh,
                op.pushes() == 0,
            ))
        });

        if Some(v) != v_old {
            let uses: Vec<NodeId> = a.nodes[n].uses.iter().copied().collect();
            for u in uses {
                wl.push(Update::Valuation(u));
            }
        }
        a.nodes[n].annot = match v {
            Value::Int(x) if !a.nodes[n].is_constant() => Some(format!("#{x:x}")),
            Value::Int(_) => None,
            Value::Sym(..) => Some(a.describe_value(v)),
        };
        a.nodes[n].valuation = Some(v);
    }

    /// Merge the phi's argument valuations.
    ///
    /// Memory phis intersect their inputs' byte maps. Stack phis collect the
    /// distinct resolved arguments, ignoring self-references and references
    /// through forwarded phis; a single survivor is forwarded as-is, anything
    /// else becomes a phi valuation fingerprinted by the accumulated set of
    /// concrete words. The set only grows across recomputations, which is
    /// what makes the fixpoint monotone.
    fn phi_valuation(
        &mut self,
        a: &mut Analysis,
        n: NodeId,
        avs: &ArgValues,
        avsh: u64,
        v_old: Option<Value>,
    ) -> Value {
        if a.nodes[n].is_mem_phi() {
            let mut mb = MempadBuilder::new(n, ValOp::Phi, avs.clone(), avsh, true, ByteMap::new());
            mb.meet(avs.iter().map(|&av| av.and_then(|v| a.values.bytemap(v))));
            return mb.finalize_keyed(&mut a.values);
        }

        let mut q: Vec<Value> = Vec::new();
        let mut t = std::collections::BTreeSet::new();
        for &av in avs {
            let Some(v) = av else { continue };
            match v {
                Value::Int(x) => {
                    t.insert(x);
                    if !q.contains(&v) {
                        q.push(v);
                    }
                }
                Value::Sym(id, _) => {
                    let d = a.values.data(id);
                    if d.origin == n || self.dead_phis.contains(&d.origin) {
                        continue;
                    }
                    if let Some(pv) = &d.possible_values {
                        t.extend(pv.iter().copied());
                    }
                    if !q.contains(&v) {
                        q.push(v);
                    }
                }
            }
        }
        if let Some(Value::Sym(old, _)) = v_old {
            let od = a.values.data(old);
            if od.origin == n {
                if let Some(pv) = &od.possible_values {
                    t.extend(pv.iter().copied());
                }
            }
        }
        if q.len() == 1 {
            // One distinct incoming value: the phi is a pass-through.
            self.dead_phis.insert(n);
            return q[0];
        }
        self.dead_phis.remove(&n);
        let hash = phi_hash(n, &t);
        a.values.intern(ValuationData {
            node: n,
            op: ValOp::Phi,
            args: avs.clone(),
            args_hash: avsh,
            hash,
            no_value: true,
            origin: n,
            possible_values: Some(t.into_iter().collect()),
            bytemap: None,
        })
    }

    /// The opcode-specific rules. `None` falls back to the generic symbolic
    /// valuation. All argument valuations are resolved here.
    fn fold(
        &mut self,
        a: &mut Analysis,
        wl: &mut Worklist,
        n: NodeId,
        op: Opcode,
        args: &[NodeId],
        avs: &ArgValues,
        avsh: u64,
    ) -> Option<Value> {
        if let NodeKind::Const(x) = a.nodes[n].kind {
            return Some(Value::Int(x));
        }

        let g = |i: usize| -> Option<Value> { avs.get(i).copied().flatten() };
        let gi = |i: usize| -> Option<U256> { g(i).and_then(Value::as_int) };
        let int = |x: U256| Some(Value::Int(x));
        let zero = U256::zero();
        let one = U256::one();

        use Opcode::*;
        match op {
            Add => {
                if gi(0) == Some(zero) {
                    return g(1);
                }
                if gi(1) == Some(zero) {
                    return g(0);
                }
                int(gi(0)?.overflowing_add(gi(1)?).0)
            }
            Sub => {
                if gi(1) == Some(zero) {
                    return g(0);
                }
                if g(0) == g(1) {
                    return int(zero);
                }
                int(gi(0)?.overflowing_sub(gi(1)?).0)
            }
            Mul => {
                if gi(0) == Some(zero) || gi(1) == Some(zero) {
                    return int(zero);
                }
                if gi(0) == Some(one) {
                    return g(1);
                }
                if gi(1) == Some(one) {
                    return g(0);
                }
                int(gi(0)?.overflowing_mul(gi(1)?).0)
            }
            Div => {
                if gi(0) == Some(zero) || gi(1) == Some(zero) {
                    return int(zero);
                }
                if gi(1) == Some(one) {
                    return g(0);
                }
                int(gi(0)?.checked_div(gi(1)?).unwrap_or_default())
            }
            Sdiv => {
                if gi(1) == Some(zero) {
                    return int(zero);
                }
                if gi(1) == Some(one) {
                    return g(0);
                }
                int(sdiv(gi(0)?, gi(1)?))
            }
            Mod => {
                if gi(0) == Some(zero) || gi(1) == Some(zero) || gi(1) == Some(one) {
                    return int(zero);
                }
                if g(0) == g(1) {
                    return int(zero);
                }
                int(gi(0)?.checked_rem(gi(1)?).unwrap_or_default())
            }
            Smod => {
                if gi(1) == Some(zero) {
                    return int(zero);
                }
                int(smod(gi(0)?, gi(1)?))
            }
            AddMod => {
                if gi(2) == Some(zero) || gi(2) == Some(one) {
                    return int(zero);
                }
                let s = (U512::from(gi(0)?) + U512::from(gi(1)?)) % U512::from(gi(2)?);
                int(u512_low(s))
            }
            MulMod => {
                if gi(0) == Some(zero) || gi(1) == Some(zero) {
                    return int(zero);
                }
                if gi(2) == Some(zero) || gi(2) == Some(one) {
                    return int(zero);
                }
                let p = (U512::from(gi(0)?) * U512::from(gi(1)?)) % U512::from(gi(2)?);
                int(u512_low(p))
            }
            Exp => {
                if gi(1) == Some(zero) {
                    return int(one);
                }
                if gi(0) == Some(zero) {
                    return int(zero);
                }
                if gi(0) == Some(one) {
                    return int(one);
                }
                if gi(1) == Some(one) {
                    return g(0);
                }
                int(gi(0)?.overflowing_pow(gi(1)?).0)
            }
            SignExtend => {
                if gi(0)? >= U256::from(31) {
                    return g(1);
                }
                let bits = 8 * gi(0)?.low_u64() as usize + 8;
                let x = gi(1)?;
                let mask = (one << bits) - one;
                int(if x.bit(bits - 1) { x | !mask } else { x & mask })
            }
            Lt => {
                if gi(1) == Some(zero) {
                    return int(zero);
                }
                int(word(gi(0)? < gi(1)?))
            }
            Gt => {
                if gi(0) == Some(zero) {
                    return int(zero);
                }
                int(word(gi(0)? > gi(1)?))
            }
            Slt => int(word(slt(gi(0)?, gi(1)?))),
            Sgt => int(word(slt(gi(1)?, gi(0)?))),
            Eq => {
                if g(0) == g(1) {
                    return int(one);
                }
                int(word(gi(0)? == gi(1)?))
            }
            IsZero => int(word(gi(0)?.is_zero())),
            And => {
                if gi(0) == Some(zero) || gi(1) == Some(zero) {
                    return int(zero);
                }
                if g(0) == g(1) {
                    return g(0);
                }
                int(gi(0)? & gi(1)?)
            }
            Or => {
                if gi(0) == Some(zero) {
                    return g(1);
                }
                if gi(1) == Some(zero) || g(0) == g(1) {
                    return g(0);
                }
                int(gi(0)? | gi(1)?)
            }
            Xor => {
                if gi(0) == Some(zero) {
                    return g(1);
                }
                if gi(1) == Some(zero) {
                    return g(0);
                }
                if g(0) == g(1) {
                    return int(zero);
                }
                int(gi(0)? ^ gi(1)?)
            }
            Not => int(!gi(0)?),
            Byte => {
                if gi(0)? >= U256::from(32) {
                    return int(zero);
                }
                // The selected byte stays in the top position.
                let mask = U256::from(0xff) << 248;
                int((gi(1)? << (8 * gi(0)?.low_u64() as usize)) & mask)
            }
            Shl => {
                if gi(0)? >= U256::from(256) {
                    return int(zero);
                }
                int(gi(1)? << gi(0)?.low_u64() as usize)
            }
            Shr => {
                if gi(0)? >= U256::from(256) {
                    return int(zero);
                }
                int(gi(1)? >> gi(0)?.low_u64() as usize)
            }
            Sar => {
                if gi(0)? >= U256::from(256) {
                    return int(zero);
                }
                let s = gi(0)?.low_u64() as usize;
                let x = gi(1)?;
                let r = x >> s;
                int(if is_neg(x) && s > 0 {
                    r | !(U256::MAX >> s)
                } else {
                    r
                })
            }
            Jump | JumpI => {
                self.jump_update(a, wl, n, op, avs);
                None
            }
            MStore | MStore8 => {
                let mb = match gi(1).and_then(as_mem_addr) {
                    Some(addr) => {
                        let map = g(0)
                            .and_then(|v| a.values.bytemap(v))
                            .cloned()
                            .unwrap_or_default();
                        let mut mb =
                            MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, map);
                        if op == MStore {
                            mb.store32(addr, args[2]);
                        } else {
                            mb.store8(addr, args[2]);
                        }
                        mb
                    }
                    // Store at an unknown address: anything may be
                    // overwritten.
                    None => MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, ByteMap::new()),
                };
                Some(mb.finalize(&mut a.values))
            }
            MLoad => {
                let map = g(0).and_then(|v| a.values.bytemap(v))?;
                let addr = gi(1).and_then(as_mem_addr)?;
                let producer = load32(map, addr)?;
                a.nodes[producer].valuation
            }
            Sha3 => {
                let addr = gi(1).and_then(as_mem_addr)?;
                let size = gi(2).filter(|s| s.bits() <= 64)?;
                let map = g(0).and_then(|v| a.values.bytemap(v))?;
                let run = load_region(map, addr, size.low_u64())?;
                let digest_args: ArgValues =
                    run.iter().map(|&r| a.nodes[r].valuation).collect();
                let hash = plain_hash(ValOp::Sha3Digest, avsh);
                Some(a.values.intern(ValuationData {
                    node: n,
                    op: ValOp::Sha3Digest,
                    args: digest_args,
                    args_hash: avsh,
                    hash,
                    no_value: false,
                    origin: n,
                    possible_values: None,
                    bytemap: None,
                }))
            }
            Call | CallCode => Some(self.clobber_return_area(a, n, op, avs, avsh, 6, 7)),
            DelegateCall | StaticCall => Some(self.clobber_return_area(a, n, op, avs, avsh, 5, 6)),
            CodeCopy => {
                let mb = match gi(1).and_then(as_mem_addr) {
                    Some(addr) => {
                        let map = g(0)
                            .and_then(|v| a.values.bytemap(v))
                            .cloned()
                            .unwrap_or_default();
                        let mut mb =
                            MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, map);
                        let len = gi(3).and_then(|l| (l.bits() <= 64).then(|| l.low_u64()));
                        mb.clear_region(addr, len);
                        mb
                    }
                    None => MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, ByteMap::new()),
                };
                Some(mb.finalize(&mut a.values))
            }
            // Remaining memory writers clobber everything.
            _ if op.writes_memory() => {
                let mb =
                    MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, ByteMap::new());
                Some(mb.finalize(&mut a.values))
            }
            _ => None,
        }
    }

    /// Calls keep the incoming memory except for the return area, which the
    /// callee overwrites; an unknown return area clobbers everything.
    fn clobber_return_area(
        &mut self,
        a: &mut Analysis,
        n: NodeId,
        op: Opcode,
        avs: &ArgValues,
        avsh: u64,
        addr_idx: usize,
        len_idx: usize,
    ) -> Value {
        let addr = avs
            .get(addr_idx)
            .copied()
            .flatten()
            .and_then(Value::as_int)
            .and_then(as_mem_addr);
        let len = avs
            .get(len_idx)
            .copied()
            .flatten()
            .and_then(Value::as_int)
            .filter(|l| l.bits() <= 64);
        let mb = match (addr, len) {
            (Some(addr), Some(len)) => {
                let map = avs
                    .first()
                    .copied()
                    .flatten()
                    .and_then(|v| a.values.bytemap(v))
                    .cloned()
                    .unwrap_or_default();
                let mut mb = MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, map);
                mb.clear_region(addr, Some(len.low_u64()));
                mb
            }
            _ => MempadBuilder::new(n, ValOp::Op(op), avs.clone(), avsh, true, ByteMap::new()),
        };
        mb.finalize(&mut a.values)
    }

    /// Revise the CFG around a jump whose arguments (target, and for `JUMPI`
    /// the guard) are resolved. Every edge change requeues the affected
    /// successor's phis. A folded target also queues a skip check for the
    /// block.
    fn jump_update(
        &mut self,
        a: &mut Analysis,
        wl: &mut Worklist,
        n: NodeId,
        op: Opcode,
        avs: &ArgValues,
    ) {
        let b = a.nodes[n].block;
        if a.blocks[b].skip {
            return;
        }
        let mut can_jump = true;
        if op == Opcode::JumpI {
            if let Some(Value::Int(guard)) = avs[1] {
                if guard.is_zero() {
                    can_jump = false;
                    if self.cfg.certain_branch_pruning {
                        let stale: Vec<_> = a.blocks[b].jump_edges.iter().copied().collect();
                        for b2 in stale {
                            debug!(block = ?b, target = ?b2, "branch never taken");
                            a.remove_jump_edge(b, b2);
                            self.edge_changed(a, wl, b2);
                        }
                    }
                } else if self.cfg.certain_branch_pruning {
                    if let Some(b2) = a.remove_fallthrough_edge(b) {
                        debug!(block = ?b, "branch always taken");
                        self.edge_changed(a, wl, b2);
                    }
                }
            }
        }
        if can_jump && (self.cfg.speculate_jump_edges || self.cfg.refine_jump_edges) {
            let target = a.nodes[n].args[0];
            let dsts = a.some_possible_values(target);
            if self.cfg.speculate_jump_edges {
                for &d in &dsts {
                    if d.bits() <= 32 {
                        if let Some(b2) = a.add_jump_to(b, d.low_u32()) {
                            debug!(block = ?b, target = ?b2, "jump edge discovered");
                            self.edge_changed(a, wl, b2);
                        }
                    }
                }
            }
            if self.cfg.refine_jump_edges {
                let stale: Vec<_> = a.blocks[b]
                    .jump_edges
                    .iter()
                    .copied()
                    .filter(|&j| !dsts.contains(&U256::from(a.blocks[j].offset)))
                    .collect();
                for b2 in stale {
                    debug!(block = ?b, target = ?b2, "jump target no longer possible");
                    a.remove_jump_edge(b, b2);
                    self.edge_changed(a, wl, b2);
                }
            }
        }
        if matches!(avs[0], Some(Value::Int(_))) {
            wl.push(Update::BlockSkip(b));
        }
    }

    fn edge_changed(&mut self, a: &Analysis, wl: &mut Worklist, b2: BlockId) {
        self.edges_dirty = true;
        for &phi in &a.blocks[b2].phis {
            wl.push(Update::Valuation(phi));
        }
    }
}

fn word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

fn is_neg(x: U256) -> bool {
    x.bit(255)
}

fn twos_neg(x: U256) -> U256 {
    (!x).overflowing_add(U256::one()).0
}

fn s_abs(x: U256) -> U256 {
    if is_neg(x) {
        twos_neg(x)
    } else {
        x
    }
}

fn slt(x: U256, y: U256) -> bool {
    match (is_neg(x), is_neg(y)) {
        (true, false) => true,
        (false, true) => false,
        // Same sign: two's complement preserves order.
        _ => x < y,
    }
}

/// Truncated signed division; `MIN / -1` wraps back to `MIN`. `y` is
/// nonzero.
fn sdiv(x: U256, y: U256) -> U256 {
    let min = U256::one() << 255;
    if x == min && y == U256::MAX {
        return min;
    }
    let q = s_abs(x).checked_div(s_abs(y)).unwrap_or_default();
    if is_neg(x) != is_neg(y) {
        twos_neg(q)
    } else {
        q
    }
}

/// Signed remainder, taking the dividend's sign. `y` is nonzero.
fn smod(x: U256, y: U256) -> U256 {
    let r = s_abs(x).checked_rem(s_abs(y)).unwrap_or_default();
    if is_neg(x) {
        twos_neg(r)
    } else {
        r
    }
}

fn u512_low(x: U512) -> U256 {
    let mut limbs = [0u64; 4];
    limbs.copy_from_slice(&x.0[..4]);
    primitive_types::U256(limbs)
}
