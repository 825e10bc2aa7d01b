//! Hash-consed valuations.
//!
//! A valuation is the abstract value the fixpoint engine attaches to a node:
//! either a fully folded integer or a symbolic record identified by a 64-bit
//! fingerprint. Two symbolic valuations are equal exactly when their
//! fingerprints are equal, so equality tests and the interner are O(1) and a
//! fingerprint collision silently merges two values. That trade is deliberate;
//! the engine tolerates the resulting (bounded) imprecision.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};
use evmflow_asm::{Opcode, U256};
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::mempad::ByteMap;
use crate::node::NodeId;

/// An opaque handle to an interned [`ValuationData`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValuationId(pub u32);
entity_impl!(ValuationId, "val");

/// A resolved abstract value.
///
/// `Sym` carries the fingerprint inline so equality never touches the store.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Int(U256),
    Sym(ValuationId, u64),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Sym(_, a), Value::Sym(_, b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    pub fn as_int(self) -> Option<U256> {
        match self {
            Value::Int(x) => Some(x),
            Value::Sym(..) => None,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// The fingerprint used wherever this value appears as an argument.
    pub fn key_hash(self) -> u64 {
        match self {
            Value::Int(x) => int_hash(x),
            Value::Sym(_, h) => h,
        }
    }
}

/// What produced a symbolic valuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValOp {
    Op(Opcode),
    Phi,
    /// `SHA3` over a region with known producers; the args are the producer
    /// run's valuations.
    Sha3Digest,
}

impl fmt::Display for ValOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValOp::Op(op) => write!(f, "{op}"),
            ValOp::Phi => f.write_str("PHI"),
            ValOp::Sha3Digest => f.write_str("SHA3i"),
        }
    }
}

pub type ArgValues = SmallVec<[Option<Value>; 2]>;

#[derive(Debug, Clone)]
pub struct ValuationData {
    /// The node this valuation was first computed for.
    pub node: NodeId,
    pub op: ValOp,
    /// Argument valuations at computation time. `None` marks an unresolved
    /// argument; only phis carry those.
    pub args: ArgValues,
    pub args_hash: u64,
    /// The identity fingerprint.
    pub hash: u64,
    /// The producing instruction pushes nothing; the valuation exists for
    /// propagation only.
    pub no_value: bool,
    /// Origin node, preserved across forwarding. Phi cycle detection keys
    /// on this.
    pub origin: NodeId,
    /// For phi valuations: the sorted set of integers observed among the
    /// arguments, transitively.
    pub possible_values: Option<Vec<U256>>,
    /// For memory valuations: the abstract byte map.
    pub bytemap: Option<ByteMap>,
}

impl ValuationData {
    pub fn plain(node: NodeId, op: ValOp, args: ArgValues, args_hash: u64, no_value: bool) -> Self {
        Self {
            node,
            op,
            args,
            args_hash,
            hash: plain_hash(op, args_hash),
            no_value,
            origin: node,
            possible_values: None,
            bytemap: None,
        }
    }
}

/// Interner: one [`ValuationId`] per fingerprint.
#[derive(Debug, Default)]
pub struct ValueStore {
    store: PrimaryMap<ValuationId, ValuationData>,
    interned: FxHashMap<u64, ValuationId>,
}

impl ValueStore {
    /// Intern `data`, returning the canonical value for its fingerprint. If
    /// an equal valuation exists, `data` is dropped and the existing id wins.
    pub fn intern(&mut self, data: ValuationData) -> Value {
        let h = data.hash;
        let Self { store, interned } = self;
        let id = *interned.entry(h).or_insert_with(|| store.push(data));
        Value::Sym(id, h)
    }

    pub fn data(&self, id: ValuationId) -> &ValuationData {
        &self.store[id]
    }

    pub fn bytemap(&self, v: Value) -> Option<&ByteMap> {
        match v {
            Value::Sym(id, _) => self.store[id].bytemap.as_ref(),
            Value::Int(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

const TAG_INT: u64 = 1;
const TAG_ARGS: u64 = 2;
const TAG_VAL: u64 = 3;
const TAG_PHI: u64 = 4;
const TAG_MEMPHI: u64 = 5;

/// Fingerprint slot for an unresolved argument.
pub const NONE_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

fn write_u256(h: &mut FxHasher, x: U256) {
    for limb in x.0 {
        h.write_u64(limb);
    }
}

pub fn int_hash(x: U256) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(TAG_INT);
    write_u256(&mut h, x);
    h.finish()
}

pub fn value_hash(av: Option<Value>) -> u64 {
    match av {
        None => NONE_HASH,
        Some(v) => v.key_hash(),
    }
}

pub fn args_hash(avs: &[Option<Value>]) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(TAG_ARGS);
    for &av in avs {
        h.write_u64(value_hash(av));
    }
    h.finish()
}

pub fn plain_hash(op: ValOp, avsh: u64) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(TAG_VAL);
    op.hash(&mut h);
    h.write_u64(avsh);
    h.finish()
}

/// Phi fingerprints depend on the phi node and its possible-value set only,
/// so a refresh that reshuffles arguments without changing the set is a
/// no-op for downstream users.
pub fn phi_hash(node: NodeId, possible: &BTreeSet<U256>) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(TAG_PHI);
    h.write_u64(node.index() as u64);
    for &x in possible {
        write_u256(&mut h, x);
    }
    h.finish()
}

/// Memory-phi fingerprints depend on the owning node and the merged byte
/// map; distinct merge points never alias.
pub fn memphi_hash(node: NodeId, map: &ByteMap) -> u64 {
    let mut h = FxHasher::default();
    h.write_u64(TAG_MEMPHI);
    h.write_u64(node.index() as u64);
    for (&addr, &(n, off)) in map {
        h.write_u64(addr);
        h.write_u64(n.index() as u64);
        h.write_u8(off);
    }
    h.finish()
}

#[cfg(test)]
mod test {
    use smallvec::smallvec;

    use super::*;

    fn node(i: u32) -> NodeId {
        NodeId::new(i as usize)
    }

    #[test]
    fn interning_is_by_fingerprint() {
        let mut store = ValueStore::default();
        let args: ArgValues = smallvec![Some(Value::Int(U256::from(7))), None];
        let avsh = args_hash(&args);

        let a = store.intern(ValuationData::plain(
            node(0),
            ValOp::Op(Opcode::Add),
            args.clone(),
            avsh,
            false,
        ));
        let b = store.intern(ValuationData::plain(
            node(9),
            ValOp::Op(Opcode::Add),
            args.clone(),
            avsh,
            false,
        ));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);

        let c = store.intern(ValuationData::plain(
            node(0),
            ValOp::Op(Opcode::Mul),
            args,
            avsh,
            false,
        ));
        assert_ne!(a, c);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn value_equality() {
        assert_eq!(Value::Int(U256::from(3)), Value::Int(U256::from(3)));
        assert_ne!(Value::Int(U256::from(3)), Value::Int(U256::from(4)));
        // Symbolic equality ignores the id and keys on the fingerprint.
        assert_eq!(
            Value::Sym(ValuationId(0), 42),
            Value::Sym(ValuationId(1), 42)
        );
        assert_ne!(Value::Int(U256::zero()), Value::Sym(ValuationId(0), 0));
    }

    #[test]
    fn phi_fingerprint_tracks_the_set() {
        let mut t = BTreeSet::new();
        t.insert(U256::from(4));
        t.insert(U256::from(9));
        let h1 = phi_hash(node(3), &t);
        // Insertion order is irrelevant.
        let mut t2 = BTreeSet::new();
        t2.insert(U256::from(9));
        t2.insert(U256::from(4));
        assert_eq!(h1, phi_hash(node(3), &t2));

        t.insert(U256::from(11));
        assert_ne!(h1, phi_hash(node(3), &t));
        assert_ne!(h1, phi_hash(node(4), &t2));
    }
}
