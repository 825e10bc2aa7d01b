//! Byte-granular abstract memory.
//!
//! Memory state is a sparse map from byte address to `(producer node, byte
//! index within the producer's 32-byte value)`. Absent keys mean "unknown".
//! Reads succeed only on exact, aligned, single-producer coverage; anything
//! else degrades to an opaque result rather than guessing.

use std::collections::BTreeMap;

use evmflow_asm::U256;

use crate::node::NodeId;
use crate::valuation::{memphi_hash, plain_hash, ArgValues, ValOp, ValuationData, Value, ValueStore};

pub type ByteMap = BTreeMap<u64, (NodeId, u8)>;

/// Clamp a 256-bit address to the map's key space. Addresses past `u64` are
/// unrepresentable in any real execution and are treated as unknown.
pub fn as_mem_addr(x: U256) -> Option<u64> {
    (x.bits() <= 64).then(|| x.low_u64())
}

/// Read a full 32-byte word at `addr`. Succeeds only if all 32 bytes come
/// from one producer, in order, starting at its byte 0.
pub fn load32(map: &ByteMap, addr: u64) -> Option<NodeId> {
    let &(n, off) = map.get(&addr)?;
    if off != 0 {
        return None;
    }
    for i in 1..32u64 {
        if map.get(&addr.checked_add(i)?) != Some(&(n, i as u8)) {
            return None;
        }
    }
    Some(n)
}

/// Read `size` bytes at `addr` as a sequence of whole producer values. Every
/// byte must be present, runs must be contiguous and start at producer byte
/// 0. Returns the producer nodes in address order.
pub fn load_region(map: &ByteMap, addr: u64, size: u64) -> Option<Vec<NodeId>> {
    if size == 0 {
        return Some(Vec::new());
    }
    let end = addr.checked_add(size)?;
    let mut res = Vec::new();
    let mut expected = addr;
    let mut run: Option<(NodeId, u64)> = None;
    for (&a, &(n, off)) in map.range(addr..end) {
        if a != expected {
            return None;
        }
        match run {
            Some((cur, base)) if cur == n && a - base == off as u64 => {}
            _ => {
                if off != 0 {
                    return None;
                }
                res.push(n);
                run = Some((n, a));
            }
        }
        expected = a + 1;
    }
    (expected == end).then_some(res)
}

/// An under-construction memory valuation. Built from one transfer step's
/// effect, then interned exactly once.
#[derive(Debug)]
pub struct MempadBuilder {
    node: NodeId,
    op: ValOp,
    args: ArgValues,
    args_hash: u64,
    no_value: bool,
    map: ByteMap,
}

impl MempadBuilder {
    pub fn new(
        node: NodeId,
        op: ValOp,
        args: ArgValues,
        args_hash: u64,
        no_value: bool,
        map: ByteMap,
    ) -> Self {
        Self {
            node,
            op,
            args,
            args_hash,
            no_value,
            map,
        }
    }

    /// Record a full 32-byte store of `producer` at `addr`.
    pub fn store32(&mut self, addr: u64, producer: NodeId) {
        for i in 0..32u64 {
            let Some(a) = addr.checked_add(i) else {
                break;
            };
            self.map.insert(a, (producer, i as u8));
        }
    }

    /// Record a single-byte store. The producer's low byte lands at `addr`,
    /// recorded as byte 31 of its value.
    pub fn store8(&mut self, addr: u64, producer: NodeId) {
        self.map.insert(addr, (producer, 31));
    }

    /// Forget `len` bytes starting at `addr`; `None` forgets everything from
    /// `addr` up.
    pub fn clear_region(&mut self, addr: u64, len: Option<u64>) {
        match len.and_then(|l| addr.checked_add(l)) {
            Some(end) => {
                let stale: Vec<u64> = self.map.range(addr..end).map(|(&a, _)| a).collect();
                for a in stale {
                    self.map.remove(&a);
                }
            }
            None => {
                let stale: Vec<u64> = self.map.range(addr..).map(|(&a, _)| a).collect();
                for a in stale {
                    self.map.remove(&a);
                }
            }
        }
    }

    /// Replace the map with the pure intersection of the resolved inputs.
    /// Unresolved inputs are ignored; with no resolved input the result is
    /// empty.
    pub fn meet<'a>(&mut self, inputs: impl IntoIterator<Item = Option<&'a ByteMap>>) {
        let mut acc: Option<ByteMap> = None;
        for m in inputs.into_iter().flatten() {
            acc = Some(match acc {
                None => m.clone(),
                Some(prev) => prev
                    .into_iter()
                    .filter(|(a, cell)| m.get(a) == Some(cell))
                    .collect(),
            });
        }
        self.map = acc.unwrap_or_default();
    }

    /// Intern with the ordinary op/args fingerprint.
    pub fn finalize(self, store: &mut ValueStore) -> Value {
        let hash = plain_hash(self.op, self.args_hash);
        self.finalize_with(store, hash)
    }

    /// Intern with a merge-point fingerprint keyed on the owning node and
    /// the map contents.
    pub fn finalize_keyed(self, store: &mut ValueStore) -> Value {
        let hash = memphi_hash(self.node, &self.map);
        self.finalize_with(store, hash)
    }

    fn finalize_with(self, store: &mut ValueStore, hash: u64) -> Value {
        store.intern(ValuationData {
            node: self.node,
            op: self.op,
            args: self.args,
            args_hash: self.args_hash,
            hash,
            no_value: self.no_value,
            origin: self.node,
            possible_values: None,
            bytemap: Some(self.map),
        })
    }
}

#[cfg(test)]
mod test {
    use cranelift_entity::EntityRef;
    use evmflow_asm::Opcode;
    use smallvec::smallvec;

    use super::*;

    fn node(i: u32) -> NodeId {
        NodeId::new(i as usize)
    }

    fn builder(map: ByteMap) -> MempadBuilder {
        MempadBuilder::new(
            node(0),
            ValOp::Op(Opcode::MStore),
            smallvec![],
            0,
            true,
            map,
        )
    }

    #[test]
    fn store_then_load_word() {
        let mut mb = builder(ByteMap::new());
        mb.store32(0x40, node(7));
        assert_eq!(load32(&mb.map, 0x40), Some(node(7)));
        // Misaligned reads fail.
        assert_eq!(load32(&mb.map, 0x41), None);
        assert_eq!(load32(&mb.map, 0x20), None);
    }

    #[test]
    fn byte_store_clobbers_word_read() {
        let mut mb = builder(ByteMap::new());
        mb.store32(0x40, node(7));
        mb.store8(0x50, node(8));
        assert_eq!(load32(&mb.map, 0x40), None);
    }

    #[test]
    fn single_byte_store_is_not_a_whole_value() {
        // The byte is tagged as byte 31 of its producer, so no region read
        // ever mistakes it for the producer's full word.
        let mut mb = builder(ByteMap::new());
        mb.store8(0x10, node(4));
        assert_eq!(load_region(&mb.map, 0x10, 1), None);
        assert_eq!(load32(&mb.map, 0x10), None);
    }

    #[test]
    fn region_load_wants_whole_runs() {
        let mut mb = builder(ByteMap::new());
        mb.store32(0x00, node(1));
        mb.store32(0x20, node(2));
        assert_eq!(load_region(&mb.map, 0x00, 0x40), Some(vec![node(1), node(2)]));
        assert_eq!(load_region(&mb.map, 0x00, 0x20), Some(vec![node(1)]));
        // A gap or a partial producer run fails.
        assert_eq!(load_region(&mb.map, 0x00, 0x41), None);
        assert_eq!(load_region(&mb.map, 0x10, 0x20), None);
        assert_eq!(load_region(&mb.map, 0x00, 0), Some(vec![]));
    }

    #[test]
    fn clearing() {
        let mut mb = builder(ByteMap::new());
        mb.store32(0x00, node(1));
        mb.store32(0x40, node(2));
        mb.clear_region(0x40, Some(0x20));
        assert_eq!(load32(&mb.map, 0x00), Some(node(1)));
        assert_eq!(load32(&mb.map, 0x40), None);

        mb.store32(0x40, node(2));
        mb.clear_region(0x10, None);
        assert!(mb.map.range(0x10..).next().is_none());
        assert!(mb.map.contains_key(&0x0f));
    }

    #[test]
    fn meet_is_intersection_over_resolved_inputs() {
        let mut a = builder(ByteMap::new());
        a.store32(0x00, node(1));
        a.store32(0x20, node(2));
        let mut b = builder(ByteMap::new());
        b.store32(0x20, node(2));
        b.store32(0x40, node(3));

        let mut out = builder(ByteMap::new());
        out.meet([Some(&a.map), None, Some(&b.map)]);
        assert_eq!(load32(&out.map, 0x20), Some(node(2)));
        assert_eq!(load32(&out.map, 0x00), None);
        assert_eq!(load32(&out.map, 0x40), None);

        let mut empty = builder(ByteMap::new());
        empty.meet([None, None]);
        assert!(empty.map.is_empty());
    }
}
