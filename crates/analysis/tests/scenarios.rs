//! End-to-end runs over small bytecode programs.

use evmflow_analysis::{
    mark_instructions, optimize, Analysis, AnalysisConfig, JumpOracle, NodeId, NodeKind, Value,
};
use evmflow_asm::{disassemble, Opcode, U256};

fn run(code: &[u8]) -> Analysis {
    let mut a = Analysis::analyze(&disassemble(code), AnalysisConfig::default(), None);
    optimize(&mut a);
    a
}

fn find_node(a: &Analysis, op: Opcode) -> NodeId {
    a.block_ids()
        .flat_map(|b| a.block(b).ns.iter().copied())
        .find(|&n| a.node(n).op() == op)
        .unwrap_or_else(|| panic!("no {op} node"))
}

#[test]
fn constant_folded_branch_is_pruned() {
    // PUSH1 0; PUSH1 5; PUSH1 3; ADD; JUMPI; JUMPDEST; STOP
    //
    // The target folds to 8 and the guard to 0: the branch is never taken,
    // so only the fallthrough survives.
    let a = run(&[0x60, 0x00, 0x60, 0x05, 0x60, 0x03, 0x01, 0x57, 0x5b, 0x00]);

    let add = find_node(&a, Opcode::Add);
    assert_eq!(a.node(add).valuation, Some(Value::Int(8.into())));
    assert_eq!(a.node(add).annot.as_deref(), Some("#8"));

    let blocks: Vec<_> = a.block_ids().collect();
    assert_eq!(a.live_blocks().count(), 2);
    assert!(a.block(blocks[0]).jump_edges.is_empty());
    assert_eq!(a.block(blocks[0]).fallthrough.expand(), Some(blocks[1]));
}

#[test]
fn taken_branch_drops_fallthrough() {
    // PUSH1 1; PUSH1 6; JUMPI; STOP; JUMPDEST; STOP
    let a = run(&[0x60, 0x01, 0x60, 0x06, 0x57, 0x00, 0x5b, 0x00]);
    let blocks: Vec<_> = a.block_ids().collect();
    let b0 = blocks[0];
    // Always taken: fallthrough removed, jump edge to the JUMPDEST kept.
    assert!(a.block(b0).fallthrough.is_none());
    assert_eq!(a.block(b0).jump_edges.len(), 1);
    // The fallthrough STOP block became unreachable and was killed.
    assert!(a.block(blocks[1]).skip);
    assert_eq!(a.live_blocks().count(), 2);
}

#[test]
fn branch_onto_its_own_fallthrough_stays_connected() {
    // PUSH1 1; PUSH1 5; JUMPI; JUMPDEST; STOP
    //
    // Taken or not, execution reaches the JUMPDEST block. Pruning the
    // fallthrough of the always-taken branch must leave the jump edge in
    // its place.
    let a = run(&[0x60, 0x01, 0x60, 0x05, 0x57, 0x5b, 0x00]);
    let blocks: Vec<_> = a.block_ids().collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(a.live_blocks().count(), 2);
    assert!(a.block(blocks[0]).jump_edges.contains(&blocks[1]));
    assert_eq!(a.block(blocks[1]).in_edges, vec![blocks[0]]);
}

#[test]
fn loop_reaches_fixpoint_with_a_phi() {
    // PUSH1 0; JUMPDEST; PUSH1 1; ADD; PUSH1 2; JUMP
    //
    // A counter loop: the loop block consumes the counter from below its
    // own stack, so a stack phi merges the entry 0 with the incremented
    // value flowing around the back edge.
    let a = run(&[0x60, 0x00, 0x5b, 0x60, 0x01, 0x01, 0x60, 0x02, 0x56]);

    let blocks: Vec<_> = a.block_ids().collect();
    assert_eq!(blocks.len(), 2);
    let b1 = blocks[1];
    assert!(a.block(b1).jump_edges.contains(&b1), "self loop linked");
    assert_eq!(a.block(b1).in_edges.len(), 2);

    let phi = a.block(b1).phis[0];
    assert!(matches!(a.node(phi).kind, NodeKind::StackPhi { sp: -1 }));
    assert_eq!(a.node(phi).args.len(), 2);
    let Some(Value::Sym(id, _)) = a.node(phi).valuation else {
        panic!("phi did not resolve symbolically");
    };
    // Concrete words observed flowing through the phi: the entry 0, and
    // the 1 from the iteration where the increment transiently folded.
    // The set only ever grows, which is what lets the loop converge.
    assert_eq!(
        a.values().data(id).possible_values.as_deref(),
        Some(&[U256::zero(), U256::one()][..])
    );
    // The increment never folds.
    let add = find_node(&a, Opcode::Add);
    assert!(matches!(a.node(add).valuation, Some(Value::Sym(..))));
}

#[test]
fn phi_with_one_distinct_input_is_forwarded() {
    // PUSH1 3; PUSH1 0; CALLDATALOAD; PUSH1 14; JUMPI;
    // POP; PUSH1 4; PUSH1 14; JUMP;
    // JUMPDEST; POP; STOP
    let code = [
        0x60, 0x03, 0x60, 0x00, 0x35, 0x60, 0x0e, 0x57, 0x50, 0x60, 0x04, 0x60, 0x0e, 0x56, 0x5b,
        0x50, 0x00,
    ];
    let a = run(&code);
    let blocks: Vec<_> = a.block_ids().collect();
    assert_eq!(blocks.len(), 3);
    let (b1, b2) = (blocks[1], blocks[2]);

    // The middle block pops the 3 from its single predecessor: its phi
    // collapses to the incoming constant.
    let phi1 = a.block(b1).phis[0];
    assert_eq!(a.node(phi1).valuation, Some(Value::Int(3.into())));

    // The merge block sees 3 or 4 depending on the unknown guard.
    let phi2 = a.block(b2).phis[0];
    let Some(Value::Sym(id, _)) = a.node(phi2).valuation else {
        panic!("merge phi folded unexpectedly");
    };
    let pv = a.values().data(id).possible_values.as_deref().unwrap();
    assert_eq!(pv, &[U256::from(3), U256::from(4)]);
    assert_eq!(a.live_blocks().count(), 3);
}

#[test]
fn adding_zero_forwards_the_operand() {
    // PUSH1 0; CALLDATALOAD; PUSH1 0; ADD; POP; STOP
    let a = run(&[0x60, 0x00, 0x35, 0x60, 0x00, 0x01, 0x50, 0x00]);
    let cdl = find_node(&a, Opcode::CallDataLoad);
    let add = find_node(&a, Opcode::Add);
    // x + 0 is x: the sum shares the operand's symbolic valuation.
    assert!(matches!(a.node(cdl).valuation, Some(Value::Sym(..))));
    assert_eq!(a.node(add).valuation, a.node(cdl).valuation);
}

#[test]
fn multiplying_by_zero_folds_to_zero() {
    // PUSH1 0; CALLDATALOAD; PUSH1 0; MUL; POP; STOP
    //
    // The product folds even though one operand is opaque.
    let a = run(&[0x60, 0x00, 0x35, 0x60, 0x00, 0x02, 0x50, 0x00]);
    let mul = find_node(&a, Opcode::Mul);
    assert_eq!(a.node(mul).valuation, Some(Value::Int(U256::zero())));
    assert_eq!(a.node(mul).annot.as_deref(), Some("#0"));
}

#[test]
fn exp_with_zero_exponent_folds_to_one() {
    // PUSH1 0; PUSH1 0; EXP; POP; STOP
    let a = run(&[0x60, 0x00, 0x60, 0x00, 0x0a, 0x50, 0x00]);
    let exp = find_node(&a, Opcode::Exp);
    assert_eq!(a.node(exp).valuation, Some(Value::Int(U256::one())));
}

#[test]
fn skipped_blocks_stay_skipped() {
    // PUSH1 1; PUSH1 6; JUMPI; STOP; JUMPDEST; STOP
    let code = [0x60, 0x01, 0x60, 0x06, 0x57, 0x00, 0x5b, 0x00];
    let mut a = Analysis::analyze(&disassemble(&code), AnalysisConfig::default(), None);
    optimize(&mut a);
    let skipped: Vec<_> = a.block_ids().map(|b| a.block(b).skip).collect();
    assert_eq!(skipped, vec![false, true, false]);
    // Re-running refines nothing here and must never revive a block.
    optimize(&mut a);
    let again: Vec<_> = a.block_ids().map(|b| a.block(b).skip).collect();
    assert_eq!(again, skipped);
}

#[test]
fn store_then_load_folds_through_memory() {
    // PUSH1 0x2a; PUSH1 0x40; MSTORE; PUSH1 0x40; MLOAD; STOP
    let a = run(&[0x60, 0x2a, 0x60, 0x40, 0x52, 0x60, 0x40, 0x51, 0x00]);
    let mload = find_node(&a, Opcode::MLoad);
    assert_eq!(a.node(mload).valuation, Some(Value::Int(0x2a.into())));
}

#[test]
fn clobbered_word_stays_opaque() {
    // PUSH1 0x2a; PUSH1 0x40; MSTORE; PUSH1 0x99; PUSH1 0x50; MSTORE8;
    // PUSH1 0x40; MLOAD; STOP
    //
    // The byte store lands inside the 32-byte word, so the load spans two
    // producers and must not fold.
    let a = run(&[
        0x60, 0x2a, 0x60, 0x40, 0x52, 0x60, 0x99, 0x60, 0x50, 0x53, 0x60, 0x40, 0x51, 0x00,
    ]);
    let mload = find_node(&a, Opcode::MLoad);
    assert!(matches!(a.node(mload).valuation, Some(Value::Sym(..))));
}

#[test]
fn oracle_keeps_unresolved_jumps_alive() {
    // PUSH1 0; CALLDATALOAD; JUMP; JUMPDEST; STOP
    let code = [0x60, 0x00, 0x35, 0x56, 0x5b, 0x00];

    // Speculatively, the jump target never folds: the analysis gives up on
    // the block's successors and the JUMPDEST block dies.
    let mut free = Analysis::analyze(&disassemble(&code), AnalysisConfig::default(), None);
    optimize(&mut free);
    let blocks: Vec<_> = free.block_ids().collect();
    assert!(free.block(blocks[1]).skip);
    assert!(!free.block(blocks[0]).skip, "entry is never killed");

    // With the oracle the edge is ground truth and both blocks stay.
    let oracle = JumpOracle::new(vec![(3, 4)]);
    let mut a = Analysis::analyze(&disassemble(&code), AnalysisConfig::default(), Some(&oracle));
    optimize(&mut a);
    let blocks: Vec<_> = a.block_ids().collect();
    assert_eq!(a.live_blocks().count(), 2);
    assert!(a.block(blocks[0]).jump_edges.contains(&blocks[1]));
}

#[test]
fn skipping_propagates_to_predecessors() {
    // PUSH1 3; JUMP; JUMPDEST; PUSH1 7; JUMP; JUMPDEST; PUSH1 0; PUSH1 0;
    // REVERT
    //
    // With rare-block skipping on, the REVERT block starts skipped and the
    // whole chain of blocks that only reach it follows.
    let code = [
        0x60, 0x03, 0x56, 0x5b, 0x60, 0x07, 0x56, 0x5b, 0x60, 0x00, 0x60, 0x00, 0xfd,
    ];
    let mut a = Analysis::analyze(&disassemble(&code), AnalysisConfig::with_skip(), None);
    optimize(&mut a);
    assert_eq!(a.live_blocks().count(), 0);
}

#[test]
fn deep_digging_engages_loop_breakers() {
    // PUSH1 1; JUMPDEST; POP x95; STOP
    //
    // The second block consumes 95 slots below its entry: depths down to
    // -90 get ordinary stack phis, deeper ones loop breakers.
    let mut code = vec![0x60, 0x01, 0x5b];
    code.extend(std::iter::repeat(0x50).take(95));
    code.push(0x00);
    let a = run(&code);

    let blocks: Vec<_> = a.block_ids().collect();
    let b1 = blocks[1];
    let mut stack_phis = 0;
    let mut breakers = 0;
    for &phi in &a.block(b1).phis {
        match a.node(phi).kind {
            NodeKind::StackPhi { sp } => {
                assert!(sp >= -90);
                stack_phis += 1;
            }
            NodeKind::LoopBreakerPhi { sp } => {
                assert!(sp < -90);
                breakers += 1;
            }
            _ => panic!("unexpected phi kind"),
        }
    }
    assert_eq!(stack_phis, 90);
    assert_eq!(breakers, 5);
}

#[test]
fn marking_walks_argument_trees() {
    let mut a = run(&[0x60, 0x05, 0x60, 0x03, 0x01, 0x00]);
    let add = find_node(&a, Opcode::Add);
    mark_instructions(&mut a, [add]);
    assert!(a.node(add).marked);
    for &arg in &a.node(add).args.clone() {
        assert!(a.node(arg).marked);
    }
}

#[test]
#[should_panic(expected = "did not converge")]
fn exhausted_update_budget_is_fatal() {
    let code = [0x60, 0x05, 0x60, 0x03, 0x01, 0x00];
    let config = AnalysisConfig {
        max_updates: 1,
        ..AnalysisConfig::default()
    };
    let mut a = Analysis::analyze(&disassemble(&code), config, None);
    optimize(&mut a);
}
