//! Abstract interpretation of EVM bytecode.
//!
//! [`Analysis::analyze`] splits an instruction stream into basic blocks,
//! runs each against a symbolic operand stack to build an SSA-form value
//! graph with on-demand phis, and links the CFG. [`optimize`] then drives a
//! worklist to a fixed point: folding constants, resolving jump targets,
//! tracking memory contents byte by byte, and pruning blocks proven
//! unreachable.

pub mod analysis;
pub mod block;
pub mod builder;
pub mod config;
pub mod graphviz;
pub mod mempad;
pub mod node;
pub mod optim;
pub mod stack;
pub mod valuation;

pub use analysis::Analysis;
pub use block::{BlockData, BlockId};
pub use builder::JumpOracle;
pub use config::AnalysisConfig;
pub use graphviz::render_to;
pub use node::{Node, NodeId, NodeKind};
pub use optim::{
    mark_blocks, mark_by_valuation, mark_instructions, optimize, optimize_with, NullObserver,
    OptimizeObserver,
};
pub use valuation::{ValOp, ValuationData, ValuationId, Value, ValueStore};
