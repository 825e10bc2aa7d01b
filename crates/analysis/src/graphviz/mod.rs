//! Graphviz rendering of the analyzed CFG.

use std::io;

use crate::analysis::Analysis;

mod block;
mod flow;

use flow::FlowGraph;

/// Render the live part of the CFG as a dot graph.
pub fn render_to<W: io::Write>(analysis: &Analysis, output: &mut W) -> io::Result<()> {
    let graph = FlowGraph::new(analysis);
    dot2::render(&graph, output).map_err(|err| match err {
        dot2::Error::Io(err) => err,
        _ => panic!("invalid graphviz id"),
    })
}

#[cfg(test)]
mod test {
    use evmflow_asm::disassemble;

    use super::*;
    use crate::config::AnalysisConfig;
    use crate::optim::optimize;

    #[test]
    fn renders_blocks_and_edges() {
        // PUSH1 5; PUSH1 6; JUMP; STOP; JUMPDEST; STOP
        let code = [0x60, 0x05, 0x60, 0x06, 0x56, 0x00, 0x5b, 0x00];
        let mut a = Analysis::analyze(&disassemble(&code), AnalysisConfig::default(), None);
        optimize(&mut a);

        let mut out = Vec::new();
        render_to(&a, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("digraph evmflow {"), "{text}");
        assert!(text.contains("block_0["), "{text}");
        assert!(text.contains("block_6["), "{text}");
        assert!(text.contains("block_0 -> block_6[label=\"jump\"]"), "{text}");
        // The folded jump target shows up in the block body.
        assert!(text.contains("JUMP"), "{text}");
        // The unreachable STOP block at 5 is not rendered.
        assert!(!text.contains("block_5["), "{text}");
    }
}
