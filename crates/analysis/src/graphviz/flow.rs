use dot2::{label::Text, GraphWalk, Id, Labeller, Style};

use super::block::BlockNode;
use crate::analysis::Analysis;

pub(super) struct FlowGraph<'a> {
    analysis: &'a Analysis,
}

impl<'a> FlowGraph<'a> {
    pub(super) fn new(analysis: &'a Analysis) -> Self {
        Self { analysis }
    }

    fn blocks(&self) -> Vec<BlockNode<'a>> {
        self.analysis
            .live_blocks()
            .map(|block| BlockNode::new(self.analysis, block))
            .collect()
    }
}

impl<'a> Labeller<'a> for FlowGraph<'a> {
    type Node = BlockNode<'a>;
    type Edge = FlowEdge<'a>;
    type Subgraph = ();

    fn graph_id(&self) -> dot2::Result<Id<'a>> {
        Id::new("evmflow")
    }

    fn node_id(&self, n: &Self::Node) -> dot2::Result<Id<'a>> {
        Id::new(format!("block_{:x}", n.offset()))
    }

    fn node_shape(&self, _n: &Self::Node) -> Option<Text<'a>> {
        Some(Text::LabelStr("none".into()))
    }

    fn node_label(&'a self, n: &Self::Node) -> dot2::Result<Text<'a>> {
        Ok(n.label())
    }

    fn edge_label(&self, e: &Self::Edge) -> Text<'a> {
        if e.jump {
            Text::LabelStr("jump".into())
        } else {
            Text::LabelStr("".into())
        }
    }

    fn edge_style(&'a self, e: &Self::Edge) -> Style {
        if e.jump {
            Style::None
        } else {
            Style::Dashed
        }
    }
}

impl<'a> GraphWalk<'a> for FlowGraph<'a> {
    type Node = BlockNode<'a>;
    type Edge = FlowEdge<'a>;
    type Subgraph = ();

    fn nodes(&self) -> dot2::Nodes<'a, Self::Node> {
        self.blocks().into()
    }

    fn edges(&'a self) -> dot2::Edges<'a, Self::Edge> {
        let a = self.analysis;
        let mut edges = Vec::new();
        for block in self.blocks() {
            let data = a.block(block.block);
            if let Some(ft) = data.fallthrough.expand() {
                if !a.block(ft).skip {
                    edges.push(FlowEdge {
                        from: block,
                        to: BlockNode::new(a, ft),
                        jump: false,
                    });
                }
            }
            for &dst in &data.jump_edges {
                if !a.block(dst).skip {
                    edges.push(FlowEdge {
                        from: block,
                        to: BlockNode::new(a, dst),
                        jump: true,
                    });
                }
            }
        }
        edges.into()
    }

    fn source(&self, edge: &Self::Edge) -> Self::Node {
        edge.from
    }

    fn target(&self, edge: &Self::Edge) -> Self::Node {
        edge.to
    }
}

#[derive(Clone, Copy)]
pub(super) struct FlowEdge<'a> {
    from: BlockNode<'a>,
    to: BlockNode<'a>,
    jump: bool,
}
