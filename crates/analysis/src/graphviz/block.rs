use std::fmt::Write;

use dot2::label;

use crate::analysis::Analysis;
use crate::block::BlockId;

#[derive(Clone, Copy)]
pub(super) struct BlockNode<'a> {
    pub(super) analysis: &'a Analysis,
    pub(super) block: BlockId,
}

impl<'a> BlockNode<'a> {
    pub(super) fn new(analysis: &'a Analysis, block: BlockId) -> Self {
        Self { analysis, block }
    }

    pub(super) fn offset(&self) -> u32 {
        self.analysis.block(self.block).offset
    }

    pub(super) fn label(self) -> label::Text<'static> {
        let a = self.analysis;
        let data = a.block(self.block);

        let mut label = r#"<table border="0" cellborder="1" cellspacing="0">"#.to_string();
        write!(
            &mut label,
            r#"<tr><td bgcolor="gray" align="center" colspan="1">{:#x}..{:#x}</td></tr>"#,
            data.offset, data.end
        )
        .unwrap();

        write!(label, r#"<tr><td align="left" balign="left">"#).unwrap();
        for &n in &data.ns {
            let node = a.node(n);
            let mut line = format!("{}: {}", node.local_id, node.inst.op);
            if let Some(imm) = node.inst.imm {
                write!(&mut line, " {imm:#x}").unwrap();
            }
            if let Some(annot) = &node.annot {
                write!(&mut line, "  {annot}").unwrap();
            }
            write!(label, "{}<br/>", dot2::escape_html(&line)).unwrap();
        }
        write!(label, "</td></tr></table>").unwrap();

        label::Text::HtmlStr(label.into())
    }
}
