use core::fmt;

use crate::{Opcode, U256};

/// A single decoded instruction: byte offset, opcode, and the push payload
/// when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvmInst {
    pub offset: u32,
    pub op: Opcode,
    pub imm: Option<U256>,
}

impl EvmInst {
    pub fn new(offset: u32, op: Opcode) -> Self {
        Self {
            offset,
            op,
            imm: None,
        }
    }

    pub fn with_imm(offset: u32, op: Opcode, imm: U256) -> Self {
        Self {
            offset,
            op,
            imm: Some(imm),
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> u32 {
        self.op.size()
    }

    /// Offset of the next instruction.
    pub fn end(&self) -> u32 {
        self.offset + self.size()
    }

    /// The immediate of a push instruction.
    ///
    /// # Panics
    /// Panics if the instruction is not a push; a push without a payload is
    /// a decoder bug.
    pub fn push_value(&self) -> U256 {
        debug_assert!(self.op.is_push());
        self.imm.expect("push instruction without immediate")
    }
}

impl fmt::Display for EvmInst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.imm {
            Some(imm) => write!(f, "{:#x}: {} {:#x}", self.offset, self.op, imm),
            None => write!(f, "{:#x}: {}", self.offset, self.op),
        }
    }
}
