pub mod disasm;
pub mod inst;
pub mod opcode;

pub use disasm::{disassemble, disassemble_hex, strip_metadata, DisasmError};
pub use inst::EvmInst;
pub use opcode::Opcode;

pub type U256 = primitive_types::U256;
