//! Linear-scan disassembly of raw EVM runtime bytecode.

use tracing::{info, warn};

use crate::{EvmInst, Opcode, U256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisasmError {
    #[error("input is not valid hex at byte {0}")]
    InvalidHex(usize),
    #[error("hex input has odd length {0}")]
    OddLength(usize),
}

/// Decode a byte slice into an instruction stream.
///
/// A `PUSHn` whose immediate runs past the end of the code truncates the
/// stream: the prefix decoded so far is returned and a warning is logged.
/// Unassigned opcode bytes decode as `INVALID`, matching EVM execution
/// semantics, so trailing data sections become rare-flagged terminator runs.
pub fn disassemble(code: &[u8]) -> Vec<EvmInst> {
    let mut res = Vec::new();
    let mut i = 0usize;
    while i < code.len() {
        let offset = i as u32;
        let op = Opcode::from_byte(code[i]).unwrap_or(Opcode::Invalid);
        if op.is_push() {
            let size = op.size() as usize;
            if i + size > code.len() {
                warn!(offset, "truncated push immediate; stopping disassembly");
                break;
            }
            let imm = U256::from_big_endian(&code[i + 1..i + size]);
            res.push(EvmInst::with_imm(offset, op, imm));
            i += size;
        } else {
            res.push(EvmInst::new(offset, op));
            i += 1;
        }
    }
    res
}

/// Decode a hex string (optionally `0x`-prefixed, surrounding whitespace
/// ignored).
pub fn disassemble_hex(hex: &str) -> Result<Vec<EvmInst>, DisasmError> {
    let s = hex.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(DisasmError::OddLength(s.len()));
    }
    let mut bytes = Vec::with_capacity(s.len() / 2);
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_digit(chunk[0]).ok_or(DisasmError::InvalidHex(i))?;
        let lo = hex_digit(chunk[1]).ok_or(DisasmError::InvalidHex(i))?;
        bytes.push(hi << 4 | lo);
    }
    Ok(disassemble(&bytes))
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Strip the trailing Solidity metadata blob (its length lives in the last
/// two bytes) when the declared length is plausible.
pub fn strip_metadata(runbin: &[u8]) -> &[u8] {
    if runbin.len() < 2 {
        return runbin;
    }
    let meta_len = 2 + u16::from_be_bytes([runbin[runbin.len() - 2], runbin[runbin.len() - 1]])
        as usize;
    if runbin.len() < meta_len {
        return runbin;
    }
    info!(bytes = meta_len, "removed metadata");
    &runbin[..runbin.len() - meta_len]
}
