//! EVM opcode model: a closed enum over the instruction set plus the
//! stack/memory metadata the analyzer relies on.
//!
//! The regular families (`PUSH1..=PUSH32`, `DUP1..=DUP16`, `SWAP1..=SWAP16`,
//! `LOG0..=LOG4`) are payload variants so metadata stays a handful of match
//! arms instead of a few hundred.

use core::fmt;

/// An EVM opcode, plus two pseudo-opcodes (`Dummy`, `Phi`) that exist only
/// inside the analysis and are never produced by decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    Sdiv,
    Mod,
    Smod,
    AddMod,
    MulMod,
    Exp,
    SignExtend,
    Lt,
    Gt,
    Slt,
    Sgt,
    Eq,
    IsZero,
    And,
    Or,
    Xor,
    Not,
    Byte,
    Shl,
    Shr,
    Sar,
    Sha3,
    Address,
    Balance,
    Origin,
    Caller,
    CallValue,
    CallDataLoad,
    CallDataSize,
    CallDataCopy,
    CodeSize,
    CodeCopy,
    GasPrice,
    ExtCodeSize,
    ExtCodeCopy,
    ReturnDataSize,
    ReturnDataCopy,
    ExtCodeHash,
    BlockHash,
    Coinbase,
    Timestamp,
    Number,
    Difficulty,
    GasLimit,
    ChainId,
    SelfBalance,
    Pop,
    MLoad,
    MStore,
    MStore8,
    SLoad,
    SStore,
    Jump,
    JumpI,
    Pc,
    MSize,
    Gas,
    JumpDest,
    /// `PUSHn`, `n` in `1..=32`.
    Push(u8),
    /// `DUPn`, `n` in `1..=16`.
    Dup(u8),
    /// `SWAPn`, `n` in `1..=16`.
    Swap(u8),
    /// `LOGn`, `n` in `0..=4`.
    Log(u8),
    Create,
    Call,
    CallCode,
    Return,
    DelegateCall,
    Create2,
    StaticCall,
    Revert,
    Invalid,
    SelfDestruct,
    /// Analysis placeholder that produces an opaque value.
    Dummy,
    /// Analysis phi pseudo-instruction.
    Phi,
}

impl Opcode {
    /// Decode a raw opcode byte. Returns `None` for unassigned bytes; the
    /// EVM treats those as `INVALID`, which is what [`crate::disassemble`]
    /// substitutes.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x00 => Stop,
            0x01 => Add,
            0x02 => Mul,
            0x03 => Sub,
            0x04 => Div,
            0x05 => Sdiv,
            0x06 => Mod,
            0x07 => Smod,
            0x08 => AddMod,
            0x09 => MulMod,
            0x0a => Exp,
            0x0b => SignExtend,
            0x10 => Lt,
            0x11 => Gt,
            0x12 => Slt,
            0x13 => Sgt,
            0x14 => Eq,
            0x15 => IsZero,
            0x16 => And,
            0x17 => Or,
            0x18 => Xor,
            0x19 => Not,
            0x1a => Byte,
            0x1b => Shl,
            0x1c => Shr,
            0x1d => Sar,
            0x20 => Sha3,
            0x30 => Address,
            0x31 => Balance,
            0x32 => Origin,
            0x33 => Caller,
            0x34 => CallValue,
            0x35 => CallDataLoad,
            0x36 => CallDataSize,
            0x37 => CallDataCopy,
            0x38 => CodeSize,
            0x39 => CodeCopy,
            0x3a => GasPrice,
            0x3b => ExtCodeSize,
            0x3c => ExtCodeCopy,
            0x3d => ReturnDataSize,
            0x3e => ReturnDataCopy,
            0x3f => ExtCodeHash,
            0x40 => BlockHash,
            0x41 => Coinbase,
            0x42 => Timestamp,
            0x43 => Number,
            0x44 => Difficulty,
            0x45 => GasLimit,
            0x46 => ChainId,
            0x47 => SelfBalance,
            0x50 => Pop,
            0x51 => MLoad,
            0x52 => MStore,
            0x53 => MStore8,
            0x54 => SLoad,
            0x55 => SStore,
            0x56 => Jump,
            0x57 => JumpI,
            0x58 => Pc,
            0x59 => MSize,
            0x5a => Gas,
            0x5b => JumpDest,
            0x60..=0x7f => Push(byte - 0x5f),
            0x80..=0x8f => Dup(byte - 0x7f),
            0x90..=0x9f => Swap(byte - 0x8f),
            0xa0..=0xa4 => Log(byte - 0xa0),
            0xf0 => Create,
            0xf1 => Call,
            0xf2 => CallCode,
            0xf3 => Return,
            0xf4 => DelegateCall,
            0xf5 => Create2,
            0xfa => StaticCall,
            0xfd => Revert,
            0xfe => Invalid,
            0xff => SelfDestruct,
            _ => return None,
        };
        Some(op)
    }

    /// Number of stack operands consumed (yellowpaper δ).
    pub fn pops(self) -> usize {
        use Opcode::*;
        match self {
            Stop | Address | Origin | Caller | CallValue | CallDataSize | CodeSize | GasPrice
            | ReturnDataSize | Coinbase | Timestamp | Number | Difficulty | GasLimit | ChainId
            | SelfBalance | Pc | MSize | Gas | JumpDest | Push(_) | Invalid | Dummy | Phi => 0,
            IsZero | Not | Balance | CallDataLoad | ExtCodeSize | ExtCodeHash | BlockHash | Pop
            | MLoad | SLoad | Jump | SelfDestruct => 1,
            Add | Mul | Sub | Div | Sdiv | Mod | Smod | Exp | SignExtend | Lt | Gt | Slt | Sgt
            | Eq | And | Or | Xor | Byte | Shl | Shr | Sar | Sha3 | MStore | MStore8 | SStore
            | JumpI | Return | Revert => 2,
            AddMod | MulMod | CallDataCopy | CodeCopy | ReturnDataCopy | Create => 3,
            ExtCodeCopy | Create2 => 4,
            DelegateCall | StaticCall => 6,
            Call | CallCode => 7,
            Dup(n) => n as usize,
            Swap(n) => n as usize + 1,
            Log(n) => n as usize + 2,
        }
    }

    /// Number of stack results produced (yellowpaper α). At most 1 outside
    /// the dup/swap shuffle families, which the builder never treats as
    /// value producers.
    pub fn pushes(self) -> usize {
        use Opcode::*;
        match self {
            Stop | CallDataCopy | CodeCopy | ExtCodeCopy | ReturnDataCopy | Pop | MStore
            | MStore8 | SStore | Jump | JumpI | JumpDest | Log(_) | Return | Revert | Invalid
            | SelfDestruct | Phi => 0,
            Dup(n) => n as usize + 1,
            Swap(n) => n as usize + 1,
            _ => 1,
        }
    }

    /// Encoded size in bytes (1, or 1+n for `PUSHn`).
    pub fn size(self) -> u32 {
        match self {
            Opcode::Push(n) => 1 + n as u32,
            _ => 1,
        }
    }

    pub fn is_push(self) -> bool {
        matches!(self, Opcode::Push(_))
    }

    pub fn is_pop(self) -> bool {
        self == Opcode::Pop
    }

    pub fn is_dup(self) -> bool {
        matches!(self, Opcode::Dup(_))
    }

    pub fn is_swap(self) -> bool {
        matches!(self, Opcode::Swap(_))
    }

    pub fn is_jumpdest(self) -> bool {
        self == Opcode::JumpDest
    }

    /// Opcodes that rarely appear on hot paths; blocks containing them can
    /// be excluded wholesale when the caller allows it.
    pub fn is_rare(self) -> bool {
        use Opcode::*;
        matches!(self, Create | Create2 | Invalid | Revert | SelfDestruct)
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpI)
    }

    pub fn is_cond_jump(self) -> bool {
        self == Opcode::JumpI
    }

    /// Ends a basic block.
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Invalid | Jump | JumpI | Return | Revert | SelfDestruct | Stop
        )
    }

    /// Unconditionally leaves the contract; such blocks are never skipped.
    pub fn is_final(self) -> bool {
        use Opcode::*;
        matches!(self, Invalid | Return | Revert | SelfDestruct | Stop)
    }

    pub fn stops_fallthrough(self) -> bool {
        use Opcode::*;
        matches!(self, Invalid | Jump | Return | Revert | SelfDestruct | Stop)
    }

    pub fn reads_memory(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Call | CallCode | Create | DelegateCall | MLoad | Return | Sha3 | StaticCall | Log(_)
        )
    }

    pub fn writes_memory(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Call | CallCode | CallDataCopy | CodeCopy | DelegateCall | ExtCodeCopy | MStore
                | MStore8 | ReturnDataCopy | StaticCall
        )
    }

    /// The instruction takes an implicit leading memory argument.
    pub fn needs_memory(self) -> bool {
        self.reads_memory() || self.writes_memory()
    }

    /// First two stack operands commute; the optimizer canonicalizes their
    /// order before folding.
    pub fn commutes_first_two(self) -> bool {
        use Opcode::*;
        matches!(self, Add | AddMod | And | Eq | Mul | MulMod | Or | Xor)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Opcode::*;
        match *self {
            Push(n) => return write!(f, "PUSH{n}"),
            Dup(n) => return write!(f, "DUP{n}"),
            Swap(n) => return write!(f, "SWAP{n}"),
            Log(n) => return write!(f, "LOG{n}"),
            _ => {}
        }
        let name = match *self {
            Stop => "STOP",
            Add => "ADD",
            Mul => "MUL",
            Sub => "SUB",
            Div => "DIV",
            Sdiv => "SDIV",
            Mod => "MOD",
            Smod => "SMOD",
            AddMod => "ADDMOD",
            MulMod => "MULMOD",
            Exp => "EXP",
            SignExtend => "SIGNEXTEND",
            Lt => "LT",
            Gt => "GT",
            Slt => "SLT",
            Sgt => "SGT",
            Eq => "EQ",
            IsZero => "ISZERO",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Not => "NOT",
            Byte => "BYTE",
            Shl => "SHL",
            Shr => "SHR",
            Sar => "SAR",
            Sha3 => "SHA3",
            Address => "ADDRESS",
            Balance => "BALANCE",
            Origin => "ORIGIN",
            Caller => "CALLER",
            CallValue => "CALLVALUE",
            CallDataLoad => "CALLDATALOAD",
            CallDataSize => "CALLDATASIZE",
            CallDataCopy => "CALLDATACOPY",
            CodeSize => "CODESIZE",
            CodeCopy => "CODECOPY",
            GasPrice => "GASPRICE",
            ExtCodeSize => "EXTCODESIZE",
            ExtCodeCopy => "EXTCODECOPY",
            ReturnDataSize => "RETURNDATASIZE",
            ReturnDataCopy => "RETURNDATACOPY",
            ExtCodeHash => "EXTCODEHASH",
            BlockHash => "BLOCKHASH",
            Coinbase => "COINBASE",
            Timestamp => "TIMESTAMP",
            Number => "NUMBER",
            Difficulty => "DIFFICULTY",
            GasLimit => "GASLIMIT",
            ChainId => "CHAINID",
            SelfBalance => "SELFBALANCE",
            Pop => "POP",
            MLoad => "MLOAD",
            MStore => "MSTORE",
            MStore8 => "MSTORE8",
            SLoad => "SLOAD",
            SStore => "SSTORE",
            Jump => "JUMP",
            JumpI => "JUMPI",
            Pc => "PC",
            MSize => "MSIZE",
            Gas => "GAS",
            JumpDest => "JUMPDEST",
            Create => "CREATE",
            Call => "CALL",
            CallCode => "CALLCODE",
            Return => "RETURN",
            DelegateCall => "DELEGATECALL",
            Create2 => "CREATE2",
            StaticCall => "STATICCALL",
            Revert => "REVERT",
            Invalid => "INVALID",
            SelfDestruct => "SELFDESTRUCT",
            Dummy => "DUMMY",
            Phi => "PHI",
            Push(_) | Dup(_) | Swap(_) | Log(_) => unreachable!(),
        };
        f.write_str(name)
    }
}
