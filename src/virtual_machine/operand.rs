//! Instruction record layout and decoding.
//!
//! An instruction record is two little-endian 32-bit words. The first is the
//! opcode, compared only for equality. The second packs the operands:
//!
//! ```text
//!  31      24 23  20 19  16 15  12 11   8 7        0
//! +----------+------+------+------+------+----------+
//! | ignored  | kind |  r0  |  r1  |  r2  |   imm    |
//! +----------+------+------+------+------+----------+
//! ```
//!
//! Decoding is total: any 64-bit pattern yields a [`DecodedInstruction`].
//! Unknown opcodes and unknown operand kinds are left for dispatch to judge.

use std::fmt;

/// Size in bytes of one encoded instruction record.
pub const RECORD_SIZE: usize = 8;

const KIND_SHIFT: u32 = 20;
const R0_SHIFT: u32 = 16;
const R1_SHIFT: u32 = 12;
const R2_SHIFT: u32 = 8;
const NIBBLE: u32 = 0xF;
const IMM_MASK: u32 = 0xFF;

/// Index of a register slot as encoded in an operand field (0..=15).
pub type RegisterId = u8;

/// Tag telling whether the source operand is an immediate or a register.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    Unknown = 0,
    Immediate = 1,
    Register = 2,
}

impl OperandKind {
    /// Maps a raw kind nibble to its tag. Anything but 1 and 2 is `Unknown`.
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => OperandKind::Immediate,
            2 => OperandKind::Register,
            _ => OperandKind::Unknown,
        }
    }

    pub const fn to_string(&self) -> &'static str {
        match self {
            OperandKind::Unknown => "Unknown",
            OperandKind::Immediate => "Immediate",
            OperandKind::Register => "Register",
        }
    }
}

/// A resolved operand value: a constant or a register to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Immediate(i32),
    Register(RegisterId),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Immediate(v) => write!(f, "#{v}"),
            Operand::Register(r) => write!(f, "r{r}"),
        }
    }
}

/// The unpacked operand word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Operands {
    /// Raw kind nibble, kept so unknown kinds stay observable.
    pub kind_bits: u8,
    pub r0: RegisterId,
    pub r1: RegisterId,
    pub r2: RegisterId,
    pub imm: u8,
}

impl Operands {
    /// Operands for an instruction taking an immediate source.
    pub const fn immediate(r0: RegisterId, imm: u8) -> Self {
        Self {
            kind_bits: OperandKind::Immediate as u8,
            r0,
            r1: 0,
            r2: 0,
            imm,
        }
    }

    /// Operands for an instruction taking a register source.
    pub const fn registers(r0: RegisterId, r1: RegisterId) -> Self {
        Self {
            kind_bits: OperandKind::Register as u8,
            r0,
            r1,
            r2: 0,
            imm: 0,
        }
    }

    /// Operands with no source: only `r0` is meaningful.
    pub const fn single(r0: RegisterId) -> Self {
        Self::registers(r0, 0)
    }

    pub const fn none() -> Self {
        Self::registers(0, 0)
    }

    /// Unpacks an operand word. Never fails.
    pub const fn unpack(word: u32) -> Self {
        Self {
            kind_bits: ((word >> KIND_SHIFT) & NIBBLE) as u8,
            r0: ((word >> R0_SHIFT) & NIBBLE) as u8,
            r1: ((word >> R1_SHIFT) & NIBBLE) as u8,
            r2: ((word >> R2_SHIFT) & NIBBLE) as u8,
            imm: (word & IMM_MASK) as u8,
        }
    }

    /// Packs back into an operand word. Fields wider than their slot are masked.
    pub const fn pack(&self) -> u32 {
        ((self.kind_bits as u32 & NIBBLE) << KIND_SHIFT)
            | ((self.r0 as u32 & NIBBLE) << R0_SHIFT)
            | ((self.r1 as u32 & NIBBLE) << R1_SHIFT)
            | ((self.r2 as u32 & NIBBLE) << R2_SHIFT)
            | (self.imm as u32 & IMM_MASK)
    }

    pub const fn kind(&self) -> OperandKind {
        OperandKind::from_bits(self.kind_bits)
    }

    /// Source operand of a two-operand instruction: the immediate when the
    /// kind says so, register `r1` otherwise.
    pub const fn source(&self) -> Operand {
        match self.kind() {
            OperandKind::Immediate => Operand::Immediate(self.imm as i32),
            OperandKind::Register | OperandKind::Unknown => Operand::Register(self.r1),
        }
    }

    /// Operand of a single-operand instruction (PUSH, CALL, jumps): the
    /// immediate when the kind says so, register `r0` otherwise.
    pub const fn target(&self) -> Operand {
        match self.kind() {
            OperandKind::Immediate => Operand::Immediate(self.imm as i32),
            OperandKind::Register | OperandKind::Unknown => Operand::Register(self.r0),
        }
    }
}

/// One fixed-width instruction as stored in a program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstructionRecord {
    pub opcode: u32,
    pub operand: u32,
}

impl InstructionRecord {
    pub const fn new(opcode: u32, operands: Operands) -> Self {
        Self {
            opcode,
            operand: operands.pack(),
        }
    }

    pub fn from_le_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        let [a, b, c, d, e, f, g, h] = bytes;
        Self {
            opcode: u32::from_le_bytes([a, b, c, d]),
            operand: u32::from_le_bytes([e, f, g, h]),
        }
    }

    pub fn to_le_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..].copy_from_slice(&self.operand.to_le_bytes());
        out
    }
}

/// A record split into its opcode word and unpacked operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub opcode: u32,
    pub operands: Operands,
}

/// Decodes a record. Pure and total over every bit pattern.
pub const fn decode(record: InstructionRecord) -> DecodedInstruction {
    DecodedInstruction {
        opcode: record.opcode,
        operands: Operands::unpack(record.operand),
    }
}
