//! Program representation and the byte-to-record compiler.
//!
//! Program files are a headerless run of 8-byte records. [`Program::compile`]
//! only reshapes bytes into records; it never looks at opcodes.

use crate::virtual_machine::errors::LoadError;
use crate::virtual_machine::isa::{Instruction, Shape};
use crate::virtual_machine::operand::{
    DecodedInstruction, InstructionRecord, RECORD_SIZE, decode,
};
use std::fmt::Write;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Input length was not a multiple of the record size.
///
/// Not fatal: the trailing partial record is zero-padded and kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "program is {length} bytes, not a multiple of {size}; last {trailing} bytes were zero-padded",
    size = RECORD_SIZE
)]
pub struct AlignmentWarning {
    pub length: usize,
    pub trailing: usize,
}

/// Output of [`Program::compile`].
#[derive(Debug, Clone)]
pub struct Compilation {
    pub program: Program,
    pub warning: Option<AlignmentWarning>,
}

/// An ordered, 0-indexed sequence of immutable instruction records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    records: Vec<InstructionRecord>,
}

impl Program {
    /// Builds a program directly from records.
    pub fn from_records(records: Vec<InstructionRecord>) -> Self {
        Self { records }
    }

    /// Splits raw bytes into records, in input order.
    ///
    /// Storage is sized from the byte length up front, so records already
    /// produced are never moved while later ones are appended.
    pub fn compile(raw: &[u8]) -> Compilation {
        let mut records = Vec::with_capacity(raw.len().div_ceil(RECORD_SIZE));
        let mut chunks = raw.chunks_exact(RECORD_SIZE);
        for chunk in &mut chunks {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes.copy_from_slice(chunk);
            records.push(InstructionRecord::from_le_bytes(bytes));
        }

        let tail = chunks.remainder();
        let warning = if tail.is_empty() {
            None
        } else {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes[..tail.len()].copy_from_slice(tail);
            records.push(InstructionRecord::from_le_bytes(bytes));
            Some(AlignmentWarning {
                length: raw.len(),
                trailing: tail.len(),
            })
        };

        Compilation {
            program: Self { records },
            warning,
        }
    }

    /// Serialises back to the on-disk byte format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.records.len() * RECORD_SIZE);
        for record in &self.records {
            out.extend_from_slice(&record.to_le_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the record at `ip`, or `None` past the end.
    pub fn get(&self, ip: usize) -> Option<InstructionRecord> {
        self.records.get(ip).copied()
    }

    pub fn records(&self) -> &[InstructionRecord] {
        &self.records
    }

    /// Renders one line per record: index, both raw words, and a disassembly.
    pub fn hex_dump(&self) -> String {
        let mut out = String::new();
        for (index, record) in self.records.iter().enumerate() {
            let _ = writeln!(
                out,
                "{index:04x}: {:08x} {:08x}  {}",
                record.opcode,
                record.operand,
                disassemble(&decode(*record))
            );
        }
        out
    }
}

/// Reads the raw bytes of a program file.
///
/// Fails with [`LoadError::SizeMismatch`] when fewer bytes arrive than the
/// file's metadata reported.
pub fn read_program_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    let io_failure = |source| LoadError::IoFailure {
        path: path.to_path_buf(),
        source,
    };

    let expected = fs::metadata(path).map_err(io_failure)?.len();
    let bytes = fs::read(path).map_err(io_failure)?;
    let actual = bytes.len() as u64;
    if actual < expected {
        return Err(LoadError::SizeMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(bytes)
}

/// Formats a decoded instruction as `MNEMONIC operands`.
pub fn disassemble(decoded: &DecodedInstruction) -> String {
    let Ok(instr) = Instruction::try_from(decoded.opcode) else {
        return format!("??? (0x{:03x})", decoded.opcode);
    };
    let ops = &decoded.operands;
    match instr.shape() {
        Shape::Nullary => instr.mnemonic().to_string(),
        Shape::Unary => format!("{} r{}", instr, ops.r0),
        Shape::Binary => format!("{} r{}, {}", instr, ops.r0, ops.source()),
        Shape::LoadImm => format!("{} r{}, #{}", instr, ops.r0, ops.imm),
        Shape::Target => format!("{} {}", instr, ops.target()),
    }
}
