//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical opcode table and invokes a callback macro for code generation, so
//! the enum, the mnemonic table and the ISA fingerprint test all read the same
//! list.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u32>` for decoding opcode words
//! - [`Instruction::shape`], the operand layout used when disassembling
//!
//! # Record format
//!
//! Every instruction is one 8-byte record: a 32-bit opcode word followed by a
//! 32-bit operand word, both little-endian. See [`operand`](super::operand)
//! for the operand word bit layout.

use crate::virtual_machine::errors::VMError;

/// Which operand fields an instruction reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape {
    /// No operands.
    Nullary,
    /// `r0` only.
    Unary,
    /// Destination `r0` and a source (`r1` or immediate).
    Binary,
    /// Destination `r0` and the immediate.
    LoadImm,
    /// A single operand taken from `r0` or the immediate.
    Target,
}

/// Invokes a callback macro with the complete instruction definition list.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Control
            // =========================
            /// UNUSED ; sentinel, halts the VM: the program is likely corrupt
            Unused = 0x000, "UNUSED" => Nullary,
            /// NOP ; no operation
            Nop = 0x001, "NOP" => Nullary,
            // =========================
            // Arithmetic
            // =========================
            /// ADD r0, src ; r0 = r0 + src
            Add = 0x002, "ADD" => Binary,
            /// SUB r0, src ; r0 = r0 - src
            Sub = 0x003, "SUB" => Binary,
            /// MUL r0, src ; r0 = r0 * src
            Mul = 0x004, "MUL" => Binary,
            /// DIV r0, src ; r0 = r0 / src (faults on zero divisor)
            Div = 0x005, "DIV" => Binary,
            // =========================
            // Bitwise
            // =========================
            /// XOR r0, src ; r0 = r0 ^ src
            Xor = 0x006, "XOR" => Binary,
            /// OR r0, src ; r0 = r0 | src
            Or = 0x007, "OR" => Binary,
            /// NOT r0 ; r0 = !r0
            Not = 0x008, "NOT" => Unary,
            /// AND r0, src ; r0 = r0 & src
            And = 0x009, "AND" => Binary,
            /// SHR r0, src ; r0 = r0 >> src (arithmetic)
            Shr = 0x00A, "SHR" => Binary,
            /// SHL r0, src ; r0 = r0 << src
            Shl = 0x00B, "SHL" => Binary,
            /// INC r0 ; r0 = r0 + 1
            Inc = 0x00C, "INC" => Unary,
            /// DEC r0 ; r0 = r0 - 1
            Dec = 0x00D, "DEC" => Unary,
            // =========================
            // Moves, compare and stack
            // =========================
            /// MOV r0, src ; r0 = src
            Mov = 0x00E, "MOV" => Binary,
            /// CMP r0, src ; flags = flags_of(r0 != src)
            Cmp = 0x00F, "CMP" => Binary,
            /// CALL target ; push return index, jump to target
            Call = 0x010, "CALL" => Target,
            /// RET ; pop return index into ip
            Ret = 0x011, "RET" => Nullary,
            /// PUSH value ; stack[sp] = value, sp += 1
            Push = 0x012, "PUSH" => Target,
            /// POP r0 ; sp -= 1, r0 = stack[sp]
            Pop = 0x013, "POP" => Unary,
            /// LEA ; reserved, not implemented
            Lea = 0x014, "LEA" => Binary,
            // =========================
            // Jumps
            // =========================
            /// JMP target ; ip = target
            Jmp = 0x015, "JMP" => Target,
            /// JNZ target ; jump when zero clear
            Jnz = 0x016, "JNZ" => Target,
            /// JZ target ; jump when zero set
            Jz = 0x017, "JZ" => Target,
            /// JS target ; jump when sign set
            Js = 0x018, "JS" => Target,
            /// JNS target ; jump when sign clear
            Jns = 0x019, "JNS" => Target,
            /// JGT target ; jump when zero set, or sign and overflow clear
            Jgt = 0x01A, "JGT" => Target,
            /// JLT target ; jump when sign or overflow set
            Jlt = 0x01B, "JLT" => Target,
            /// JPE target ; jump when parity set
            Jpe = 0x01C, "JPE" => Target,
            /// JPO target ; jump when parity clear
            Jpo = 0x01D, "JPO" => Target,
            // =========================
            // Program control
            // =========================
            /// HALT ; stop the VM
            Halt = 0x01E, "HALT" => Nullary,
            /// INT ; reserved for syscalls, not implemented
            Int = 0x01F, "INT" => Target,
            /// LOADI r0, imm ; r0 = imm (flags untouched)
            LoadI = 0x020, "LOADI" => LoadImm,
            /// PUSHF ; stack[sp] = flags, sp += 1
            PushF = 0x021, "PUSHF" => Nullary,
            /// POPF ; sp -= 1, flags = stack[sp]
            PopF = 0x022, "POPF" => Nullary,
            // =========================
            // Debug
            // =========================
            /// PRNT r0 ; log one register
            Prnt = 0xA00, "PRNT" => Unary,
            /// DMP ; log the whole register file
            Dmp = 0xA01, "DMP" => Nullary,
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => $shape:ident
        ),* $(,)?
    ) => {
        /// Every instruction the dispatcher recognises.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u32)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u32> for Instruction {
            type Error = VMError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::UnknownOpcode { opcode: value }),
                }
            }
        }

        impl Instruction {
            /// Every instruction in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Returns the opcode word for this instruction.
            pub const fn opcode(&self) -> u32 {
                *self as u32
            }

            /// Returns which operand fields this instruction reads.
            pub const fn shape(&self) -> Shape {
                match self {
                    $( Instruction::$name => Shape::$shape, )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
