//! Register-based bytecode virtual machine.
//!
//! Many programs run at once, each on its own OS thread with its own
//! registers, stack and program. The only shared structure is the liveness
//! [`registry::Registry`].
//!
//! # Architecture
//!
//! - **Registers**: five 32-bit slots; `r0`..`r2` general purpose, `r3` stack
//!   pointer, `r4` flags
//! - **Stack**: 65536 words per VM, shared by `PUSH`/`POP` and call frames
//! - **Instruction format**: fixed 8-byte records (opcode word, operand word)
//! - **Execution model**: fetch, advance, dispatch; jumps are absolute record
//!   indices; faults stop only the VM that raised them
//!
//! # Modules
//!
//! - [`errors`]: Load errors and execution faults
//! - [`flags`]: Condition flag bits and their computation
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`operand`]: Record layout and operand decoding
//! - [`program`]: Byte-to-record compiler, hex dump and disassembly
//! - [`registry`]: Liveness registry and the thread-per-VM supervisor
//! - [`vm`]: Execution engine

pub mod errors;
pub mod flags;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod registry;
pub mod vm;
