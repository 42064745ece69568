use std::path::PathBuf;
use thiserror::Error;

/// Faults raised while a VM executes.
///
/// Every variant except [`VMError::UnknownOpcode`] is fatal to the VM that
/// raised it and to nothing else. Unknown opcodes are counted and skipped by
/// the dispatcher; the variant exists so opcode decoding can report them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VMError {
    /// Opcode word does not name any instruction. Decoding has no position;
    /// the dispatcher logs the instruction index itself.
    #[error("unknown opcode 0x{opcode:03X}")]
    UnknownOpcode { opcode: u32 },
    /// The `UNUSED` sentinel opcode was fetched, the program is likely corrupt.
    #[error("unused opcode encountered at instruction {ip}, program is likely corrupt")]
    UnusedOpcode { ip: usize },
    /// Fetch past the end of the program (unterminated program or bad jump).
    #[error("instruction pointer {ip} outside program of {len} instructions")]
    InstructionPointerOutOfBounds { ip: usize, len: usize },
    /// Division with a zero divisor.
    #[error("division by zero at instruction {ip}")]
    DivisionByZero { ip: usize },
    /// Push onto a full stack.
    #[error("stack overflow at instruction {ip}: sp {sp} with capacity {capacity}")]
    StackOverflow { ip: usize, sp: i32, capacity: usize },
    /// Pop from an empty stack.
    #[error("stack underflow at instruction {ip}")]
    StackUnderflow { ip: usize },
    /// The stack pointer register was left outside `[0, capacity)`.
    #[error("stack pointer {sp} outside [0, {capacity}) after instruction {ip}")]
    StackPointerOutOfRange { ip: usize, sp: i32, capacity: usize },
    /// Register operand names a slot that does not exist.
    #[error("register index {index} out of bounds ({available} registers) at instruction {ip}")]
    InvalidRegister { index: u8, available: usize, ip: usize },
    /// The configured step budget ran out before the program halted.
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u64 },
    /// The supervisor requested shutdown.
    #[error("execution cancelled after {steps} steps")]
    Cancelled { steps: u64 },
    /// The thread running the VM panicked.
    #[error("vm thread panicked: {reason}")]
    ThreadPanicked { reason: String },
    /// The operating system refused to start a thread for the VM.
    #[error("failed to start vm thread: {reason}")]
    SpawnFailed { reason: String },
}

/// Reasons a program cannot be turned into a runnable VM.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The byte buffer holds no data.
    #[error("program '{name}' is empty")]
    EmptyInput { name: String },
    /// The program file could not be read.
    #[error("failed to read '{}': {source}", .path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Fewer bytes were read than the file reported.
    #[error("'{}' changed while reading: expected {expected} bytes, read {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}
