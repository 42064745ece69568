use crate::virtual_machine::flags::Flags;
use crate::virtual_machine::operand::RegisterId;
use std::fmt;

/// Number of register slots per VM.
pub const REGISTER_COUNT: usize = 5;
/// Stack pointer register (`r3`).
pub const SP: RegisterId = 3;
/// Flags register (`r4`).
pub const FLAGS: RegisterId = 4;

/// Register file: `r0`..`r2` general purpose, `r3` stack pointer, `r4` flags.
///
/// Operand fields can name indices up to 15, so access is checked and
/// returns `None` for slots that do not exist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct Registers {
    regs: [i32; REGISTER_COUNT],
}

impl Registers {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Returns the value in register `idx`.
    pub(super) fn get(&self, idx: RegisterId) -> Option<i32> {
        self.regs.get(idx as usize).copied()
    }

    /// Stores a value into register `idx`. Returns `None` if `idx` is out of bounds.
    pub(super) fn set(&mut self, idx: RegisterId, v: i32) -> Option<()> {
        let slot = self.regs.get_mut(idx as usize)?;
        *slot = v;
        Some(())
    }

    pub(super) fn sp(&self) -> i32 {
        self.regs[SP as usize]
    }

    pub(super) fn set_sp(&mut self, v: i32) {
        self.regs[SP as usize] = v;
    }

    pub(super) fn flags(&self) -> Flags {
        Flags(self.regs[FLAGS as usize])
    }

    pub(super) fn set_flags(&mut self, flags: Flags) {
        self.regs[FLAGS as usize] = flags.bits();
    }

    pub(super) fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot(self.regs)
    }
}

/// Copy of a register file, detached from its VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot(pub [i32; REGISTER_COUNT]);

impl RegisterSnapshot {
    pub fn get(&self, idx: RegisterId) -> Option<i32> {
        self.0.get(idx as usize).copied()
    }

    pub fn sp(&self) -> i32 {
        self.0[SP as usize]
    }

    pub fn flags(&self) -> Flags {
        Flags(self.0[FLAGS as usize])
    }
}

impl fmt::Display for RegisterSnapshot {
    /// `regs = 0000012C 000000C8 00000000 00000000 00000000 [-----]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "regs =")?;
        for v in self.0 {
            write!(f, " {:08X}", v as u32)?;
        }
        write!(f, " [{}]", self.flags())
    }
}
