//! Core virtual machine implementation.
//!
//! Each VM owns a five-slot register file, a private stack of [`MAX_STACK`]
//! words and an immutable [`Program`]. Execution is a fetch/decode/dispatch
//! loop over fixed-width records; all arithmetic wraps.

mod registers;
mod stack;
#[cfg(test)]
mod tests;

pub use registers::{FLAGS, REGISTER_COUNT, RegisterSnapshot, SP};
pub use stack::MAX_STACK;

use crate::config::RunConfig;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::flags::{Flags, compute_flags};
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::operand::{Operand, Operands, RegisterId, decode};
use crate::virtual_machine::program::{Program, disassemble};
use crate::{debug, error, info, warn};
use registers::Registers;
use stack::Stack;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        instr = $instr:ident,
        ops = $ops:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => {
                    let instr_name = $instr.mnemonic();
                    $( let $field = exec_vm!(@read $vm, $ops, $kind)?; )*
                    $vm.$handler(instr_name, $( $field ),*)
                }
            ),*
        }
    }};

    // Destination register index, not read
    (@read $vm:ident, $ops:ident, Dst) => {
        Ok::<RegisterId, VMError>($ops.r0)
    };
    // Value of the source operand (`r1` or immediate)
    (@read $vm:ident, $ops:ident, Src) => {
        $vm.resolve($ops.source())
    };
    // Value of the single operand (`r0` or immediate)
    (@read $vm:ident, $ops:ident, Val) => {
        $vm.resolve($ops.target())
    };
    // Unresolved single operand, for jumps that may not be taken
    (@read $vm:ident, $ops:ident, Target) => {
        Ok::<Operand, VMError>($ops.target())
    };
    (@read $vm:ident, $ops:ident, Imm) => {
        Ok::<i32, VMError>($ops.imm as i32)
    };
}

/// Lifecycle of a single VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Running,
    Halted,
}

/// How a VM stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// A `HALT` instruction was executed.
    Halted,
    /// Execution stopped on a fault.
    Faulted(VMError),
}

impl ExitStatus {
    pub fn is_halted(&self) -> bool {
        matches!(self, ExitStatus::Halted)
    }

    pub fn fault(&self) -> Option<&VMError> {
        match self {
            ExitStatus::Halted => None,
            ExitStatus::Faulted(err) => Some(err),
        }
    }
}

/// Observable state of a VM once it has stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalState {
    pub name: String,
    pub registers: RegisterSnapshot,
    pub ip: usize,
    pub status: ExitStatus,
    pub steps: u64,
    pub unknown_opcodes: u64,
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ip={} steps={}", self.name, self.registers, self.ip, self.steps)?;
        if self.unknown_opcodes > 0 {
            write!(f, " unknown={}", self.unknown_opcodes)?;
        }
        match &self.status {
            ExitStatus::Halted => write!(f, " halted"),
            ExitStatus::Faulted(err) => write!(f, " faulted: {err}"),
        }
    }
}

/// Bytecode virtual machine.
///
/// Executes one program from index 0 until `HALT` or a fault. A VM is never
/// shared: the thread that runs it owns it outright.
pub struct VM {
    /// Label used in log lines and the final report.
    name: String,
    program: Program,
    registers: Registers,
    stack: Stack,
    /// Index of the next record to fetch.
    ip: usize,
    /// Index of the record being executed, for fault reports.
    current: usize,
    state: ExecState,
    steps: u64,
    unknown_opcodes: u64,
    config: RunConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl VM {
    /// Creates a VM in the `Running` state with zeroed registers.
    pub fn new(name: impl Into<String>, program: Program) -> Self {
        Self {
            name: name.into(),
            program,
            registers: Registers::new(),
            stack: Stack::new(),
            ip: 0,
            current: 0,
            state: ExecState::Running,
            steps: 0,
            unknown_opcodes: 0,
            config: RunConfig::default(),
            cancel: None,
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Stops the VM with [`VMError::Cancelled`] once `flag` becomes true.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn unknown_opcodes(&self) -> u64 {
        self.unknown_opcodes
    }

    pub fn registers(&self) -> RegisterSnapshot {
        self.registers.snapshot()
    }

    /// Runs until the VM halts or faults and reports where it stopped.
    pub fn run(&mut self) -> FinalState {
        let fault = loop {
            if let Some(err) = self.interrupted() {
                self.state = ExecState::Halted;
                break Some(err);
            }
            match self.step() {
                Ok(ExecState::Running) => {}
                Ok(ExecState::Halted) => break None,
                Err(err) => break Some(err),
            }
        };

        match &fault {
            None => info!("{}: halted after {} steps", self.name, self.steps),
            Some(err @ VMError::InstructionPointerOutOfBounds { .. }) => {
                warn!("{}: program is not terminated by HALT", self.name);
                error!("{}: {}", self.name, err);
            }
            Some(err) => error!("{}: {}", self.name, err),
        }

        FinalState {
            name: self.name.clone(),
            registers: self.registers.snapshot(),
            ip: self.ip,
            status: fault.map_or(ExitStatus::Halted, ExitStatus::Faulted),
            steps: self.steps,
            unknown_opcodes: self.unknown_opcodes,
        }
    }

    /// Fetches, decodes and executes one record.
    ///
    /// A fault moves the VM to `Halted` and is returned; stepping a halted VM
    /// does nothing.
    pub fn step(&mut self) -> Result<ExecState, VMError> {
        if self.state == ExecState::Halted {
            return Ok(ExecState::Halted);
        }

        let Some(record) = self.program.get(self.ip) else {
            self.state = ExecState::Halted;
            return Err(VMError::InstructionPointerOutOfBounds {
                ip: self.ip,
                len: self.program.len(),
            });
        };
        let decoded = decode(record);
        self.current = self.ip;
        self.ip += 1;
        self.steps += 1;

        if self.config.trace {
            debug!(
                "{}: {:04x}  {:<16} {}",
                self.name,
                self.current,
                disassemble(&decoded),
                self.registers.snapshot()
            );
        }

        let result = match Instruction::try_from(decoded.opcode) {
            Ok(instr) => self.exec(instr, decoded.operands),
            Err(_) => {
                warn!(
                    "{}: unknown opcode 0x{:03X} at instruction {}, skipping",
                    self.name, decoded.opcode, self.current
                );
                self.unknown_opcodes += 1;
                Ok(())
            }
        };

        match result.and_then(|()| self.check_stack_pointer()) {
            Ok(()) => Ok(self.state),
            Err(err) => {
                self.state = ExecState::Halted;
                Err(err)
            }
        }
    }

    /// Returns the fault that stops the loop before the next fetch, if any.
    fn interrupted(&self) -> Option<VMError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            return Some(VMError::Cancelled { steps: self.steps });
        }
        match self.config.max_steps {
            Some(limit) if self.steps >= limit => Some(VMError::StepLimitExceeded { limit }),
            _ => None,
        }
    }

    /// Executes a single instruction.
    fn exec(&mut self, instruction: Instruction, ops: Operands) -> Result<(), VMError> {
        exec_vm! {
            vm = self,
            instr = instruction,
            ops = ops,
            {
                // Control
                Unused => op_unused(),
                Nop => op_nop(),
                Halt => op_halt(),
                // Arithmetic
                Add => op_add(dst: Dst, src: Src),
                Sub => op_sub(dst: Dst, src: Src),
                Mul => op_mul(dst: Dst, src: Src),
                Div => op_div(dst: Dst, src: Src),
                Inc => op_inc(dst: Dst),
                Dec => op_dec(dst: Dst),
                // Bitwise
                Xor => op_xor(dst: Dst, src: Src),
                Or => op_or(dst: Dst, src: Src),
                And => op_and(dst: Dst, src: Src),
                Not => op_not(dst: Dst),
                Shr => op_shr(dst: Dst, src: Src),
                Shl => op_shl(dst: Dst, src: Src),
                // Moves / compare
                Mov => op_mov(dst: Dst, src: Src),
                Cmp => op_cmp(dst: Dst, src: Src),
                LoadI => op_load_i(dst: Dst, imm: Imm),
                // Stack
                Push => op_push(value: Val),
                Pop => op_pop(dst: Dst),
                PushF => op_push_f(),
                PopF => op_pop_f(),
                // Control flow
                Call => op_call(target: Target),
                Ret => op_ret(),
                Jmp => op_jmp(target: Target),
                Jnz => op_jnz(target: Target),
                Jz => op_jz(target: Target),
                Js => op_js(target: Target),
                Jns => op_jns(target: Target),
                Jgt => op_jgt(target: Target),
                Jlt => op_jlt(target: Target),
                Jpe => op_jpe(target: Target),
                Jpo => op_jpo(target: Target),
                // Debug / reserved
                Prnt => op_prnt(reg: Dst),
                Dmp => op_dmp(),
                Lea => op_unimplemented(),
                Int => op_unimplemented(),
            }
        }
    }

    /// Reads register `idx`, faulting on slots that do not exist.
    fn read(&self, idx: RegisterId) -> Result<i32, VMError> {
        self.registers
            .get(idx)
            .ok_or_else(|| self.invalid_register(idx))
    }

    /// Writes register `idx` without touching the flags.
    fn write(&mut self, idx: RegisterId, value: i32) -> Result<(), VMError> {
        self.registers
            .set(idx, value)
            .ok_or_else(|| self.invalid_register(idx))
    }

    /// Writes an arithmetic result and recomputes the flags from it.
    fn write_result(&mut self, idx: RegisterId, value: i32) -> Result<(), VMError> {
        self.write(idx, value)?;
        self.registers.set_flags(compute_flags(value));
        Ok(())
    }

    fn invalid_register(&self, index: RegisterId) -> VMError {
        VMError::InvalidRegister {
            index,
            available: REGISTER_COUNT,
            ip: self.current,
        }
    }

    fn resolve(&self, operand: Operand) -> Result<i32, VMError> {
        match operand {
            Operand::Immediate(v) => Ok(v),
            Operand::Register(r) => self.read(r),
        }
    }

    /// Absolute record index named by a jump operand.
    ///
    /// Negative values map to an index past any program, so the next fetch
    /// reports them as out of bounds.
    fn resolve_jump_target(&self, operand: Operand) -> Result<usize, VMError> {
        self.resolve(operand).map(to_index)
    }

    fn check_stack_pointer(&self) -> Result<(), VMError> {
        let sp = self.registers.sp();
        if Stack::in_range(sp) {
            Ok(())
        } else {
            Err(VMError::StackPointerOutOfRange {
                ip: self.current,
                sp,
                capacity: MAX_STACK,
            })
        }
    }

    fn push(&mut self, value: i32) -> Result<(), VMError> {
        let sp = self.registers.sp();
        let idx = Stack::push_slot(sp).ok_or(VMError::StackOverflow {
            ip: self.current,
            sp,
            capacity: MAX_STACK,
        })?;
        self.stack.write(idx, value);
        self.registers.set_sp(sp + 1);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, VMError> {
        let sp = self.registers.sp();
        let idx = Stack::pop_slot(sp).ok_or(VMError::StackUnderflow { ip: self.current })?;
        self.registers.set_sp(sp - 1);
        Ok(self.stack.read(idx))
    }

    fn op_unused(&mut self, _instr: &'static str) -> Result<(), VMError> {
        warn!(
            "{}: UNUSED opcode at instruction {}, program is likely corrupt",
            self.name, self.current
        );
        Err(VMError::UnusedOpcode { ip: self.current })
    }

    fn op_nop(&mut self, _instr: &'static str) -> Result<(), VMError> {
        Ok(())
    }

    fn op_halt(&mut self, _instr: &'static str) -> Result<(), VMError> {
        self.state = ExecState::Halted;
        Ok(())
    }

    fn op_add(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_add(src))
    }

    fn op_sub(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_sub(src))
    }

    fn op_mul(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_mul(src))
    }

    fn op_div(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        if src == 0 {
            return Err(VMError::DivisionByZero { ip: self.current });
        }
        self.write_result(dst, v.wrapping_div(src))
    }

    fn op_inc(&mut self, _instr: &'static str, dst: RegisterId) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_add(1))
    }

    fn op_dec(&mut self, _instr: &'static str, dst: RegisterId) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_sub(1))
    }

    fn op_xor(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v ^ src)
    }

    fn op_or(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v | src)
    }

    fn op_and(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v & src)
    }

    fn op_not(&mut self, _instr: &'static str, dst: RegisterId) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, !v)
    }

    fn op_shr(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_shr(src as u32))
    }

    fn op_shl(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.write_result(dst, v.wrapping_shl(src as u32))
    }

    fn op_mov(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        self.write_result(dst, src)
    }

    /// Zero is set exactly when the operands are equal.
    fn op_cmp(&mut self, _instr: &'static str, dst: RegisterId, src: i32) -> Result<(), VMError> {
        let v = self.read(dst)?;
        self.registers.set_flags(compute_flags((v != src) as i32));
        Ok(())
    }

    fn op_load_i(&mut self, _instr: &'static str, dst: RegisterId, imm: i32) -> Result<(), VMError> {
        self.write(dst, imm)
    }

    fn op_push(&mut self, _instr: &'static str, value: i32) -> Result<(), VMError> {
        self.push(value)
    }

    fn op_pop(&mut self, _instr: &'static str, dst: RegisterId) -> Result<(), VMError> {
        // Validate the destination before the stack pointer moves.
        self.read(dst)?;
        let v = self.pop()?;
        self.write(dst, v)
    }

    fn op_push_f(&mut self, _instr: &'static str) -> Result<(), VMError> {
        self.push(self.registers.flags().bits())
    }

    fn op_pop_f(&mut self, _instr: &'static str) -> Result<(), VMError> {
        let v = self.pop()?;
        self.registers.set_flags(Flags(v));
        Ok(())
    }

    fn op_call(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        self.push(self.ip as i32)?;
        self.op_jmp(instr, target)
    }

    fn op_ret(&mut self, _instr: &'static str) -> Result<(), VMError> {
        let ret = self.pop()?;
        self.ip = to_index(ret);
        Ok(())
    }

    fn op_jmp(&mut self, _instr: &'static str, target: Operand) -> Result<(), VMError> {
        self.ip = self.resolve_jump_target(target)?;
        Ok(())
    }

    fn jump_if(&mut self, instr: &'static str, cond: bool, target: Operand) -> Result<(), VMError> {
        if cond {
            self.op_jmp(instr, target)
        } else {
            Ok(())
        }
    }

    fn op_jnz(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, !f.zero(), target)
    }

    fn op_jz(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, f.zero(), target)
    }

    fn op_js(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, f.sign(), target)
    }

    fn op_jns(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, !f.sign(), target)
    }

    fn op_jgt(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, f.zero() || (!f.sign() && !f.overflow()), target)
    }

    fn op_jlt(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, f.sign() || f.overflow(), target)
    }

    fn op_jpe(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, f.parity(), target)
    }

    fn op_jpo(&mut self, instr: &'static str, target: Operand) -> Result<(), VMError> {
        let f = self.registers.flags();
        self.jump_if(instr, !f.parity(), target)
    }

    fn op_prnt(&mut self, _instr: &'static str, reg: RegisterId) -> Result<(), VMError> {
        let v = self.read(reg)?;
        info!("{}: r{} = {} (0x{:08X})", self.name, reg, v, v as u32);
        Ok(())
    }

    fn op_dmp(&mut self, _instr: &'static str) -> Result<(), VMError> {
        info!("{}: {}", self.name, self.registers.snapshot());
        Ok(())
    }

    fn op_unimplemented(&mut self, instr: &'static str) -> Result<(), VMError> {
        warn!(
            "{}: {} at instruction {} is unimplemented, ignoring",
            self.name, instr, self.current
        );
        Ok(())
    }
}

/// Converts a register value into a record index; negatives never index a program.
fn to_index(value: i32) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
