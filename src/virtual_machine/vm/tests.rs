use super::*;
use crate::virtual_machine::flags::{FLAG_OVERFLOW, FLAG_PARITY, FLAG_SIGN, FLAG_ZERO};
use crate::virtual_machine::operand::InstructionRecord;

fn rec(instr: Instruction, ops: Operands) -> InstructionRecord {
    InstructionRecord::new(instr.opcode(), ops)
}

fn op(instr: Instruction) -> InstructionRecord {
    rec(instr, Operands::none())
}

fn loadi(r: RegisterId, v: u8) -> InstructionRecord {
    rec(Instruction::LoadI, Operands::immediate(r, v))
}

fn imm(instr: Instruction, r: RegisterId, v: u8) -> InstructionRecord {
    rec(instr, Operands::immediate(r, v))
}

fn reg(instr: Instruction, r0: RegisterId, r1: RegisterId) -> InstructionRecord {
    rec(instr, Operands::registers(r0, r1))
}

fn unary(instr: Instruction, r: RegisterId) -> InstructionRecord {
    rec(instr, Operands::single(r))
}

fn jump(instr: Instruction, target: u8) -> InstructionRecord {
    rec(instr, Operands::immediate(0, target))
}

fn new_vm(records: Vec<InstructionRecord>) -> VM {
    VM::new("test", Program::from_records(records))
}

fn run_program(records: Vec<InstructionRecord>) -> FinalState {
    new_vm(records).run()
}

fn run_halted(records: Vec<InstructionRecord>) -> FinalState {
    let state = run_program(records);
    assert_eq!(state.status, ExitStatus::Halted, "unexpected fault: {state}");
    state
}

fn run_expect_fault(records: Vec<InstructionRecord>) -> VMError {
    match run_program(records).status {
        ExitStatus::Faulted(err) => err,
        ExitStatus::Halted => panic!("expected a fault"),
    }
}

fn r(state: &FinalState, idx: RegisterId) -> i32 {
    state.registers.get(idx).unwrap()
}

/// Puts `i32::MIN` into `r`.
fn load_min(r: RegisterId) -> [InstructionRecord; 2] {
    [loadi(r, 1), imm(Instruction::Shl, r, 31)]
}

// ==================== Arithmetic ====================

#[test]
fn add_register_source() {
    let state = run_halted(vec![
        loadi(0, 100),
        loadi(1, 200),
        reg(Instruction::Add, 0, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 300);
    assert_eq!(r(&state, 1), 200);
    assert!(!state.registers.flags().zero());
    assert!(!state.registers.flags().sign());
    assert_eq!(state.steps, 4);
    assert_eq!(state.ip, 4);
}

#[test]
fn add_immediate_source() {
    let state = run_halted(vec![
        loadi(0, 40),
        imm(Instruction::Add, 0, 2),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 42);
}

#[test]
fn sub_negative_sets_sign() {
    let state = run_halted(vec![
        loadi(0, 5),
        imm(Instruction::Sub, 0, 7),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), -2);
    assert!(state.registers.flags().sign());
    assert!(!state.registers.flags().zero());
}

#[test]
fn sub_to_zero_sets_zero() {
    let state = run_halted(vec![
        loadi(0, 9),
        loadi(1, 9),
        reg(Instruction::Sub, 0, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 0);
    assert_eq!(state.registers.flags(), compute_flags(0));
}

#[test]
fn mul() {
    let state = run_halted(vec![
        loadi(0, 12),
        imm(Instruction::Mul, 0, 11),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 132);
}

#[test]
fn div() {
    let state = run_halted(vec![
        loadi(0, 100),
        imm(Instruction::Div, 0, 7),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 14);
}

#[test]
fn div_by_zero() {
    let err = run_expect_fault(vec![
        loadi(0, 5),
        imm(Instruction::Div, 0, 0),
        op(Instruction::Halt),
    ]);
    assert_eq!(err, VMError::DivisionByZero { ip: 1 });
}

#[test]
fn div_min_by_minus_one_wraps() {
    let mut program = load_min(0).to_vec();
    program.extend([
        loadi(1, 0),
        unary(Instruction::Dec, 1),
        reg(Instruction::Div, 0, 1),
        op(Instruction::Halt),
    ]);
    let state = run_halted(program);
    assert_eq!(r(&state, 0), i32::MIN);
}

#[test]
fn inc_dec_wrap() {
    let mut program = load_min(0).to_vec();
    program.extend([unary(Instruction::Dec, 0)]);
    let state = run_halted([program.clone(), vec![op(Instruction::Halt)]].concat());
    assert_eq!(r(&state, 0), i32::MAX);
    assert!(!state.registers.flags().sign());

    program.extend([unary(Instruction::Inc, 0), op(Instruction::Halt)]);
    let state = run_halted(program);
    assert_eq!(r(&state, 0), i32::MIN);
    assert!(state.registers.flags().sign());
}

#[test]
fn mul_wraps() {
    let mut program = load_min(0).to_vec();
    program.extend([imm(Instruction::Mul, 0, 2), op(Instruction::Halt)]);
    let state = run_halted(program);
    assert_eq!(r(&state, 0), 0);
    assert!(state.registers.flags().zero());
}

// ==================== Bitwise ====================

#[test]
fn xor_or_and() {
    let state = run_halted(vec![
        loadi(0, 0b1100),
        imm(Instruction::Xor, 0, 0b1010),
        loadi(1, 0b1100),
        imm(Instruction::Or, 1, 0b0011),
        loadi(2, 0b1100),
        imm(Instruction::And, 2, 0b0110),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 0b0110);
    assert_eq!(r(&state, 1), 0b1111);
    assert_eq!(r(&state, 2), 0b0100);
}

#[test]
fn not_is_unary() {
    let state = run_halted(vec![
        loadi(0, 0),
        loadi(1, 77),
        reg(Instruction::Not, 0, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), -1);
    assert_eq!(r(&state, 1), 77);
    assert!(state.registers.flags().sign());
}

#[test]
fn shr_is_arithmetic() {
    let mut program = load_min(0).to_vec();
    program.extend([imm(Instruction::Shr, 0, 4), op(Instruction::Halt)]);
    let state = run_halted(program);
    assert_eq!(r(&state, 0), i32::MIN >> 4);
    assert!(r(&state, 0) < 0);
}

#[test]
fn shift_amount_is_masked() {
    let state = run_halted(vec![
        loadi(0, 1),
        imm(Instruction::Shl, 0, 33),
        loadi(1, 64),
        imm(Instruction::Shr, 1, 36),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 2);
    assert_eq!(r(&state, 1), 4);
}

// ==================== Moves / Compare ====================

#[test]
fn mov_copies_source_and_sets_flags() {
    let state = run_halted(vec![
        loadi(1, 0),
        loadi(0, 5),
        reg(Instruction::Mov, 0, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 0);
    assert!(state.registers.flags().zero());
}

#[test]
fn loadi_leaves_flags_untouched() {
    let state = run_halted(vec![
        loadi(0, 1),
        imm(Instruction::Sub, 0, 1),
        loadi(0, 200),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 200);
    assert!(state.registers.flags().zero());
}

#[test]
fn cmp_equal_sets_zero_without_writing() {
    let state = run_halted(vec![
        loadi(0, 7),
        imm(Instruction::Cmp, 0, 7),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 7);
    assert_eq!(state.registers.flags(), compute_flags(0));
}

#[test]
fn cmp_unequal_clears_zero() {
    let state = run_halted(vec![
        loadi(0, 7),
        loadi(1, 8),
        reg(Instruction::Cmp, 0, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 7);
    assert_eq!(r(&state, 1), 8);
    assert_eq!(state.registers.flags(), compute_flags(1));
}

#[test]
fn jz_after_cmp_is_jump_if_equal() {
    let state = run_halted(vec![
        loadi(0, 7),
        imm(Instruction::Cmp, 0, 7),
        jump(Instruction::Jz, 5),
        loadi(1, 1),
        op(Instruction::Halt),
        loadi(1, 2),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 1), 2);
}

// ==================== Jumps ====================

#[test]
fn conditional_jumps_follow_flags() {
    use Instruction::*;
    let cases: &[(Instruction, i32, bool)] = &[
        (Jmp, 0, true),
        (Jz, FLAG_ZERO, true),
        (Jz, 0, false),
        (Jnz, 0, true),
        (Jnz, FLAG_ZERO, false),
        (Js, FLAG_SIGN, true),
        (Js, 0, false),
        (Jns, 0, true),
        (Jns, FLAG_SIGN, false),
        (Jgt, 0, true),
        (Jgt, FLAG_SIGN, false),
        (Jgt, FLAG_ZERO | FLAG_SIGN, true),
        (Jgt, FLAG_OVERFLOW, false),
        (Jlt, FLAG_SIGN, true),
        (Jlt, FLAG_OVERFLOW, true),
        (Jlt, 0, false),
        (Jpe, FLAG_PARITY, true),
        (Jpe, 0, false),
        (Jpo, 0, true),
        (Jpo, FLAG_PARITY, false),
    ];

    for &(instr, flags, taken) in cases {
        let state = run_halted(vec![
            loadi(FLAGS, flags as u8),
            jump(instr, 3),
            op(Instruction::Halt),
            loadi(0, 1),
            op(Instruction::Halt),
        ]);
        assert_eq!(
            r(&state, 0) == 1,
            taken,
            "{instr} with flags [{}]",
            Flags(flags)
        );
    }
}

#[test]
fn jump_through_register() {
    let state = run_halted(vec![
        loadi(1, 3),
        unary(Instruction::Jmp, 1),
        loadi(0, 9),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 0);
    assert_eq!(state.steps, 3);
}

#[test]
fn countdown_loop() {
    let state = run_halted(vec![
        loadi(1, 250),
        imm(Instruction::Shl, 1, 2),
        unary(Instruction::Inc, 0),
        unary(Instruction::Dec, 1),
        jump(Instruction::Jnz, 2),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 1000);
    assert_eq!(r(&state, 1), 0);
}

#[test]
fn negative_jump_target_faults_on_fetch() {
    let err = run_expect_fault(vec![
        loadi(1, 0),
        unary(Instruction::Dec, 1),
        unary(Instruction::Jmp, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(
        err,
        VMError::InstructionPointerOutOfBounds {
            ip: usize::MAX,
            len: 4
        }
    );
}

#[test]
fn untaken_jump_ignores_bad_register() {
    let state = run_halted(vec![
        rec(Instruction::Jz, Operands::single(9)),
        op(Instruction::Halt),
    ]);
    assert_eq!(state.steps, 2);
}

// ==================== Calls / Stack ====================

#[test]
fn call_then_ret_resumes_after_call() {
    let mut vm = new_vm(vec![
        jump(Instruction::Call, 3),
        loadi(0, 1),
        op(Instruction::Halt),
        loadi(1, 7),
        op(Instruction::Ret),
    ]);

    assert_eq!(vm.step(), Ok(ExecState::Running));
    assert_eq!(vm.ip(), 3);
    assert_eq!(vm.registers().sp(), 1);

    let state = vm.run();
    assert!(state.status.is_halted());
    assert_eq!(r(&state, 0), 1);
    assert_eq!(r(&state, 1), 7);
    assert_eq!(state.registers.sp(), 0);
    assert_eq!(state.ip, 3);
}

#[test]
fn call_then_ret_restores_non_zero_sp() {
    let mut vm = new_vm(vec![
        jump(Instruction::Push, 11),
        jump(Instruction::Push, 22),
        jump(Instruction::Call, 6),
        unary(Instruction::Pop, 1),
        unary(Instruction::Pop, 2),
        op(Instruction::Halt),
        loadi(0, 5),
        op(Instruction::Ret),
    ]);

    vm.step().unwrap();
    vm.step().unwrap();
    assert_eq!(vm.registers().sp(), 2);

    assert_eq!(vm.step(), Ok(ExecState::Running));
    assert_eq!(vm.ip(), 6);
    assert_eq!(vm.registers().sp(), 3);

    vm.step().unwrap();
    vm.step().unwrap();
    assert_eq!(vm.ip(), 3);
    assert_eq!(vm.registers().sp(), 2);

    let state = vm.run();
    assert!(state.status.is_halted());
    assert_eq!(r(&state, 0), 5);
    assert_eq!(r(&state, 1), 22);
    assert_eq!(r(&state, 2), 11);
    assert_eq!(state.registers.sp(), 0);
}

#[test]
fn push_pop_is_lifo() {
    let state = run_halted(vec![
        loadi(0, 42),
        unary(Instruction::Push, 0),
        jump(Instruction::Push, 7),
        unary(Instruction::Pop, 1),
        unary(Instruction::Pop, 2),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 1), 7);
    assert_eq!(r(&state, 2), 42);
    assert_eq!(state.registers.sp(), 0);
}

#[test]
fn pushf_popf_restore_flags() {
    let state = run_halted(vec![
        imm(Instruction::Sub, 0, 1),
        op(Instruction::PushF),
        loadi(FLAGS, 0),
        op(Instruction::PopF),
        op(Instruction::Halt),
    ]);
    assert_eq!(state.registers.flags(), compute_flags(-1));
    assert_eq!(state.registers.sp(), 0);
}

#[test]
fn pop_underflow() {
    let err = run_expect_fault(vec![unary(Instruction::Pop, 0), op(Instruction::Halt)]);
    assert_eq!(err, VMError::StackUnderflow { ip: 0 });
}

#[test]
fn ret_without_call_underflows() {
    let err = run_expect_fault(vec![op(Instruction::Ret)]);
    assert_eq!(err, VMError::StackUnderflow { ip: 0 });
}

#[test]
fn push_overflow() {
    let top = (MAX_STACK - 1) as i32;
    let err = run_expect_fault(vec![
        loadi(SP, 255),
        imm(Instruction::Shl, SP, 8),
        imm(Instruction::Add, SP, 255),
        jump(Instruction::Push, 1),
        op(Instruction::Halt),
    ]);
    assert_eq!(
        err,
        VMError::StackOverflow {
            ip: 3,
            sp: top,
            capacity: MAX_STACK
        }
    );
}

#[test]
fn stack_pointer_written_out_of_range() {
    let err = run_expect_fault(vec![
        loadi(SP, 1),
        imm(Instruction::Sub, SP, 2),
        op(Instruction::Halt),
    ]);
    assert_eq!(
        err,
        VMError::StackPointerOutOfRange {
            ip: 1,
            sp: -1,
            capacity: MAX_STACK
        }
    );
}

// ==================== Error Cases ====================

#[test]
fn invalid_destination_register() {
    let err = run_expect_fault(vec![loadi(5, 1), op(Instruction::Halt)]);
    assert_eq!(
        err,
        VMError::InvalidRegister {
            index: 5,
            available: REGISTER_COUNT,
            ip: 0
        }
    );
}

#[test]
fn invalid_source_register() {
    let err = run_expect_fault(vec![
        op(Instruction::Nop),
        reg(Instruction::Add, 0, 9),
        op(Instruction::Halt),
    ]);
    assert_eq!(
        err,
        VMError::InvalidRegister {
            index: 9,
            available: REGISTER_COUNT,
            ip: 1
        }
    );
}

#[test]
fn unused_opcode_halts_with_fault() {
    let state = run_program(vec![InstructionRecord::default(), op(Instruction::Halt)]);
    assert_eq!(state.status, ExitStatus::Faulted(VMError::UnusedOpcode { ip: 0 }));
    assert_eq!(state.steps, 1);
}

#[test]
fn unknown_opcode_is_skipped() {
    let state = run_halted(vec![
        loadi(0, 1),
        InstructionRecord {
            opcode: 0x777,
            operand: 0,
        },
        unary(Instruction::Inc, 0),
        op(Instruction::Halt),
    ]);
    assert_eq!(r(&state, 0), 2);
    assert_eq!(state.unknown_opcodes, 1);
    assert_eq!(state.steps, 4);
}

#[test]
fn running_off_the_end() {
    let err = run_expect_fault(vec![loadi(0, 1)]);
    assert_eq!(err, VMError::InstructionPointerOutOfBounds { ip: 1, len: 1 });
}

#[test]
fn empty_program_faults_on_first_fetch() {
    let state = run_program(vec![]);
    assert_eq!(
        state.status.fault(),
        Some(&VMError::InstructionPointerOutOfBounds { ip: 0, len: 0 })
    );
    assert_eq!(state.steps, 0);
}

#[test]
fn fault_leaves_vm_halted() {
    let mut vm = new_vm(vec![imm(Instruction::Div, 0, 0), op(Instruction::Halt)]);
    assert_eq!(vm.step(), Err(VMError::DivisionByZero { ip: 0 }));
    assert_eq!(vm.state(), ExecState::Halted);
    assert_eq!(vm.step(), Ok(ExecState::Halted));
    assert_eq!(vm.steps(), 1);
}

// ==================== Debug / Reserved ====================

#[test]
fn debug_and_reserved_opcodes_do_not_mutate() {
    let state = run_halted(vec![
        loadi(0, 3),
        unary(Instruction::Prnt, 0),
        op(Instruction::Dmp),
        reg(Instruction::Lea, 0, 1),
        jump(Instruction::Int, 0x80),
        op(Instruction::Halt),
    ]);
    assert_eq!(state.registers, RegisterSnapshot([3, 0, 0, 0, 0]));
    assert_eq!(state.steps, 6);
}

// ==================== Limits ====================

#[test]
fn step_limit() {
    let mut vm = new_vm(vec![jump(Instruction::Jmp, 0)])
        .with_config(RunConfig::default().with_max_steps(Some(100)));
    let state = vm.run();
    assert_eq!(
        state.status,
        ExitStatus::Faulted(VMError::StepLimitExceeded { limit: 100 })
    );
    assert_eq!(state.steps, 100);
}

#[test]
fn step_limit_not_hit_by_short_program() {
    let mut vm = new_vm(vec![op(Instruction::Nop), op(Instruction::Halt)])
        .with_config(RunConfig::default().with_max_steps(Some(2)));
    assert!(vm.run().status.is_halted());
}

#[test]
fn cancelled_before_start() {
    let flag = Arc::new(AtomicBool::new(true));
    let mut vm = new_vm(vec![jump(Instruction::Jmp, 0)]).with_cancel_flag(flag);
    let state = vm.run();
    assert_eq!(state.status, ExitStatus::Faulted(VMError::Cancelled { steps: 0 }));
}

#[test]
fn trace_does_not_change_results() {
    let program = vec![loadi(0, 2), imm(Instruction::Mul, 0, 21), op(Instruction::Halt)];
    let plain = run_halted(program.clone());
    let traced = VM::new("test", Program::from_records(program))
        .with_config(RunConfig::default().with_trace(true))
        .run();
    assert_eq!(plain, traced);
}

#[test]
fn final_state_display() {
    let state = run_halted(vec![loadi(0, 1), op(Instruction::Halt)]);
    assert_eq!(
        state.to_string(),
        "test: regs = 00000001 00000000 00000000 00000000 00000000 [-----] ip=2 steps=2 halted"
    );
}
