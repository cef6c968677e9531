//! Translation order, state reconciliation at jumps and unreachable code.

use regjit::core::test_utils::{Recorded, RecordingEncoder, TestContext};
use regjit::core::{
    gp, BranchHint, Compiler, Condition, FunctionHints, Opcode, Operand, Reg, VariableType,
};
use regjit::x64::FunctionPrototype;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn proto(args: usize, returns: &[VariableType]) -> FunctionPrototype {
    FunctionPrototype::sysv(&vec![VariableType::Gpq; args], returns).unwrap()
}

#[test]
fn test_jump_chain_is_fully_drained() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(0, &[]), FunctionHints::default()).unwrap();
    let (a, b, done) = (c.new_label(), c.new_label(), c.new_label());
    c.jmp(b).unwrap();
    c.bind(a).unwrap();
    c.jmp(done).unwrap();
    c.bind(b).unwrap();
    c.jmp(a).unwrap();
    c.bind(done).unwrap();
    c.ret(&[]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    assert_eq!(encoder.count(Opcode::Jmp), 3);
    assert_eq!(encoder.count(Opcode::Ret), 1);
    assert_eq!(session.context().pending_jumps(), 0);
    for label in [a, b, done] {
        assert!(encoder.entries().contains(&Recorded::Label(label)));
    }
}

#[test]
fn test_loop_keeps_state_across_back_edge() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(1, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let n = c.arg(0).unwrap();
    let acc = c.new_var(VariableType::Gpq).unwrap();
    c.emit(Opcode::Mov, &[acc.into(), Operand::Imm(0)]).unwrap();
    let top = c.new_label();
    c.bind(top).unwrap();
    c.emit(Opcode::Add, &[acc.into(), n.into()]).unwrap();
    c.emit(Opcode::Dec, &[n.into()]).unwrap();
    c.jcc(Condition::Ne, top, BranchHint::None).unwrap();
    c.ret(&[acc.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    // both variables stay in their registers around the loop
    assert_eq!(encoder.stack_accesses(), 0);
    assert_eq!(encoder.count(Opcode::Jmp), 0);
    assert!(session.stats().state_restores >= 1);
    let branch = encoder
        .instructions()
        .find(|(op, _)| *op == Opcode::Jcc(Condition::Ne))
        .map(|(_, ops)| ops.to_vec())
        .unwrap();
    assert_eq!(branch, vec![Operand::Label(top)]);
}

#[test]
fn test_forward_branch_reconciles_out_of_line() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(2, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    let x = c.new_var(VariableType::Gpq).unwrap();
    let skip = c.new_label();
    c.emit(Opcode::Mov, &[x.into(), a.into()]).unwrap();
    c.jcc(Condition::E, skip, BranchHint::None).unwrap();
    // the fall-through path leaves x in memory
    c.spill(x).unwrap();
    c.bind(skip).unwrap();
    c.emit(Opcode::Add, &[x.into(), b.into()]).unwrap();
    c.ret(&[x.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    assert_eq!(session.stats().forward_jumps_resolved, 1);
    assert_eq!(session.context().pending_jumps(), 0);

    // the branch goes through a block that stores x before reaching `skip`
    let branch = encoder
        .instructions()
        .find(|(op, _)| *op == Opcode::Jcc(Condition::E))
        .map(|(_, ops)| ops.to_vec())
        .unwrap();
    assert_ne!(branch, vec![Operand::Label(skip)]);
    assert_eq!(encoder.count(Opcode::Jmp), 1);
    assert_eq!(encoder.stores_of(Reg::gp(gp::RAX)), 2);

    let entries = encoder.entries();
    let block = entries
        .iter()
        .position(|e| matches!(branch[0], Operand::Label(l) if *e == Recorded::Label(l)))
        .unwrap();
    assert!(matches!(
        &entries[block + 1],
        Recorded::Instruction { opcode: Opcode::Mov, operands } if matches!(operands[0], Operand::Mem(_))
    ));
    assert_eq!(
        entries[block + 2],
        Recorded::Instruction {
            opcode: Opcode::Jmp,
            operands: vec![Operand::Label(skip)],
        }
    );
}

#[test]
fn test_matching_forward_state_needs_no_block() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(2, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    let skip = c.new_label();
    c.emit(Opcode::Cmp, &[a.into(), b.into()]).unwrap();
    c.jcc(Condition::L, skip, BranchHint::None).unwrap();
    c.emit(Opcode::Mov, &[a.into(), b.into()]).unwrap();
    c.bind(skip).unwrap();
    c.ret(&[a.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let branch = encoder
        .instructions()
        .find(|(op, _)| *op == Opcode::Jcc(Condition::L))
        .map(|(_, ops)| ops.to_vec())
        .unwrap();
    assert_eq!(branch, vec![Operand::Label(skip)]);
    assert_eq!(encoder.count(Opcode::Jmp), 0);
}

#[test]
fn test_unreachable_code_is_removed() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(0, &[]), FunctionHints::default()).unwrap();
    let (dead, end) = (c.new_label(), c.new_label());
    c.jmp(end).unwrap();
    c.bind(dead).unwrap();
    c.emit(Opcode::Nop, &[]).unwrap();
    c.bind(end).unwrap();
    c.ret(&[]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    assert_eq!(session.stats().items_removed, 2);
    assert_eq!(encoder.count(Opcode::Nop), 0);
    assert!(!encoder.entries().contains(&Recorded::Label(dead)));
    assert!(encoder.entries().contains(&Recorded::Label(end)));
}

#[test]
fn test_early_return_jumps_to_exit() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(1, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let a = c.arg(0).unwrap();
    let other = c.new_label();
    c.emit(Opcode::Test, &[a.into(), a.into()]).unwrap();
    c.jcc(Condition::E, other, BranchHint::None).unwrap();
    c.ret(&[a.into()]).unwrap();
    c.bind(other).unwrap();
    c.ret(&[Operand::Imm(7)]).unwrap();
    let (_, exit) = c.function_labels().unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let jumps: Vec<_> = encoder
        .instructions()
        .filter(|(op, _)| *op == Opcode::Jmp)
        .map(|(_, ops)| ops.to_vec())
        .collect();
    assert_eq!(jumps, vec![vec![Operand::Label(exit)]]);
    assert_eq!(encoder.count(Opcode::Ret), 1);
}
