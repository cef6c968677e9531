//! Call lowering: clobbered registers, argument shuffles and stack arguments.

use regjit::core::test_utils::{RecordingEncoder, TestContext};
use regjit::core::{
    gp, Compiler, FunctionHints, Mem, Opcode, Operand, Reg, VarRef, VariableType,
};
use regjit::x64::FunctionPrototype;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn proto(args: usize, returns: &[VariableType]) -> FunctionPrototype {
    FunctionPrototype::sysv(&vec![VariableType::Gpq; args], returns).unwrap()
}

fn instructions(encoder: &RecordingEncoder) -> Vec<(Opcode, Vec<Operand>)> {
    encoder
        .instructions()
        .map(|(op, ops)| (op, ops.to_vec()))
        .collect()
}

#[test]
fn test_live_value_in_caller_saved_register_survives_call() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    // callee(a, b) = a + b
    c.new_function(proto(2, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    c.emit(Opcode::Add, &[a.into(), b.into()]).unwrap();
    c.ret(&[a.into()]).unwrap();
    let (callee, _) = c.function_labels().unwrap();
    c.end_function().unwrap();

    let caller = c
        .new_function(proto(1, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let x = c.arg(0).unwrap();
    let live = c.new_var(VariableType::Gpq).unwrap();
    c.emit(Opcode::Mov, &[live.into(), Operand::Imm(7)]).unwrap();
    c.alloc(live, Some(Reg::gp(gp::RSI))).unwrap();
    let result = c.new_var(VariableType::Gpq).unwrap();
    c.call(
        Operand::Label(callee),
        proto(2, &[VariableType::Gpq]),
        &[x.into(), x.into()],
        &[result],
    )
    .unwrap();
    c.emit(Opcode::Add, &[result.into(), live.into()]).unwrap();
    c.ret(&[result.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let code = instructions(&encoder);
    let call = encoder.position(Opcode::Call).unwrap();
    assert_eq!(code[call].1, vec![Operand::Label(callee)]);

    // rsi is flushed to the variable's slot before the call and read back after it
    let (store, slot) = code
        .iter()
        .enumerate()
        .find_map(|(i, (op, ops))| match ops.as_slice() {
            [Operand::Mem(m), Operand::Reg(r)] if *op == Opcode::Mov && r.reg == Reg::gp(gp::RSI) => {
                Some((i, *m))
            }
            _ => None,
        })
        .unwrap();
    assert!(store < call);
    assert!(code[call + 1..].iter().any(|(op, ops)| {
        *op == Opcode::Mov && matches!(ops.as_slice(), [Operand::Reg(_), Operand::Mem(m)] if *m == slot)
    }));

    // rsi is loaded with the second argument after the flush
    let arg_move = code
        .iter()
        .position(|(op, ops)| *op == Opcode::Mov && *ops == [Operand::gpq(gp::RSI), Operand::gpq(gp::RDI)])
        .unwrap();
    assert!(store < arg_move && arg_move < call);

    let frame = session.function(caller).unwrap().frame.unwrap();
    assert!(frame.esp_adjusted);
}

#[test]
fn test_swapped_arguments_use_exchange() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(2, &[]), FunctionHints::default()).unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    c.call(Operand::Imm(0x4000), proto(2, &[]), &[b.into(), a.into()], &[])
        .unwrap();
    c.ret(&[]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let code = instructions(&encoder);
    let call = encoder.position(Opcode::Call).unwrap();
    let xchg = encoder.position(Opcode::Xchg).unwrap();
    assert!(xchg < call);
    assert_eq!(encoder.count(Opcode::Xchg), 1);
    assert_eq!(code[call].1, vec![Operand::Imm(0x4000)]);
    assert_eq!(session.stats().spills, 0);
}

#[test]
fn test_argument_rotation_breaks_cycle_once() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(3, &[]), FunctionHints::default()).unwrap();
    let args: Vec<VarRef> = (0..3).map(|i| c.arg(i).unwrap()).collect();
    c.call(
        Operand::Imm(0x4000),
        proto(3, &[]),
        &[args[1].into(), args[2].into(), args[0].into()],
        &[],
    )
    .unwrap();
    c.ret(&[]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    // a three-register rotation needs two exchanges and no memory
    assert_eq!(encoder.count(Opcode::Xchg), 2);
    assert_eq!(encoder.stack_accesses(), 0);
}

#[test]
fn test_stack_arguments_are_stored_below_frame_top() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    let f = c.new_function(proto(0, &[]), FunctionHints::default()).unwrap();
    let args: Vec<Operand> = (0..8).map(Operand::Imm).collect();
    c.call(Operand::Imm(0x4000), proto(8, &[]), &args, &[]).unwrap();
    c.ret(&[]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let code = instructions(&encoder);
    let rsp = Reg::gp(gp::RSP);
    for (index, disp) in [(6, 0), (7, 8)] {
        let store = (
            Opcode::Mov,
            vec![Operand::Mem(Mem::base(rsp, disp, 8)), Operand::Imm(index)],
        );
        assert!(code.contains(&store), "missing store of argument {index}");
    }
    let register_loads = code
        .iter()
        .filter(|(op, ops)| *op == Opcode::Mov && matches!(ops.as_slice(), [Operand::Reg(_), Operand::Imm(_)]))
        .count();
    assert_eq!(register_loads, 6);

    let frame = session.function(f).unwrap().frame.unwrap();
    assert!(frame.esp_adjusted);
    assert_eq!(frame.call_stack_size, 16);
}

#[test]
fn test_return_value_lands_in_fixed_register() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(0, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let r = c.new_var(VariableType::Gpq).unwrap();
    let t = c.new_var(VariableType::Gpq).unwrap();
    c.call(Operand::Imm(0x4000), proto(0, &[VariableType::Gpq]), &[], &[r])
        .unwrap();
    c.emit(Opcode::Mov, &[t.into(), r.into()]).unwrap();
    c.emit(Opcode::Add, &[t.into(), Operand::Imm(1)]).unwrap();
    c.ret(&[t.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = RecordingEncoder::new();
    c.serialize(&mut encoder).unwrap();

    let code = instructions(&encoder);
    let call = encoder.position(Opcode::Call).unwrap();
    let copy = &code[call + 1];
    assert_eq!(copy.0, Opcode::Mov);
    assert!(matches!(copy.1[1], Operand::Reg(r) if r.reg == Reg::gp(gp::RAX)));
}

#[test]
fn test_argument_count_mismatch_is_rejected() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(1, &[]), FunctionHints::default()).unwrap();
    let a = c.arg(0).unwrap();
    assert!(c
        .call(Operand::Imm(0x4000), proto(2, &[]), &[a.into()], &[])
        .is_err());
    assert!(c
        .call(
            Operand::Imm(0x4000),
            proto(1, &[]),
            &[Operand::Mem(Mem::base(Reg::gp(gp::RSP), 0, 8))],
            &[],
        )
        .is_err());
}
