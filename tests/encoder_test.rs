//! End-to-end compilation into x86-64 machine code.

use iced_x86::{
    Decoder, DecoderOptions, Formatter, Instruction, Mnemonic, NasmFormatter, OpKind, Register,
};
use regjit::core::test_utils::TestContext;
use regjit::core::{
    BranchHint, Compiler, Condition, Encoder, FunctionHints, Opcode, Operand, VarRef, VariableType,
};
use regjit::x64::{FunctionPrototype, X64Encoder};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn proto(args: usize, returns: &[VariableType]) -> FunctionPrototype {
    FunctionPrototype::sysv(&vec![VariableType::Gpq; args], returns).unwrap()
}

fn decode(code: &[u8], base: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, base, DecoderOptions::NONE);
    let instructions: Vec<Instruction> = decoder.iter().collect();
    assert!(instructions.iter().all(|i| !i.is_invalid()));
    instructions
}

/// sum = n + (n - 1) + ... + 1
fn build_loop(c: &mut Compiler<'_, '_>, align: bool) {
    c.new_function(proto(1, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let n = c.arg(0).unwrap();
    let acc = c.new_var(VariableType::Gpq).unwrap();
    c.emit(Opcode::Xor, &[acc.into(), acc.into()]).unwrap();
    let top = c.new_label();
    if align {
        c.align(16).unwrap();
    }
    c.bind(top).unwrap();
    c.emit(Opcode::Add, &[acc.into(), n.into()]).unwrap();
    c.emit(Opcode::Dec, &[n.into()]).unwrap();
    c.jcc(Condition::Ne, top, BranchHint::None).unwrap();
    c.ret(&[acc.into()]).unwrap();
    c.end_function().unwrap();
}

#[test]
fn test_loop_compiles_to_machine_code() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);
    build_loop(&mut c, false);

    let mut encoder = X64Encoder::new().unwrap();
    let base = encoder.base_address();
    let code = c.make(&mut encoder).unwrap();
    assert_eq!(encoder.code_size(), code.len());
    let instructions = decode(&code, base);

    let mut formatter = NasmFormatter::new();
    let listing: Vec<String> = instructions
        .iter()
        .map(|i| {
            let mut text = String::new();
            formatter.format(i, &mut text);
            text
        })
        .collect();
    log::debug!("{}", listing.join("\n"));
    assert_eq!(listing[0], "push rbp");
    assert_eq!(listing[1], "mov rbp,rsp");
    assert!(listing.iter().any(|l| l.starts_with("jne ")));

    assert_eq!(instructions[0].mnemonic(), Mnemonic::Push);
    assert_eq!(instructions[0].op0_register(), Register::RBP);
    assert_eq!(instructions.last().map(|i| i.mnemonic()), Some(Mnemonic::Ret));

    let branch = instructions
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Jne)
        .unwrap();
    assert!(branch.near_branch_target() < branch.ip());
    let target = instructions
        .iter()
        .find(|i| i.ip() == branch.near_branch_target())
        .unwrap();
    assert_eq!(target.mnemonic(), Mnemonic::Add);
    assert_eq!(target.op0_register(), Register::RAX);
}

#[test]
fn test_aligned_loop_head() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);
    build_loop(&mut c, true);

    let mut encoder = X64Encoder::new().unwrap();
    let base = encoder.base_address();
    let code = c.make(&mut encoder).unwrap();
    let instructions = decode(&code, base);

    let branch = instructions
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Jne)
        .unwrap();
    assert_eq!(branch.near_branch_target() % 16, 0);
    assert!(instructions.iter().any(|i| i.mnemonic() == Mnemonic::Nop));
}

#[test]
fn test_call_between_compiled_functions() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(2, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    c.emit(Opcode::Imul, &[a.into(), b.into()]).unwrap();
    c.ret(&[a.into()]).unwrap();
    let (callee, _) = c.function_labels().unwrap();
    c.end_function().unwrap();

    c.new_function(proto(1, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let x = c.arg(0).unwrap();
    let r = c.new_var(VariableType::Gpq).unwrap();
    c.call(
        Operand::Label(callee),
        proto(2, &[VariableType::Gpq]),
        &[x.into(), Operand::Imm(3)],
        &[r],
    )
    .unwrap();
    c.ret(&[r.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = X64Encoder::new().unwrap();
    let base = encoder.base_address();
    let code = c.make(&mut encoder).unwrap();
    let instructions = decode(&code, base);

    // the callee is compiled first, at the start of the buffer
    let call = instructions
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Call)
        .unwrap();
    assert_eq!(call.near_branch_target(), base);
    let rets = instructions
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Ret)
        .count();
    assert_eq!(rets, 2);
}

#[test]
fn test_spill_code_encodes() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    c.new_function(proto(6, &[VariableType::Gpq]), FunctionHints::default())
        .unwrap();
    let mut vars: Vec<VarRef> = (0..6).map(|i| c.arg(i).unwrap()).collect();
    for i in 0..12 {
        let v = c.new_var(VariableType::Gpq).unwrap();
        c.emit(Opcode::Mov, &[v.into(), Operand::Imm(i * 3)]).unwrap();
        vars.push(v);
    }
    let sum = vars[0];
    for &v in &vars[1..] {
        c.emit(Opcode::Add, &[sum.into(), v.into()]).unwrap();
    }
    c.ret(&[sum.into()]).unwrap();
    c.end_function().unwrap();

    let mut encoder = X64Encoder::new().unwrap();
    let base = encoder.base_address();
    let code = c.make(&mut encoder).unwrap();
    let instructions = decode(&code, base);

    assert!(session.stats().spills > 0);
    let stack_ops = instructions
        .iter()
        .filter(|i| {
            (0..i.op_count()).any(|n| i.op_kind(n) == OpKind::Memory)
                && i.memory_base() == Register::RSP
        })
        .count();
    assert!(stack_ops > 0);
    assert_eq!(
        instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Add)
            .count(),
        17
    );
}

#[test]
fn test_embedded_data_and_float_code() {
    init();
    let ctx = TestContext::new();
    let mut session = ctx.create_session();
    let mut c = Compiler::new(&mut session);

    let f = FunctionPrototype::sysv(
        &[VariableType::Xmm1D, VariableType::Xmm1D],
        &[VariableType::Xmm1D],
    )
    .unwrap();
    c.new_function(f, FunctionHints::default()).unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    c.emit(Opcode::Mulsd, &[a.into(), b.into()]).unwrap();
    c.emit(Opcode::Addsd, &[a.into(), b.into()]).unwrap();
    c.ret(&[a.into()]).unwrap();
    c.end_function().unwrap();
    c.embed(&[0xde, 0xad, 0xbe, 0xef]).unwrap();

    let mut encoder = X64Encoder::new().unwrap();
    let code = c.make(&mut encoder).unwrap();

    assert_eq!(&code[code.len() - 4..], &[0xde, 0xad, 0xbe, 0xef]);
    let instructions = decode(&code[..code.len() - 4], encoder.base_address());
    assert!(instructions.iter().any(|i| i.mnemonic() == Mnemonic::Mulsd));
    assert!(instructions.iter().any(|i| i.mnemonic() == Mnemonic::Addsd));
    assert_eq!(instructions.last().map(|i| i.mnemonic()), Some(Mnemonic::Ret));
}
