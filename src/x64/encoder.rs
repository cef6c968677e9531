// This module turns resolved instructions into x86-64 machine code with the iced-x86 code
// assembler. X64Encoder implements the compiler's Encoder trait: operands arrive as physical
// registers (with an access width), sized memory references over physical base and index
// registers, immediates and labels, and each opcode is dispatched to the matching code_asm
// method for that operand shape. Labels are created lazily per LabelId; when two labels land
// on the same position a zero-byte instruction separates them. Alignment requests cannot be
// expressed to the code assembler directly, so every command is also recorded and, when the
// stream contains alignments, finish() replays it with NOP padding until the padding before
// each alignment point matches the final layout.

//! x86-64 instruction encoding using iced-x86.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};

use crate::core::encoder::{Encoder, EncodingError};
use crate::core::item::LabelId;
use crate::core::operand::{Condition, Mem, MemBase, Opcode, Operand, RegOperand};
use crate::core::register_file::{gp, Reg, RegClass};

/// Base address code is assembled at.
const BASE_ADDRESS: u64 = 0x1000;

/// Replays needed at most before alignment padding is considered unstable.
const MAX_LAYOUT_PASSES: usize = 8;

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

const MM: [AsmRegisterMm; 8] = [mm0, mm1, mm2, mm3, mm4, mm5, mm6, mm7];

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

fn imm32(value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value)
        .or_else(|_| u32::try_from(value).map(|v| v as i32))
        .map_err(|_| EncodingError::UnsupportedInstruction)
}

/// Operand in code_asm form.
#[derive(Clone, Copy)]
enum Arg {
    R64(AsmRegister64),
    R32(AsmRegister32),
    R16(AsmRegister16),
    R8(AsmRegister8),
    Xmm(AsmRegisterXmm),
    Mm(AsmRegisterMm),
    Mem(AsmMemoryOperand),
    Imm(i64),
    Label(CodeLabel),
}

fn gp64(reg: Reg) -> Result<AsmRegister64, EncodingError> {
    if reg.class != RegClass::Gp {
        return Err(EncodingError::InvalidRegister);
    }
    GP64.get(reg.index as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

fn register(op: &RegOperand) -> Result<Arg, EncodingError> {
    let i = op.reg.index as usize;
    let arg = match (op.reg.class, op.size) {
        (RegClass::Gp, 8) => GP64.get(i).copied().map(Arg::R64),
        (RegClass::Gp, 4) => GP32.get(i).copied().map(Arg::R32),
        (RegClass::Gp, 2) => GP16.get(i).copied().map(Arg::R16),
        (RegClass::Gp, 1) => GP8.get(i).copied().map(Arg::R8),
        (RegClass::Xmm, _) => XMM.get(i).copied().map(Arg::Xmm),
        (RegClass::Mm, _) => MM.get(i).copied().map(Arg::Mm),
        _ => None,
    };
    arg.ok_or(EncodingError::InvalidRegister)
}

fn address_reg(base: Option<MemBase>) -> Result<Option<AsmRegister64>, EncodingError> {
    match base {
        Some(MemBase::Reg(reg)) => gp64(reg).map(Some),
        Some(MemBase::Var(_)) => Err(EncodingError::UnresolvedOperand),
        None => Ok(None),
    }
}

fn memory(m: &Mem) -> Result<AsmMemoryOperand, EncodingError> {
    if m.home.is_some() {
        return Err(EncodingError::UnresolvedOperand);
    }
    let base = address_reg(m.base)?;
    let index = address_reg(m.index)?;
    let scale = u32::from(m.scale);
    let address = match (base, index) {
        (Some(b), Some(i)) => b + i * scale + m.disp,
        (Some(b), None) => b + m.disp,
        (None, Some(i)) => i * scale + m.disp,
        (None, None) => return Err(EncodingError::InvalidMemoryOperand),
    };
    Ok(match m.size {
        1 => byte_ptr(address),
        2 => word_ptr(address),
        4 => dword_ptr(address),
        8 => qword_ptr(address),
        16 => xmmword_ptr(address),
        _ => ptr(address),
    })
}

/// Two-operand integer instruction with all register, memory and immediate forms.
macro_rules! gp_binary {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::R64(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            _ => gp_binary_narrow!($a, $m, $args),
        }
    };
}

/// `gp_binary` without the 64-bit register, immediate form.
macro_rules! gp_binary_narrow {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::R64(d), Arg::R64(s)] => $a.$m(*d, *s),
            [Arg::R32(d), Arg::R32(s)] => $a.$m(*d, *s),
            [Arg::R16(d), Arg::R16(s)] => $a.$m(*d, *s),
            [Arg::R8(d), Arg::R8(s)] => $a.$m(*d, *s),
            [Arg::R64(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::R32(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::R16(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::R8(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R64(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R32(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R16(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R8(s)] => $a.$m(*d, *s),
            [Arg::R32(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R16(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R8(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::Mem(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

/// Register-first-only forms (`test`, `xchg`) after commuting `reg, mem`.
macro_rules! gp_commutative {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::R64(d), Arg::R64(s)] => $a.$m(*d, *s),
            [Arg::R32(d), Arg::R32(s)] => $a.$m(*d, *s),
            [Arg::R16(d), Arg::R16(s)] => $a.$m(*d, *s),
            [Arg::R8(d), Arg::R8(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R64(s)] | [Arg::R64(s), Arg::Mem(d)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R32(s)] | [Arg::R32(s), Arg::Mem(d)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R16(s)] | [Arg::R16(s), Arg::Mem(d)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::R8(s)] | [Arg::R8(s), Arg::Mem(d)] => $a.$m(*d, *s),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

macro_rules! gp_unary {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::R64(d)] => $a.$m(*d),
            [Arg::R32(d)] => $a.$m(*d),
            [Arg::R16(d)] => $a.$m(*d),
            [Arg::R8(d)] => $a.$m(*d),
            [Arg::Mem(d)] => $a.$m(*d),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

macro_rules! shift {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::R64(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R32(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R16(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R8(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::Mem(d), Arg::Imm(i)] => $a.$m(*d, imm32(*i)?),
            [Arg::R64(d), Arg::R8(c)] => $a.$m(*d, *c),
            [Arg::R32(d), Arg::R8(c)] => $a.$m(*d, *c),
            [Arg::R16(d), Arg::R8(c)] => $a.$m(*d, *c),
            [Arg::R8(d), Arg::R8(c)] => $a.$m(*d, *c),
            [Arg::Mem(d), Arg::R8(c)] => $a.$m(*d, *c),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

/// `xmm, xmm/mem` SSE forms.
macro_rules! sse {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::Xmm(d), Arg::Xmm(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::Mem(s)] => $a.$m(*d, *s),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

/// SSE moves, which also store.
macro_rules! sse_move {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::Xmm(d), Arg::Xmm(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::Mem(d), Arg::Xmm(s)] => $a.$m(*d, *s),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

/// Packed integer forms available on both MMX and SSE registers.
macro_rules! packed_int {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::Mm(d), Arg::Mm(s)] => $a.$m(*d, *s),
            [Arg::Mm(d), Arg::Mem(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::Xmm(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::Mem(s)] => $a.$m(*d, *s),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

/// Integer to scalar float conversions.
macro_rules! int_to_float {
    ($a:expr, $m:ident, $args:expr) => {
        match $args {
            [Arg::Xmm(d), Arg::R64(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::R32(s)] => $a.$m(*d, *s),
            [Arg::Xmm(d), Arg::Mem(s)] => $a.$m(*d, *s),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
    };
}

fn jcc(a: &mut CodeAssembler, condition: Condition, target: CodeLabel) -> Result<(), IcedError> {
    match condition {
        Condition::E => a.je(target),
        Condition::Ne => a.jne(target),
        Condition::L => a.jl(target),
        Condition::Le => a.jle(target),
        Condition::G => a.jg(target),
        Condition::Ge => a.jge(target),
        Condition::B => a.jb(target),
        Condition::Be => a.jbe(target),
        Condition::A => a.ja(target),
        Condition::Ae => a.jae(target),
        Condition::S => a.js(target),
        Condition::Ns => a.jns(target),
        Condition::O => a.jo(target),
        Condition::No => a.jno(target),
        Condition::P => a.jp(target),
        Condition::Np => a.jnp(target),
    }
}

/// One code assembler plus its label table.
struct Stream {
    assembler: CodeAssembler,
    labels: HashMap<LabelId, CodeLabel>,
    /// A label was set and no instruction follows it yet.
    label_pending: bool,
}

impl Stream {
    fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            assembler: CodeAssembler::new(64).map_err(asm_err)?,
            labels: HashMap::new(),
            label_pending: false,
        })
    }

    fn label(&mut self, id: LabelId) -> CodeLabel {
        *self
            .labels
            .entry(id)
            .or_insert_with(|| self.assembler.create_label())
    }

    fn set_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        if self.label_pending {
            self.assembler.zero_bytes().map_err(asm_err)?;
        }
        self.assembler.set_label(label).map_err(asm_err)?;
        self.label_pending = true;
        Ok(())
    }

    fn mark(&mut self, id: LabelId) -> Result<(), EncodingError> {
        let mut label = self.label(id);
        self.set_label(&mut label)?;
        self.labels.insert(id, label);
        Ok(())
    }

    /// Fresh label bound at the current position.
    fn anchor(&mut self) -> Result<CodeLabel, EncodingError> {
        let mut label = self.assembler.create_label();
        self.set_label(&mut label)?;
        Ok(label)
    }

    fn db(&mut self, data: &[u8]) -> Result<(), EncodingError> {
        if data.is_empty() {
            return Ok(());
        }
        self.assembler.db(data).map_err(asm_err)?;
        self.label_pending = false;
        Ok(())
    }

    fn arg(&mut self, operand: &Operand) -> Result<Arg, EncodingError> {
        match operand {
            Operand::Reg(r) => register(r),
            Operand::Mem(m) => memory(m).map(Arg::Mem),
            Operand::Imm(v) => Ok(Arg::Imm(*v)),
            Operand::Label(l) => Ok(Arg::Label(self.label(*l))),
            Operand::Var(_) => Err(EncodingError::UnresolvedOperand),
        }
    }

    fn encode(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError> {
        let mut args = Vec::with_capacity(operands.len());
        for (i, operand) in operands.iter().enumerate() {
            let arg = match (opcode, i, operand) {
                // Shift counts are always cl, whatever width the count variable has.
                (Opcode::Shl | Opcode::Shr | Opcode::Sar | Opcode::Rol | Opcode::Ror, 1, Operand::Reg(r)) => {
                    if r.reg != Reg::gp(gp::RCX) {
                        return Err(EncodingError::InvalidRegister);
                    }
                    Arg::R8(cl)
                }
                _ => self.arg(operand)?,
            };
            args.push(arg);
        }
        self.encode_args(opcode, &args)?.map_err(asm_err)?;
        self.label_pending = false;
        Ok(())
    }

    fn encode_args(&mut self, opcode: Opcode, args: &[Arg]) -> Result<Result<(), IcedError>, EncodingError> {
        let a = &mut self.assembler;
        let result = match opcode {
            Opcode::Nop => a.nop(),
            Opcode::Mov => match args {
                [Arg::R64(d), Arg::Imm(i)] => a.mov(*d, *i),
                _ => gp_binary_narrow!(a, mov, args),
            },
            Opcode::Add => gp_binary!(a, add, args),
            Opcode::Sub => gp_binary!(a, sub, args),
            Opcode::Adc => gp_binary!(a, adc, args),
            Opcode::Sbb => gp_binary!(a, sbb, args),
            Opcode::And => gp_binary!(a, and, args),
            Opcode::Or => gp_binary!(a, or, args),
            Opcode::Xor => gp_binary!(a, xor, args),
            Opcode::Cmp => gp_binary!(a, cmp, args),
            Opcode::Test => match args {
                [Arg::R64(d), Arg::Imm(i)] => a.test(*d, imm32(*i)?),
                [Arg::R32(d), Arg::Imm(i)] => a.test(*d, imm32(*i)?),
                [Arg::Mem(d), Arg::Imm(i)] => a.test(*d, imm32(*i)?),
                _ => gp_commutative!(a, test, args),
            },
            Opcode::Xchg => gp_commutative!(a, xchg, args),
            Opcode::Imul => match args {
                [Arg::R64(d), Arg::R64(s)] => a.imul_2(*d, *s),
                [Arg::R32(d), Arg::R32(s)] => a.imul_2(*d, *s),
                [Arg::R16(d), Arg::R16(s)] => a.imul_2(*d, *s),
                [Arg::R64(d), Arg::Mem(s)] => a.imul_2(*d, *s),
                [Arg::R32(d), Arg::Mem(s)] => a.imul_2(*d, *s),
                [Arg::R64(d), Arg::Imm(i)] => a.imul_3(*d, *d, imm32(*i)?),
                [Arg::R32(d), Arg::Imm(i)] => a.imul_3(*d, *d, imm32(*i)?),
                [Arg::R64(d), Arg::R64(s), Arg::Imm(i)] => a.imul_3(*d, *s, imm32(*i)?),
                [Arg::R32(d), Arg::R32(s), Arg::Imm(i)] => a.imul_3(*d, *s, imm32(*i)?),
                [Arg::R64(d), Arg::Mem(s), Arg::Imm(i)] => a.imul_3(*d, *s, imm32(*i)?),
                [Arg::R32(d), Arg::Mem(s), Arg::Imm(i)] => a.imul_3(*d, *s, imm32(*i)?),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::ImulWide => gp_unary!(a, imul, args),
            Opcode::Mul => gp_unary!(a, mul, args),
            Opcode::Div => gp_unary!(a, div, args),
            Opcode::Idiv => gp_unary!(a, idiv, args),
            Opcode::Neg => gp_unary!(a, neg, args),
            Opcode::Not => gp_unary!(a, not, args),
            Opcode::Inc => gp_unary!(a, inc, args),
            Opcode::Dec => gp_unary!(a, dec, args),
            Opcode::Shl => shift!(a, shl, args),
            Opcode::Shr => shift!(a, shr, args),
            Opcode::Sar => shift!(a, sar, args),
            Opcode::Rol => shift!(a, rol, args),
            Opcode::Ror => shift!(a, ror, args),
            Opcode::Lea => match args {
                [Arg::R64(d), Arg::Mem(s)] => a.lea(*d, *s),
                [Arg::R32(d), Arg::Mem(s)] => a.lea(*d, *s),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Push => match args {
                [Arg::R64(r)] => a.push(*r),
                [Arg::Mem(m)] => a.push(*m),
                [Arg::Imm(i)] => a.push(imm32(*i)?),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Pop => match args {
                [Arg::R64(r)] => a.pop(*r),
                [Arg::Mem(m)] => a.pop(*m),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Cpuid => a.cpuid(),
            Opcode::Rdtsc => a.rdtsc(),
            Opcode::RepMovsb => a.rep().movsb(),
            Opcode::RepStosb => a.rep().stosb(),
            Opcode::Jmp => match args {
                [Arg::Label(l)] => a.jmp(*l),
                [Arg::R64(r)] => a.jmp(*r),
                [Arg::Mem(m)] => a.jmp(*m),
                [Arg::Imm(i)] => a.jmp(*i as u64),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Jcc(condition) => match args {
                [Arg::Label(l)] => jcc(a, condition, *l),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Call => match args {
                [Arg::Label(l)] => a.call(*l),
                [Arg::R64(r)] => a.call(*r),
                [Arg::Mem(m)] => a.call(*m),
                [Arg::Imm(i)] => a.call(*i as u64),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Ret => match args {
                [] => a.ret(),
                [Arg::Imm(i)] => a.ret_1(imm32(*i)?),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Leave => a.leave(),
            Opcode::Emms => a.emms(),
            Opcode::Sfence => a.sfence(),
            Opcode::Lfence => a.lfence(),
            Opcode::Mfence => a.mfence(),
            Opcode::Movd => match args {
                [Arg::Xmm(d), Arg::R32(s)] => a.movd(*d, *s),
                [Arg::R32(d), Arg::Xmm(s)] => a.movd(*d, *s),
                [Arg::Xmm(d), Arg::Mem(s)] => a.movd(*d, *s),
                [Arg::Mem(d), Arg::Xmm(s)] => a.movd(*d, *s),
                [Arg::Mm(d), Arg::R32(s)] => a.movd(*d, *s),
                [Arg::R32(d), Arg::Mm(s)] => a.movd(*d, *s),
                [Arg::Mm(d), Arg::Mem(s)] => a.movd(*d, *s),
                [Arg::Mem(d), Arg::Mm(s)] => a.movd(*d, *s),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Movq => match args {
                [Arg::Xmm(d), Arg::Xmm(s)] => a.movq(*d, *s),
                [Arg::Xmm(d), Arg::R64(s)] => a.movq(*d, *s),
                [Arg::R64(d), Arg::Xmm(s)] => a.movq(*d, *s),
                [Arg::Xmm(d), Arg::Mem(s)] => a.movq(*d, *s),
                [Arg::Mem(d), Arg::Xmm(s)] => a.movq(*d, *s),
                [Arg::Mm(d), Arg::Mm(s)] => a.movq(*d, *s),
                [Arg::Mm(d), Arg::R64(s)] => a.movq(*d, *s),
                [Arg::R64(d), Arg::Mm(s)] => a.movq(*d, *s),
                [Arg::Mm(d), Arg::Mem(s)] => a.movq(*d, *s),
                [Arg::Mem(d), Arg::Mm(s)] => a.movq(*d, *s),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
            Opcode::Movss => sse_move!(a, movss, args),
            Opcode::Movsd => sse_move!(a, movsd_2, args),
            Opcode::Movaps => sse_move!(a, movaps, args),
            Opcode::Movapd => sse_move!(a, movapd, args),
            Opcode::Movups => sse_move!(a, movups, args),
            Opcode::Movupd => sse_move!(a, movupd, args),
            Opcode::Movdqa => sse_move!(a, movdqa, args),
            Opcode::Movdqu => sse_move!(a, movdqu, args),
            Opcode::Addss => sse!(a, addss, args),
            Opcode::Addsd => sse!(a, addsd, args),
            Opcode::Subss => sse!(a, subss, args),
            Opcode::Subsd => sse!(a, subsd, args),
            Opcode::Mulss => sse!(a, mulss, args),
            Opcode::Mulsd => sse!(a, mulsd, args),
            Opcode::Divss => sse!(a, divss, args),
            Opcode::Divsd => sse!(a, divsd, args),
            Opcode::Sqrtsd => sse!(a, sqrtsd, args),
            Opcode::Addps => sse!(a, addps, args),
            Opcode::Addpd => sse!(a, addpd, args),
            Opcode::Mulps => sse!(a, mulps, args),
            Opcode::Mulpd => sse!(a, mulpd, args),
            Opcode::Xorps => sse!(a, xorps, args),
            Opcode::Xorpd => sse!(a, xorpd, args),
            Opcode::Cvtss2sd => sse!(a, cvtss2sd, args),
            Opcode::Cvtsd2ss => sse!(a, cvtsd2ss, args),
            Opcode::Ucomisd => sse!(a, ucomisd, args),
            Opcode::Ucomiss => sse!(a, ucomiss, args),
            Opcode::Pxor => packed_int!(a, pxor, args),
            Opcode::Paddd => packed_int!(a, paddd, args),
            Opcode::Paddq => packed_int!(a, paddq, args),
            Opcode::Psubd => packed_int!(a, psubd, args),
            Opcode::Psubq => packed_int!(a, psubq, args),
            Opcode::Cvtsi2sd => int_to_float!(a, cvtsi2sd, args),
            Opcode::Cvtsi2ss => int_to_float!(a, cvtsi2ss, args),
            Opcode::Cvttsd2si => match args {
                [Arg::R64(d), Arg::Xmm(s)] => a.cvttsd2si(*d, *s),
                [Arg::R32(d), Arg::Xmm(s)] => a.cvttsd2si(*d, *s),
                [Arg::R64(d), Arg::Mem(s)] => a.cvttsd2si(*d, *s),
                [Arg::R32(d), Arg::Mem(s)] => a.cvttsd2si(*d, *s),
                _ => return Err(EncodingError::UnsupportedInstruction),
            },
        };
        Ok(result)
    }

    /// Give a trailing label an instruction to attach to.
    fn close(&mut self) -> Result<(), EncodingError> {
        if self.label_pending {
            self.assembler.zero_bytes().map_err(asm_err)?;
            self.label_pending = false;
        }
        Ok(())
    }
}

/// Recorded command, replayed when alignment padding must be recomputed.
#[derive(Debug, Clone)]
enum Command {
    Instruction(Opcode, Vec<Operand>),
    Label(LabelId),
    Align(u32),
    Data(Vec<u8>),
}

/// x86-64 encoder over the iced-x86 code assembler.
pub struct X64Encoder {
    stream: Stream,
    commands: Vec<Command>,
    defined: HashSet<LabelId>,
    marked: HashSet<LabelId>,
    base: u64,
    /// Byte size of the last `finish`.
    size: Option<usize>,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            stream: Stream::new()?,
            commands: Vec::new(),
            defined: HashSet::new(),
            marked: HashSet::new(),
            base: BASE_ADDRESS,
            size: None,
        })
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    fn has_alignment(&self) -> bool {
        self.commands.iter().any(|c| matches!(c, Command::Align(_)))
    }

    /// Assemble the recorded commands with `pads[k]` NOP bytes at the k-th
    /// alignment point; returns the code and each alignment point's address.
    fn replay(&self, pads: &[u32]) -> Result<(Vec<u8>, Vec<u64>), EncodingError> {
        let mut stream = Stream::new()?;
        let mut anchors = Vec::with_capacity(pads.len());
        for command in &self.commands {
            match command {
                Command::Instruction(opcode, operands) => stream.encode(*opcode, operands)?,
                Command::Label(label) => stream.mark(*label)?,
                Command::Data(data) => stream.db(data)?,
                Command::Align(_) => {
                    let pad = pads.get(anchors.len()).copied().unwrap_or(0);
                    anchors.push(stream.anchor()?);
                    stream.db(&vec![0x90; pad as usize])?;
                }
            }
        }
        stream.close()?;
        let result = stream
            .assembler
            .assemble_options(self.base, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;
        let addresses = anchors
            .iter()
            .map(|label| result.label_ip(label).map_err(asm_err))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((result.inner.code_buffer, addresses))
    }

    fn assemble_aligned(&self) -> Result<Vec<u8>, EncodingError> {
        let alignments: Vec<u64> = self
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Align(a) => Some(u64::from(*a)),
                _ => None,
            })
            .collect();
        let mut pads = vec![0u32; alignments.len()];
        for pass in 0..MAX_LAYOUT_PASSES {
            let (code, addresses) = self.replay(&pads)?;
            let needed: Vec<u32> = addresses
                .iter()
                .zip(&alignments)
                .map(|(&ip, &align)| ((align - (ip - self.base) % align) % align) as u32)
                .collect();
            if needed == pads {
                log::trace!("alignment layout stable after {} passes", pass + 1);
                return Ok(code);
            }
            pads = needed;
        }
        Err(EncodingError::AssemblyError(
            "alignment padding did not converge".to_string(),
        ))
    }
}

impl Encoder for X64Encoder {
    fn define_label(&mut self, label: LabelId) {
        if self.defined.insert(label) {
            self.stream.label(label);
        }
    }

    fn mark_label(&mut self, label: LabelId) -> Result<(), EncodingError> {
        if !self.defined.contains(&label) {
            return Err(EncodingError::AssemblyError(format!(
                "label {} is not defined",
                label.0
            )));
        }
        if !self.marked.insert(label) {
            return Err(EncodingError::AssemblyError(format!(
                "label {} bound twice",
                label.0
            )));
        }
        self.stream.mark(label)?;
        self.commands.push(Command::Label(label));
        Ok(())
    }

    fn is_label_marked(&self, label: LabelId) -> bool {
        self.marked.contains(&label)
    }

    fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError> {
        self.stream.encode(opcode, operands)?;
        self.commands
            .push(Command::Instruction(opcode, operands.to_vec()));
        Ok(())
    }

    fn align(&mut self, alignment: u32) -> Result<(), EncodingError> {
        if !alignment.is_power_of_two() {
            return Err(EncodingError::AssemblyError(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if alignment > 1 {
            self.commands.push(Command::Align(alignment));
        }
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> Result<(), EncodingError> {
        self.stream.db(data)?;
        self.commands.push(Command::Data(data.to_vec()));
        Ok(())
    }

    fn comment(&mut self, text: &str) {
        log::trace!("; {text}");
    }

    fn finish(&mut self) -> Result<Vec<u8>, EncodingError> {
        let code = if self.has_alignment() {
            self.assemble_aligned()?
        } else {
            self.stream.close()?;
            self.stream.assembler.assemble(self.base).map_err(asm_err)?
        };
        self.size = Some(code.len());
        Ok(code)
    }

    fn code_size(&self) -> usize {
        self.size
            .unwrap_or_else(|| self.stream.assembler.instructions().len())
    }
}
