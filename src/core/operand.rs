// This module defines instruction operands and opcodes. Operands are small Copy values: a
// variable reference, a physical register, a memory reference (whose base, index, or home
// slot may still name a variable), an immediate, or a label. Before emission every variable
// reference is rewritten into a register or a concrete stack address, so the encoder only
// sees resolved operands. Opcode also carries the access metadata the allocator needs:
// whether operand 0 is read, written, or both, which operands are bound to fixed registers
// (shift counts, widening multiply/divide, cpuid, rdtsc, string instructions), and which
// opcodes turn into pure writes when both operands name the same variable (zeroing idiom).

//! Operands, opcodes and per-opcode access metadata.

use super::item::LabelId;
use super::memory::SlotId;
use super::register_file::{gp, Reg};
use super::variable::{Access, VarId};

/// Reference to a variable as an instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarRef {
    pub id: VarId,
    /// Operand width in bytes.
    pub size: u32,
}

/// Resolved physical register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOperand {
    pub reg: Reg,
    pub size: u32,
}

/// Base or index of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBase {
    Reg(Reg),
    Var(VarId),
}

/// Home location of a variable addressed by a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// Not bound yet; resolved by translation.
    Var(VarId),
    /// Spill slot, offset known after slot layout.
    Slot(SlotId),
    /// Stack argument at this offset from the arguments base.
    Argument(i32),
}

/// Memory operand `[base + index * scale + disp]`.
///
/// When `home` is set the operand addresses a variable's home and `base` is
/// filled in by the displacement patch pass once the frame is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Option<MemBase>,
    pub index: Option<MemBase>,
    pub scale: u8,
    pub disp: i32,
    /// Access width in bytes, 0 when unsized.
    pub size: u32,
    pub home: Option<Home>,
}

impl Mem {
    pub fn base(reg: Reg, disp: i32, size: u32) -> Self {
        Self {
            base: Some(MemBase::Reg(reg)),
            index: None,
            scale: 1,
            disp,
            size,
            home: None,
        }
    }

    /// `[var + disp]` with a pointer held in a variable.
    pub fn var_base(var: VarId, disp: i32, size: u32) -> Self {
        Self {
            base: Some(MemBase::Var(var)),
            index: None,
            scale: 1,
            disp,
            size,
            home: None,
        }
    }

    /// The home stack slot of `var`.
    pub fn home(var: VarId, size: u32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            size,
            home: Some(Home::Var(var)),
        }
    }

    pub(crate) fn at_home(home: Home, size: u32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            size,
            home: Some(home),
        }
    }

    /// Variable whose home this operand addresses, before translation.
    pub fn home_var(&self) -> Option<VarId> {
        match self.home {
            Some(Home::Var(v)) => Some(v),
            _ => None,
        }
    }

    pub fn with_index(mut self, index: MemBase, scale: u8) -> Self {
        self.index = Some(index);
        self.scale = scale;
        self
    }

    /// Variables used to form the address.
    pub fn address_vars(&self) -> impl Iterator<Item = VarId> {
        let base = match self.base {
            Some(MemBase::Var(v)) => Some(v),
            _ => None,
        };
        let index = match self.index {
            Some(MemBase::Var(v)) => Some(v),
            _ => None,
        };
        base.into_iter().chain(index)
    }

    pub fn is_resolved(&self) -> bool {
        self.home.is_none()
            && !matches!(self.base, Some(MemBase::Var(_)))
            && !matches!(self.index, Some(MemBase::Var(_)))
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Var(VarRef),
    Reg(RegOperand),
    Mem(Mem),
    Imm(i64),
    Label(LabelId),
}

impl Operand {
    pub fn reg(reg: Reg, size: u32) -> Self {
        Operand::Reg(RegOperand { reg, size })
    }

    pub fn gpq(index: u8) -> Self {
        Operand::reg(Reg::gp(index), 8)
    }

    pub fn gpd(index: u8) -> Self {
        Operand::reg(Reg::gp(index), 4)
    }

    pub fn xmm(index: u8) -> Self {
        Operand::reg(Reg::xmm(index), 16)
    }

    pub fn mm(index: u8) -> Self {
        Operand::reg(Reg::mm(index), 8)
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(v.id),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Operand::Var(_) => false,
            Operand::Mem(m) => m.is_resolved(),
            _ => true,
        }
    }
}

impl From<VarRef> for Operand {
    fn from(v: VarRef) -> Self {
        Operand::Var(v)
    }
}

impl From<LabelId> for Operand {
    fn from(l: LabelId) -> Self {
        Operand::Label(l)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Self {
        Operand::Mem(m)
    }
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    S,
    Ns,
    O,
    No,
    P,
    Np,
}

/// Opcodes understood by the allocator and the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Mov,
    Add,
    Sub,
    Adc,
    Sbb,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    /// Two or three operand signed multiply.
    Imul,
    /// `hi:lo = lo * src` (signed), operands `[hi, lo, src]`.
    ImulWide,
    /// `hi:lo = lo * src`, operands `[hi, lo, src]`.
    Mul,
    /// `lo = hi:lo / src; hi = remainder`, operands `[hi, lo, src]`.
    Div,
    Idiv,
    Neg,
    Not,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Lea,
    Push,
    Pop,
    Xchg,
    /// Operands `[eax, ebx, ecx, edx]`.
    Cpuid,
    /// Operands `[edx, eax]`.
    Rdtsc,
    /// Operands `[rdi, rsi, rcx]`.
    RepMovsb,
    /// Operands `[rdi, rax, rcx]`.
    RepStosb,
    Jmp,
    Jcc(Condition),
    Call,
    Ret,
    Leave,
    Emms,
    Sfence,
    Lfence,
    Mfence,
    Movd,
    Movq,
    Movss,
    Movsd,
    Movaps,
    Movapd,
    Movups,
    Movupd,
    Movdqa,
    Movdqu,
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Sqrtsd,
    Addps,
    Addpd,
    Mulps,
    Mulpd,
    Xorps,
    Xorpd,
    Pxor,
    Paddd,
    Paddq,
    Psubd,
    Psubq,
    Cvtsi2sd,
    Cvtsi2ss,
    Cvtss2sd,
    Cvtsd2ss,
    Cvttsd2si,
    Ucomisd,
    Ucomiss,
}

/// Allocation constraint of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandConstraint {
    pub access: Access,
    /// Register index the variable must occupy.
    pub fixed: Option<u8>,
}

impl OperandConstraint {
    const fn new(access: Access, fixed: Option<u8>) -> Self {
        Self { access, fixed }
    }
}

impl Opcode {
    /// Opcodes whose first operand is only written.
    fn writes_first(self, operand_count: usize) -> bool {
        match self {
            Opcode::Mov
            | Opcode::Movd
            | Opcode::Movq
            | Opcode::Movss
            | Opcode::Movsd
            | Opcode::Movaps
            | Opcode::Movapd
            | Opcode::Movups
            | Opcode::Movupd
            | Opcode::Movdqa
            | Opcode::Movdqu
            | Opcode::Lea
            | Opcode::Pop
            | Opcode::Sqrtsd
            | Opcode::Cvtsi2sd
            | Opcode::Cvtsi2ss
            | Opcode::Cvtss2sd
            | Opcode::Cvtsd2ss
            | Opcode::Cvttsd2si => true,
            Opcode::Imul => operand_count == 3,
            _ => false,
        }
    }

    /// Opcodes whose first operand is only read.
    fn reads_first(self) -> bool {
        matches!(
            self,
            Opcode::Cmp
                | Opcode::Test
                | Opcode::Ucomisd
                | Opcode::Ucomiss
                | Opcode::Push
                | Opcode::Jmp
                | Opcode::Jcc(_)
                | Opcode::Call
                | Opcode::Ret
        )
    }

    /// Access and register binding of operand `index`.
    pub fn constraint(self, index: usize, operand_count: usize) -> OperandConstraint {
        use Access::*;
        match self {
            Opcode::Shl | Opcode::Shr | Opcode::Sar | Opcode::Rol | Opcode::Ror if index == 1 => {
                OperandConstraint::new(Read, Some(gp::RCX))
            }
            Opcode::Mul | Opcode::ImulWide => match index {
                0 => OperandConstraint::new(Write, Some(gp::RDX)),
                1 => OperandConstraint::new(ReadWrite, Some(gp::RAX)),
                _ => OperandConstraint::new(Read, None),
            },
            Opcode::Div | Opcode::Idiv => match index {
                0 => OperandConstraint::new(ReadWrite, Some(gp::RDX)),
                1 => OperandConstraint::new(ReadWrite, Some(gp::RAX)),
                _ => OperandConstraint::new(Read, None),
            },
            Opcode::Cpuid => match index {
                0 => OperandConstraint::new(ReadWrite, Some(gp::RAX)),
                1 => OperandConstraint::new(Write, Some(gp::RBX)),
                2 => OperandConstraint::new(Write, Some(gp::RCX)),
                _ => OperandConstraint::new(Write, Some(gp::RDX)),
            },
            Opcode::Rdtsc => match index {
                0 => OperandConstraint::new(Write, Some(gp::RDX)),
                _ => OperandConstraint::new(Write, Some(gp::RAX)),
            },
            Opcode::RepMovsb => match index {
                0 => OperandConstraint::new(Read, Some(gp::RDI)),
                1 => OperandConstraint::new(Read, Some(gp::RSI)),
                _ => OperandConstraint::new(ReadWrite, Some(gp::RCX)),
            },
            Opcode::RepStosb => match index {
                0 => OperandConstraint::new(Read, Some(gp::RDI)),
                1 => OperandConstraint::new(Read, Some(gp::RAX)),
                _ => OperandConstraint::new(ReadWrite, Some(gp::RCX)),
            },
            Opcode::Xchg => OperandConstraint::new(ReadWrite, None),
            _ if index > 0 => OperandConstraint::new(Read, None),
            _ if self.reads_first() => OperandConstraint::new(Read, None),
            _ if self.writes_first(operand_count) => OperandConstraint::new(Write, None),
            _ => OperandConstraint::new(ReadWrite, None),
        }
    }

    /// `op x, x` only writes `x`.
    pub fn is_zeroing_idiom(self) -> bool {
        matches!(
            self,
            Opcode::Xor
                | Opcode::Sub
                | Opcode::Pxor
                | Opcode::Xorps
                | Opcode::Xorpd
                | Opcode::Psubd
                | Opcode::Psubq
        )
    }

    /// Operands that are passed to the encoder. Fixed-register opcodes have
    /// implicit operands that the hardware encoding does not name.
    pub fn explicit_operands<'o>(self, operands: &'o [Operand]) -> &'o [Operand] {
        match self {
            Opcode::Mul | Opcode::ImulWide | Opcode::Div | Opcode::Idiv => {
                operands.get(2..).unwrap_or(&[])
            }
            Opcode::Cpuid | Opcode::Rdtsc | Opcode::RepMovsb | Opcode::RepStosb => &[],
            _ => operands,
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jcc(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Mov => "mov",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Adc => "adc",
            Opcode::Sbb => "sbb",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Imul | Opcode::ImulWide => "imul",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Idiv => "idiv",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Inc => "inc",
            Opcode::Dec => "dec",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Sar => "sar",
            Opcode::Rol => "rol",
            Opcode::Ror => "ror",
            Opcode::Lea => "lea",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Xchg => "xchg",
            Opcode::Cpuid => "cpuid",
            Opcode::Rdtsc => "rdtsc",
            Opcode::RepMovsb => "rep movsb",
            Opcode::RepStosb => "rep stosb",
            Opcode::Jmp => "jmp",
            Opcode::Jcc(_) => "jcc",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Leave => "leave",
            Opcode::Emms => "emms",
            Opcode::Sfence => "sfence",
            Opcode::Lfence => "lfence",
            Opcode::Mfence => "mfence",
            Opcode::Movd => "movd",
            Opcode::Movq => "movq",
            Opcode::Movss => "movss",
            Opcode::Movsd => "movsd",
            Opcode::Movaps => "movaps",
            Opcode::Movapd => "movapd",
            Opcode::Movups => "movups",
            Opcode::Movupd => "movupd",
            Opcode::Movdqa => "movdqa",
            Opcode::Movdqu => "movdqu",
            Opcode::Addss => "addss",
            Opcode::Addsd => "addsd",
            Opcode::Subss => "subss",
            Opcode::Subsd => "subsd",
            Opcode::Mulss => "mulss",
            Opcode::Mulsd => "mulsd",
            Opcode::Divss => "divss",
            Opcode::Divsd => "divsd",
            Opcode::Sqrtsd => "sqrtsd",
            Opcode::Addps => "addps",
            Opcode::Addpd => "addpd",
            Opcode::Mulps => "mulps",
            Opcode::Mulpd => "mulpd",
            Opcode::Xorps => "xorps",
            Opcode::Xorpd => "xorpd",
            Opcode::Pxor => "pxor",
            Opcode::Paddd => "paddd",
            Opcode::Paddq => "paddq",
            Opcode::Psubd => "psubd",
            Opcode::Psubq => "psubq",
            Opcode::Cvtsi2sd => "cvtsi2sd",
            Opcode::Cvtsi2ss => "cvtsi2ss",
            Opcode::Cvtss2sd => "cvtss2sd",
            Opcode::Cvtsd2ss => "cvtsd2ss",
            Opcode::Cvttsd2si => "cvttsd2si",
            Opcode::Ucomisd => "ucomisd",
            Opcode::Ucomiss => "ucomiss",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_operand_access() {
        assert_eq!(Opcode::Mov.constraint(0, 2).access, Access::Write);
        assert_eq!(Opcode::Add.constraint(0, 2).access, Access::ReadWrite);
        assert_eq!(Opcode::Cmp.constraint(0, 2).access, Access::Read);
        assert_eq!(Opcode::Imul.constraint(0, 2).access, Access::ReadWrite);
        assert_eq!(Opcode::Imul.constraint(0, 3).access, Access::Write);
        assert_eq!(Opcode::Add.constraint(1, 2).access, Access::Read);
        assert_eq!(Opcode::Xchg.constraint(1, 2).access, Access::ReadWrite);
    }

    #[test]
    fn test_fixed_registers() {
        assert_eq!(Opcode::Shl.constraint(1, 2).fixed, Some(gp::RCX));
        assert_eq!(Opcode::Shl.constraint(0, 2).fixed, None);
        let hi = Opcode::Mul.constraint(0, 3);
        assert_eq!((hi.access, hi.fixed), (Access::Write, Some(gp::RDX)));
        let lo = Opcode::Idiv.constraint(1, 3);
        assert_eq!((lo.access, lo.fixed), (Access::ReadWrite, Some(gp::RAX)));
        assert_eq!(Opcode::RepStosb.constraint(1, 3).fixed, Some(gp::RAX));
        assert_eq!(Opcode::Rdtsc.constraint(0, 2).fixed, Some(gp::RDX));
    }

    #[test]
    fn test_explicit_operands() {
        let ops = [Operand::gpq(gp::RDX), Operand::gpq(gp::RAX), Operand::gpq(gp::RBX)];
        assert_eq!(Opcode::Mul.explicit_operands(&ops), &ops[2..]);
        assert!(Opcode::Cpuid.explicit_operands(&ops).is_empty());
        assert_eq!(Opcode::Add.explicit_operands(&ops[..2]).len(), 2);
    }

    #[test]
    fn test_memory_operand_vars() {
        let mem = Mem::var_base(VarId(1), 8, 8).with_index(MemBase::Var(VarId(2)), 4);
        assert_eq!(mem.address_vars().collect::<Vec<_>>(), vec![VarId(1), VarId(2)]);
        assert!(!mem.is_resolved());
        assert!(Mem::base(Reg::gp(gp::RSP), 16, 8).is_resolved());
        assert!(!Mem::home(VarId(0), 8).is_resolved());
    }
}
