// This module implements the System V AMD64 ABI calling convention for x86-64 Linux/Unix systems.
// It provides the CCAssigner trait and the SysVAssigner implementation that place arguments and
// return values, and FunctionPrototype which records the result for one signature: GP
// arguments pass in RDI, RSI, RDX, RCX, R8, R9 (first 6), float and vector arguments in
// XMM0-XMM7 (first 8), the remaining arguments go on the stack in 8-byte slots assigned left to
// right from the lowest address, return values use RAX/RDX (GP), XMM0/XMM1 (SSE) or MM0 (MMX).
// The prototype also carries the callee-saved masks per register class (RBX, RBP, R12-R15; no
// vector registers), the masks of registers used to pass arguments, the 16-byte aligned size
// of the outgoing stack argument area, and the stack alignment and cleanup facts the frame
// builder queries.

//! System V x86-64 calling convention implementation.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{gp, Reg, RegClass, RegMask, NUM_REG_CLASSES};
use crate::core::variable::VariableType;

/// Where an argument is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Register(Reg),
    /// Byte offset of the stack slot from the stack pointer at the call site.
    Stack(i32),
}

/// One assigned argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentInfo {
    pub ty: VariableType,
    pub location: ArgLocation,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign the next argument.
    fn assign_arg(&mut self, ty: VariableType) -> CompileResult<ArgLocation>;

    /// Register for the `index`-th return value.
    fn assign_ret(&mut self, ty: VariableType, index: usize) -> CompileResult<Reg>;

    /// Reset state for a new signature.
    fn reset(&mut self);

    /// Stack space used by arguments, 16-byte aligned.
    fn get_stack_size(&self) -> u32;

    /// Callee-saved registers per class.
    fn preserved(&self) -> [RegMask; NUM_REG_CLASSES];

    fn callee_pops_stack(&self) -> bool;

    fn stack_aligned_by_os(&self) -> bool;

    /// Bytes below RSP that a leaf function may use without adjusting RSP.
    fn red_zone_size(&self) -> u32 {
        0
    }
}

/// System V x86-64 calling convention assigner.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    /// Current GP argument register index.
    gp_cnt: usize,
    /// Current XMM argument register index.
    xmm_cnt: usize,
    /// Current stack offset for arguments.
    stack: u32,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [u8; 6] = [gp::RDI, gp::RSI, gp::RDX, gp::RCX, gp::R8, gp::R9];

    /// System V x86-64 XMM argument registers.
    pub const XMM_ARG_REGS: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

    /// GP return value registers.
    pub const RET_GP_REGS: [u8; 2] = [gp::RAX, gp::RDX];

    /// XMM return value registers.
    pub const RET_XMM_REGS: [u8; 2] = [0, 1];

    const CALLEE_SAVED_GP: [u8; 6] = [gp::RBX, gp::RBP, gp::R12, gp::R13, gp::R14, gp::R15];

    /// Create a new System V calling convention assigner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Align a value up to the specified alignment.
    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }

    fn assign_stack(&mut self, size: u32) -> ArgLocation {
        let size = Self::align_up(size, 8);
        let offset = self.stack;
        self.stack += size;
        ArgLocation::Stack(offset as i32)
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, ty: VariableType) -> CompileResult<ArgLocation> {
        match ty.class() {
            Some(RegClass::Gp) => {
                if self.gp_cnt < Self::GP_ARG_REGS.len() {
                    let reg = Reg::gp(Self::GP_ARG_REGS[self.gp_cnt]);
                    self.gp_cnt += 1;
                    Ok(ArgLocation::Register(reg))
                } else {
                    Ok(self.assign_stack(8))
                }
            }
            Some(RegClass::Xmm) => {
                if self.xmm_cnt < Self::XMM_ARG_REGS.len() {
                    let reg = Reg::xmm(Self::XMM_ARG_REGS[self.xmm_cnt]);
                    self.xmm_cnt += 1;
                    Ok(ArgLocation::Register(reg))
                } else {
                    Ok(self.assign_stack(ty.size()))
                }
            }
            Some(RegClass::Mm) => Ok(self.assign_stack(8)),
            None => Err(CompileError::Unsupported {
                what: format!("{ty:?} arguments"),
            }),
        }
    }

    fn assign_ret(&mut self, ty: VariableType, index: usize) -> CompileResult<Reg> {
        let reg = match ty.class() {
            Some(RegClass::Gp) => Self::RET_GP_REGS.get(index).map(|&r| Reg::gp(r)),
            Some(RegClass::Xmm) => Self::RET_XMM_REGS.get(index).map(|&r| Reg::xmm(r)),
            Some(RegClass::Mm) if index == 0 => Some(Reg::mm(0)),
            _ => None,
        };
        reg.ok_or_else(|| CompileError::Unsupported {
            what: format!("{ty:?} return value #{index}"),
        })
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
        self.stack = 0;
    }

    fn get_stack_size(&self) -> u32 {
        // Align stack to 16-byte boundary as required by System V ABI
        Self::align_up(self.stack, 16)
    }

    fn preserved(&self) -> [RegMask; NUM_REG_CLASSES] {
        let mut gp_mask = RegMask::EMPTY;
        for r in Self::CALLEE_SAVED_GP {
            gp_mask.insert(r);
        }
        [gp_mask, RegMask::EMPTY, RegMask::EMPTY]
    }

    fn callee_pops_stack(&self) -> bool {
        false
    }

    fn stack_aligned_by_os(&self) -> bool {
        true
    }

    fn red_zone_size(&self) -> u32 {
        128
    }
}

/// Argument and return placement of one function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionPrototype {
    pub args: Vec<ArgumentInfo>,
    pub returns: Vec<(VariableType, Reg)>,
    /// Outgoing stack argument area, 16-byte aligned.
    pub args_stack_size: u32,
    pub preserved: [RegMask; NUM_REG_CLASSES],
    /// Registers carrying arguments.
    pub passed: [RegMask; NUM_REG_CLASSES],
    pub callee_pops_stack: bool,
    pub stack_aligned_by_os: bool,
    pub red_zone_size: u32,
}

impl FunctionPrototype {
    /// System V prototype for `args` returning `returns` (at most two values).
    pub fn sysv(args: &[VariableType], returns: &[VariableType]) -> CompileResult<Self> {
        Self::with_assigner(&mut SysVAssigner::new(), args, returns)
    }

    pub fn with_assigner(
        assigner: &mut dyn CCAssigner,
        args: &[VariableType],
        returns: &[VariableType],
    ) -> CompileResult<Self> {
        assigner.reset();
        let mut passed = [RegMask::EMPTY; NUM_REG_CLASSES];
        let mut assigned = Vec::with_capacity(args.len());
        for &ty in args {
            let location = assigner.assign_arg(ty)?;
            if let ArgLocation::Register(reg) = location {
                passed[reg.class.index()].insert(reg.index);
            }
            assigned.push(ArgumentInfo { ty, location });
        }

        let mut rets = Vec::with_capacity(returns.len());
        for (index, &ty) in returns.iter().enumerate() {
            rets.push((ty, assigner.assign_ret(ty, index)?));
        }

        Ok(Self {
            args: assigned,
            returns: rets,
            args_stack_size: assigner.get_stack_size(),
            preserved: assigner.preserved(),
            passed,
            callee_pops_stack: assigner.callee_pops_stack(),
            stack_aligned_by_os: assigner.stack_aligned_by_os(),
            red_zone_size: assigner.red_zone_size(),
        })
    }

    pub fn preserved(&self, class: RegClass) -> RegMask {
        self.preserved[class.index()]
    }

    pub fn passed(&self, class: RegClass) -> RegMask {
        self.passed[class.index()]
    }
}
