// This module computes x86-64 stack frame geometry and synthesizes the prologue and epilogue.
// FrameLayout::compute takes what translation learned about a function (modified registers,
// spill bytes, whether it calls, the outgoing argument area) together with the calling
// convention facts and the function hints, and decides whether callee-saved GP registers are
// preserved with push/pop or with stores, how much padding keeps RSP 16-byte aligned at call
// sites, whether RSP is adjusted at all, and which register/offset address arguments and
// spill slots. Stack picture of an RSP-adjusted frame, from RSP upwards: outgoing call
// arguments, spill slots, register save area, alignment padding, pushed registers, saved
// RBP, return address. The prologue and epilogue are emitted as ordinary items right after
// the function's entry and exit targets.

//! Function frame layout and prologue/epilogue emission.

use crate::core::error::{CompileError, CompileResult};
use crate::core::operand::{Mem, Opcode, Operand};
use crate::core::register_file::{gp, Reg, RegClass, RegMask, NUM_REG_CLASSES};
use crate::core::session::{CompilationSession, CpuVendor, FunctionHints};

fn align_to_16(x: u32) -> u32 {
    (x + 15) & !15
}

fn delta_to_16(x: u32) -> u32 {
    align_to_16(x) - x
}

/// Everything the frame computation depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInput {
    pub hints: FunctionHints,
    pub is_caller: bool,
    pub stack_aligned_by_os: bool,
    pub modified: [RegMask; NUM_REG_CLASSES],
    pub preserved: [RegMask; NUM_REG_CLASSES],
    pub call_stack_size: u32,
    /// Extent of the spill slot area.
    pub mem_bytes: u32,
    /// Number of 16-byte spill slots.
    pub mem16_count: u32,
    /// Number of 8-byte spill slots.
    pub mem8_count: u32,
    /// Bytes below RSP usable without adjusting it.
    pub red_zone_size: u32,
    pub callee_pops_stack: bool,
    pub args_stack_size: u32,
    pub cpu_vendor: CpuVendor,
}

/// Final frame geometry of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub naked: bool,
    pub push_pop: bool,
    pub esp_adjusted: bool,
    pub aligned_by_function: bool,
    /// Callee-saved registers that are modified and must be preserved.
    pub saved: [RegMask; NUM_REG_CLASSES],
    pub push_pop_size: u32,
    pub mov_size: u32,
    pub adjust_size: u32,
    /// Spill area rounded to 16 bytes.
    pub mem_size16: u32,
    pub call_stack_size: u32,
    pub args_base: Reg,
    pub args_base_offset: i32,
    pub vars_base: Reg,
    pub vars_base_offset: i32,
    /// `movdqa` when saves are known to be aligned, `movdqu` otherwise.
    pub xmm_move: Opcode,
    pub emms: bool,
    pub sfence: bool,
    pub lfence: bool,
    pub ret_pop: u32,
    pub use_leave: bool,
}

impl FrameLayout {
    pub fn compute(input: &FrameInput) -> Self {
        let hints = input.hints;
        let naked = hints.naked;
        let push_pop = hints.push_pop_sequence;
        let mut esp_adjusted = input.is_caller;

        // 8/16-byte spill slots need an aligned stack; a naked frame cannot provide it
        let aligned_by_function =
            !input.stack_aligned_by_os && input.mem16_count + input.mem8_count > 0;
        if aligned_by_function {
            esp_adjusted = true;
        }

        let mut saved_gp = input.modified[RegClass::Gp.index()] & input.preserved[RegClass::Gp.index()];
        saved_gp.remove(gp::RSP);
        if !naked {
            // saved by the frame itself
            saved_gp.remove(gp::RBP);
        }
        let saved = [
            saved_gp,
            input.modified[RegClass::Mm.index()] & input.preserved[RegClass::Mm.index()],
            input.modified[RegClass::Xmm.index()] & input.preserved[RegClass::Xmm.index()],
        ];

        let mem_gp = saved[RegClass::Gp.index()].count() * 8;
        let mem_mm = saved[RegClass::Mm.index()].count() * 8;
        let mem_xmm = saved[RegClass::Xmm.index()].count() * 16;
        let (push_pop_size, mov_size) = if push_pop {
            (mem_gp, mem_xmm + align_to_16(mem_mm))
        } else {
            (0, mem_xmm + align_to_16(mem_mm + mem_gp))
        };

        let adjust_size = if aligned_by_function {
            delta_to_16(push_pop_size)
        } else {
            let mut v: i32 = 16 - 8;
            if !naked {
                v -= 8;
            }
            v -= (push_pop_size & 15) as i32;
            if v < 0 {
                v += 16;
            }
            v as u32
        };

        let mem_size16 = align_to_16(input.mem_bytes);
        let call_stack_size = input.call_stack_size;

        // anything past the red zone may be clobbered by a signal handler
        if mem_size16 + mov_size + adjust_size > input.red_zone_size {
            esp_adjusted = true;
        }

        let (args_base, args_base_offset) = if naked {
            let offset = if esp_adjusted {
                call_stack_size + mem_size16 + mov_size + push_pop_size + adjust_size
            } else {
                push_pop_size
            };
            (Reg::gp(gp::RSP), offset as i32)
        } else {
            (Reg::gp(gp::RBP), 8)
        };

        let vars_base_offset = if esp_adjusted {
            call_stack_size as i32
        } else {
            -((mem_size16 + mov_size + adjust_size) as i32)
        };

        let xmm_move = if input.stack_aligned_by_os || !naked {
            Opcode::Movdqa
        } else {
            Opcode::Movdqu
        };

        FrameLayout {
            naked,
            push_pop,
            esp_adjusted,
            aligned_by_function,
            saved,
            push_pop_size,
            mov_size,
            adjust_size,
            mem_size16,
            call_stack_size,
            args_base,
            args_base_offset,
            vars_base: Reg::gp(gp::RSP),
            vars_base_offset,
            xmm_move,
            emms: hints.emms,
            sfence: hints.sfence || hints.mfence,
            lfence: hints.lfence || hints.mfence,
            ret_pop: if input.callee_pops_stack { input.args_stack_size } else { 0 },
            use_leave: input.cpu_vendor == CpuVendor::Amd,
        }
    }

    /// Bytes subtracted from RSP by the prologue.
    pub fn stack_subtract(&self) -> u32 {
        self.call_stack_size + self.mem_size16 + self.mov_size + self.adjust_size
    }

    /// Bytes between the caller's RSP before its call and RSP inside the body.
    pub fn frame_size(&self) -> u32 {
        let mut size = 8 + self.push_pop_size;
        if !self.naked {
            size += 8;
        }
        if self.esp_adjusted {
            size += self.stack_subtract();
        }
        size
    }

    /// First RSP-relative offset of the register save area.
    fn save_area_start(&self) -> i32 {
        if self.esp_adjusted {
            (self.call_stack_size + self.mem_size16) as i32
        } else {
            -((self.mov_size + self.adjust_size) as i32)
        }
    }
}

fn rsp_mem(disp: i32, size: u32) -> Operand {
    Operand::Mem(Mem::base(Reg::gp(gp::RSP), disp, size))
}

impl<'a> CompilationSession<'a> {
    /// Emit the prologue at the cursor.
    pub(crate) fn emit_prolog(&mut self, frame: &FrameLayout) -> CompileResult<()> {
        if self.options.emit_comments {
            self.emit_generated_comment("prolog")?;
        }

        if !frame.naked {
            self.emit_generated(Opcode::Push, &[Operand::gpq(gp::RBP)])?;
            self.emit_generated(Opcode::Mov, &[Operand::gpq(gp::RBP), Operand::gpq(gp::RSP)])?;
        }

        if frame.aligned_by_function {
            if frame.naked {
                return Err(CompileError::NakedAlignment);
            }
            self.emit_generated(Opcode::And, &[Operand::gpq(gp::RSP), Operand::Imm(-16)])?;
        }

        let saved_gp = frame.saved[RegClass::Gp.index()];
        if frame.push_pop {
            for index in saved_gp.iter() {
                self.emit_generated(Opcode::Push, &[Operand::gpq(index)])?;
            }
        }

        if frame.esp_adjusted && frame.stack_subtract() != 0 {
            self.emit_generated(
                Opcode::Sub,
                &[Operand::gpq(gp::RSP), Operand::Imm(frame.stack_subtract() as i64)],
            )?;
        }

        let mut pos = frame.save_area_start();
        for index in frame.saved[RegClass::Xmm.index()].iter() {
            self.emit_generated(frame.xmm_move, &[rsp_mem(pos, 16), Operand::xmm(index)])?;
            pos += 16;
        }
        for index in frame.saved[RegClass::Mm.index()].iter() {
            self.emit_generated(Opcode::Movq, &[rsp_mem(pos, 8), Operand::mm(index)])?;
            pos += 8;
        }
        if !frame.push_pop {
            for index in saved_gp.iter() {
                self.emit_generated(Opcode::Mov, &[rsp_mem(pos, 8), Operand::gpq(index)])?;
                pos += 8;
            }
        }
        Ok(())
    }

    /// Emit the epilogue at the cursor.
    pub(crate) fn emit_epilog(&mut self, frame: &FrameLayout) -> CompileResult<()> {
        if self.options.emit_comments {
            self.emit_generated_comment("epilog")?;
        }

        let mut pos = frame.save_area_start();
        for index in frame.saved[RegClass::Xmm.index()].iter() {
            self.emit_generated(frame.xmm_move, &[Operand::xmm(index), rsp_mem(pos, 16)])?;
            pos += 16;
        }
        for index in frame.saved[RegClass::Mm.index()].iter() {
            self.emit_generated(Opcode::Movq, &[Operand::mm(index), rsp_mem(pos, 8)])?;
            pos += 8;
        }
        let saved_gp = frame.saved[RegClass::Gp.index()];
        if !frame.push_pop {
            for index in saved_gp.iter() {
                self.emit_generated(Opcode::Mov, &[Operand::gpq(index), rsp_mem(pos, 8)])?;
                pos += 8;
            }
        }

        if frame.esp_adjusted && frame.stack_subtract() != 0 {
            self.emit_generated(
                Opcode::Add,
                &[Operand::gpq(gp::RSP), Operand::Imm(frame.stack_subtract() as i64)],
            )?;
        }

        if frame.push_pop {
            let saved: Vec<u8> = saved_gp.iter().collect();
            for &index in saved.iter().rev() {
                self.emit_generated(Opcode::Pop, &[Operand::gpq(index)])?;
            }
        }

        if frame.emms {
            self.emit_generated(Opcode::Emms, &[])?;
        }
        match (frame.sfence, frame.lfence) {
            (true, true) => {
                self.emit_generated(Opcode::Mfence, &[])?;
            }
            (true, false) => {
                self.emit_generated(Opcode::Sfence, &[])?;
            }
            (false, true) => {
                self.emit_generated(Opcode::Lfence, &[])?;
            }
            (false, false) => {}
        }

        if !frame.naked {
            if frame.use_leave {
                self.emit_generated(Opcode::Leave, &[])?;
            } else {
                self.emit_generated(Opcode::Mov, &[Operand::gpq(gp::RSP), Operand::gpq(gp::RBP)])?;
                self.emit_generated(Opcode::Pop, &[Operand::gpq(gp::RBP)])?;
            }
        }

        if frame.ret_pop != 0 {
            self.emit_generated(Opcode::Ret, &[Operand::Imm(frame.ret_pop as i64)])?;
        } else {
            self.emit_generated(Opcode::Ret, &[])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::calling_convention::FunctionPrototype;

    fn input() -> FrameInput {
        let proto = FunctionPrototype::sysv(&[], &[]).unwrap();
        FrameInput {
            stack_aligned_by_os: true,
            preserved: proto.preserved,
            red_zone_size: proto.red_zone_size,
            ..FrameInput::default()
        }
    }

    #[test]
    fn test_leaf_function_uses_red_zone() {
        let mut inp = input();
        inp.mem_bytes = 12;
        let frame = FrameLayout::compute(&inp);
        assert!(!frame.esp_adjusted);
        assert_eq!(frame.mem_size16, 16);
        assert_eq!(frame.adjust_size, 0);
        assert_eq!(frame.vars_base_offset, -16);
        assert_eq!(frame.args_base, Reg::gp(gp::RBP));
        assert_eq!(frame.args_base_offset, 8);
    }

    #[test]
    fn test_leaf_spills_beyond_red_zone_adjust_rsp() {
        let mut inp = input();
        inp.mem_bytes = 128;
        let frame = FrameLayout::compute(&inp);
        assert!(!frame.esp_adjusted);
        assert_eq!(frame.vars_base_offset, -128);

        inp.mem_bytes = 136;
        let frame = FrameLayout::compute(&inp);
        assert!(frame.esp_adjusted);
        assert_eq!(frame.stack_subtract(), 144);
        assert_eq!(frame.vars_base_offset, 0);

        // the save area counts too
        inp.mem_bytes = 120;
        inp.modified[0] = RegMask::single(gp::RBX);
        let frame = FrameLayout::compute(&inp);
        assert_eq!(frame.mem_size16 + frame.mov_size, 144);
        assert!(frame.esp_adjusted);
    }

    #[test]
    fn test_no_red_zone_always_adjusts() {
        let mut inp = input();
        inp.red_zone_size = 0;
        inp.mem_bytes = 8;
        assert!(FrameLayout::compute(&inp).esp_adjusted);
        inp.mem_bytes = 0;
        assert!(!FrameLayout::compute(&inp).esp_adjusted);
    }

    #[test]
    fn test_caller_frame_is_aligned_at_calls() {
        for pushes in 0..4u8 {
            for push_pop in [false, true] {
                for naked in [false, true] {
                    let mut inp = input();
                    inp.is_caller = true;
                    inp.call_stack_size = 16;
                    inp.mem_bytes = 24;
                    inp.mem16_count = 1;
                    inp.hints.push_pop_sequence = push_pop;
                    inp.hints.naked = naked;
                    for r in [gp::RBX, gp::R12, gp::R13].iter().take(pushes as usize) {
                        inp.modified[0].insert(*r);
                    }
                    let frame = FrameLayout::compute(&inp);
                    assert!(frame.esp_adjusted);
                    assert_eq!(frame.frame_size() % 16, 0, "pushes={pushes} push_pop={push_pop} naked={naked}");
                }
            }
        }
    }

    #[test]
    fn test_mov_preservation_sizes() {
        let mut inp = input();
        inp.modified[0] = RegMask::single(gp::RBX) | RegMask::single(gp::R12) | RegMask::single(gp::RAX);
        inp.modified[2] = RegMask::single(6);
        let frame = FrameLayout::compute(&inp);
        assert_eq!(frame.saved[0].count(), 2);
        assert_eq!(frame.push_pop_size, 0);
        assert_eq!(frame.mov_size, 16);
        assert_eq!(frame.xmm_move, Opcode::Movdqa);

        inp.hints.push_pop_sequence = true;
        let frame = FrameLayout::compute(&inp);
        assert_eq!(frame.push_pop_size, 16);
        assert_eq!(frame.mov_size, 0);
    }

    #[test]
    fn test_naked_frame_addresses_arguments_from_rsp() {
        let mut inp = input();
        inp.hints.naked = true;
        inp.hints.push_pop_sequence = true;
        inp.modified[0] = RegMask::single(gp::RBP);
        let frame = FrameLayout::compute(&inp);
        assert_eq!(frame.saved[0], RegMask::single(gp::RBP));
        assert_eq!(frame.args_base, Reg::gp(gp::RSP));
        assert_eq!(frame.args_base_offset, 8);
        assert_eq!(frame.adjust_size, 0);
    }

    #[test]
    fn test_function_alignment_without_os_guarantee() {
        let mut inp = input();
        inp.stack_aligned_by_os = false;
        inp.mem_bytes = 16;
        inp.mem16_count = 1;
        let frame = FrameLayout::compute(&inp);
        assert!(frame.aligned_by_function);
        assert!(frame.esp_adjusted);
        assert_eq!(frame.vars_base_offset, 0);

        inp.hints.naked = true;
        let frame = FrameLayout::compute(&inp);
        assert!(frame.naked && frame.aligned_by_function);

        let mut inp = input();
        inp.stack_aligned_by_os = false;
        inp.mem_bytes = 8;
        inp.mem8_count = 1;
        assert!(FrameLayout::compute(&inp).aligned_by_function);
    }

    #[test]
    fn test_callee_pops_and_vendor() {
        let mut inp = input();
        inp.callee_pops_stack = true;
        inp.args_stack_size = 16;
        inp.cpu_vendor = CpuVendor::Amd;
        inp.hints.sfence = true;
        inp.hints.lfence = true;
        let frame = FrameLayout::compute(&inp);
        assert_eq!(frame.ret_pop, 16);
        assert!(frame.use_leave);
        assert!(frame.sfence && frame.lfence);
    }
}
