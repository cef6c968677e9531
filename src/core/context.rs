// This module holds the per-function allocator state and the register allocation operations.
// CompilationContext is reset for every function: it owns the register file, the modified
// register masks the frame builder needs, the spill slot pool, the current item offset, the
// unreachable flag, and the two deferred jump queues (backward code still to translate and
// forward jumps still to reconcile). The allocation operations are implemented on
// CompilationSession because they emit code into the item graph while they run: alloc_var
// picks a register (free register with a caller/callee-saved preference, home register, or
// a spill candidate scored by priority, remaining distance and access counts) and emits
// exchanges, moves and loads as needed; spill_var, save_var and unuse_var move variables
// between register and memory; unuse_var_on_end_of_scope retires variables at their last
// use.

//! Compilation context and register allocation.

use std::collections::VecDeque;

use super::error::{CompileError, CompileResult};
use super::item::{FunctionId, InstructionItem, ItemId, ItemKind};
use super::memory::MemorySlotPool;
use super::operand::{Home, Mem, Opcode, Operand};
use super::register_file::{gp, Reg, RegClass, RegMask, RegisterFile, NUM_REG_CLASSES};
use super::session::CompilationSession;
use super::state::StateSnapshot;
use super::variable::{Access, VarId, VarState};

/// A jump to a target that was not translated yet when the jump was.
#[derive(Debug, Clone, Copy)]
pub struct ForwardJump<'a> {
    pub jump: ItemId,
    pub state: &'a StateSnapshot<'a>,
}

/// Allocator state of the function being compiled.
#[derive(Debug, Default)]
pub struct CompilationContext<'a> {
    pub function: Option<FunctionId>,
    /// Function item.
    pub start: Option<ItemId>,
    /// FunctionEnd item.
    pub stop: Option<ItemId>,
    /// Last item of the out-of-line reconciliation blocks.
    pub extra_block: Option<ItemId>,

    pub registers: RegisterFile,
    /// Registers written anywhere in the function.
    pub modified: [RegMask; NUM_REG_CLASSES],
    /// Callee-saved registers of the function's convention.
    pub preserved: [RegMask; NUM_REG_CLASSES],

    pub current_offset: u32,
    pub unreachable: bool,
    /// Translation is running; emitted items are prepared immediately.
    pub active: bool,

    pub backward_code: Vec<ItemId>,
    pub backward_pos: usize,
    pub forward_jumps: VecDeque<ForwardJump<'a>>,

    /// Fixed registers of the instruction being translated.
    pub reserved: [RegMask; NUM_REG_CLASSES],

    pub slots: MemorySlotPool,
    pub allocable_rbp: bool,
    pub is_caller: bool,
    /// Largest outgoing argument area of any call.
    pub call_stack_size: u32,
}

impl<'a> CompilationContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of deferred jumps not handled yet.
    pub fn pending_jumps(&self) -> usize {
        self.forward_jumps.len() + (self.backward_code.len() - self.backward_pos)
    }

    /// Registers the allocator may hand out.
    pub fn allocable(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Gp => {
                let mut mask = RegMask::all(class.count());
                mask.remove(gp::RSP);
                if !self.allocable_rbp {
                    mask.remove(gp::RBP);
                }
                mask
            }
            _ => RegMask::all(class.count()),
        }
    }

    pub fn mark_modified(&mut self, reg: Reg) {
        self.modified[reg.class.index()].insert(reg.index);
    }
}

fn first_with_preference(free: RegMask, preferred: RegMask) -> Option<u8> {
    (free & preferred).iter().next().or_else(|| free.iter().next())
}

impl<'a> CompilationSession<'a> {
    /// Emit a resolved instruction at the cursor while translating.
    pub(crate) fn emit_generated(
        &mut self,
        opcode: Opcode,
        operands: &[Operand],
    ) -> CompileResult<ItemId> {
        let operands = self.arena().alloc_slice_copy(operands);
        let id = self.graph.create(ItemKind::Instruction(InstructionItem {
            opcode,
            operands,
            records: &[],
            mem_vars: &[],
        }));
        self.graph.insert(id)?;
        if self.ctx.active {
            self.prepare_generated(id)?;
        }
        Ok(id)
    }

    /// Insert a comment item at the cursor.
    pub(crate) fn emit_generated_comment(&mut self, text: &'a str) -> CompileResult<ItemId> {
        let id = self.graph.create(ItemKind::Comment(text));
        self.graph.insert(id)?;
        Ok(id)
    }

    pub(crate) fn reg_operand(&self, id: VarId, index: u8) -> CompileResult<Operand> {
        let var = self.vars.get(id)?;
        Ok(Operand::reg(Reg::new(var.class, index), var.ty.reg_size()))
    }

    /// Memory operand addressing the home of `id`, acquiring a slot if needed.
    pub(crate) fn home_operand(&mut self, id: VarId) -> CompileResult<Operand> {
        let home = self.resolve_home(id)?;
        let size = self.vars.get(id)?.size;
        Ok(Operand::Mem(Mem::at_home(home, size)))
    }

    /// Bind the home of `id` to its stack argument or spill slot.
    pub(crate) fn resolve_home(&mut self, id: VarId) -> CompileResult<Home> {
        self.ensure_home(id)?;
        let var = self.vars.get(id)?;
        if var.is_mem_argument {
            return Ok(Home::Argument(var.home_memory_offset));
        }
        var.home_slot
            .map(Home::Slot)
            .ok_or_else(|| CompileError::usage(format!("variable {} has no home", id.0)))
    }

    pub(crate) fn ensure_home(&mut self, id: VarId) -> CompileResult<()> {
        let var = self.vars.get(id)?;
        if var.is_mem_argument || var.home_slot.is_some() {
            return Ok(());
        }
        let slot = self.ctx.slots.acquire(var.size);
        self.vars.get_mut(id)?.home_slot = Some(slot);
        Ok(())
    }

    /// Bind `id` to a register in `mask` (empty mask means any allocable register).
    pub(crate) fn alloc_var(&mut self, id: VarId, mask: RegMask, access: Access) -> CompileResult<()> {
        let (class, state, cur_reg, home_reg, first_callable, last_item) = {
            let var = self.vars.get(id)?;
            (
                var.class,
                var.state,
                var.reg,
                var.home_reg,
                var.first_callable,
                var.last_item,
            )
        };

        let allocable = self.ctx.allocable(class);
        let restricted = !mask.is_empty();
        let mask = if restricted { mask & allocable } else { allocable };
        if mask.is_empty() {
            return Err(CompileError::usage(format!(
                "no allocable register satisfies the request for variable {}",
                id.0
            )));
        }

        let non_preserved_first = !self.ctx.is_caller
            || match (first_callable, last_item) {
                (Some(call), Some(last)) => {
                    self.graph.offset(call).unwrap_or(0) >= self.graph.offset(last).unwrap_or(0)
                }
                _ => true,
            };
        let preserved = self.ctx.preserved[class.index()];
        let preferred = if non_preserved_first { !preserved } else { preserved };
        let used = self.ctx.registers.used(class);

        if state == VarState::Register {
            if let Some(reg) = cur_reg {
                if mask.contains(reg) {
                    self.post_alloc(id, access)?;
                    return Ok(());
                }
                let index = match first_with_preference(mask & !used, preferred) {
                    Some(index) => index,
                    None => (mask & used).iter().next().ok_or(CompileError::NotEnoughRegisters)?,
                };
                let other = self.ctx.registers.occupant(Reg::new(class, index));
                self.emit_exchange_var(id, index, access, other)?;
                self.post_alloc(id, access)?;
                return Ok(());
            }
        }

        let index = if restricted {
            match first_with_preference(mask & !used, preferred) {
                Some(index) => index,
                None => {
                    let index = (mask & used).iter().next().ok_or(CompileError::NotEnoughRegisters)?;
                    if let Some(other) = self.ctx.registers.occupant(Reg::new(class, index)) {
                        if self.vars.get(other)?.work_offset == Some(self.ctx.current_offset) {
                            self.relocate_var(other, mask)?;
                        } else {
                            self.spill_var(other)?;
                        }
                    }
                    index
                }
            }
        } else {
            let free = allocable & !used;
            match home_reg.filter(|&h| free.contains(h)) {
                Some(home) => home,
                None => {
                    let start = if class == RegClass::Gp { 1 } else { 0 };
                    let scan = RegMask(free.0 & !((1u32 << start) - 1));
                    match first_with_preference(scan, preferred) {
                        Some(index) => index,
                        None if free.contains(0) => 0,
                        None => {
                            let candidate = self
                                .spill_candidate(class)?
                                .ok_or(CompileError::NotEnoughRegisters)?;
                            let index = self
                                .vars
                                .get(candidate)?
                                .reg
                                .ok_or_else(|| CompileError::usage("spill candidate has no register"))?;
                            self.spill_var(candidate)?;
                            index
                        }
                    }
                }
            }
        };

        if state == VarState::Memory && access.reads() {
            self.emit_load_var(id, index)?;
        }

        let reg = Reg::new(class, index);
        {
            let var = self.vars.get_mut(id)?;
            var.state = VarState::Register;
            var.reg = Some(index);
            var.home_reg = Some(index);
        }
        self.ctx.registers.assign(reg, id);
        self.ctx.mark_modified(reg);
        self.stats_mut().registers_allocated += 1;
        log::trace!("allocated variable {} to {:?}", id.0, reg);

        self.post_alloc(id, access)
    }

    fn post_alloc(&mut self, id: VarId, access: Access) -> CompileResult<()> {
        if access.writes() {
            self.vars.get_mut(id)?.changed = true;
        }
        Ok(())
    }

    /// Best variable of `class` to evict, if any may be evicted.
    pub(crate) fn spill_candidate(&self, class: RegClass) -> CompileResult<Option<VarId>> {
        let current = self.ctx.current_offset as i64;
        let mut best: Option<(VarId, u32, i64)> = None;

        for index in (self.ctx.registers.used(class) & self.ctx.allocable(class)).iter() {
            let Some(id) = self.ctx.registers.occupant(Reg::new(class, index)) else {
                continue;
            };
            let var = self.vars.get(id)?;
            if var.work_offset == Some(self.ctx.current_offset) || var.priority == 0 {
                continue;
            }

            let last = var
                .last_item
                .and_then(|l| self.graph.offset(l))
                .map(|o| o as i64)
                .unwrap_or(current);
            let counts = &var.counts;
            let score = (last - current).max(0) - (counts.reg_write + counts.reg_rw) as i64
                + counts.reg_read as i64
                + (counts.mem_write + counts.mem_rw + counts.mem_read) as i64;

            let better = match best {
                None => true,
                Some((_, priority, best_score)) => {
                    var.priority > priority || (var.priority == priority && score > best_score)
                }
            };
            if better {
                best = Some((id, var.priority, score));
            }
        }

        Ok(best.map(|(id, _, _)| id))
    }

    /// Move `id` into register `index`, relocating its occupant `other`.
    fn emit_exchange_var(
        &mut self,
        id: VarId,
        index: u8,
        access: Access,
        other: Option<VarId>,
    ) -> CompileResult<()> {
        let (class, old_index) = {
            let var = self.vars.get(id)?;
            let old = var
                .reg
                .ok_or_else(|| CompileError::usage("exchanging a variable without register"))?;
            (var.class, old)
        };
        let new_reg = Reg::new(class, index);
        let old_reg = Reg::new(class, old_index);

        match other {
            None => {
                self.emit_move_var(id, index, access)?;
                self.ctx.registers.release(old_reg);
            }
            Some(other) if access == Access::Write => {
                // the occupant moves out, the written variable takes its register
                self.emit_move_var(other, old_index, Access::Read)?;
                self.vars.get_mut(other)?.reg = Some(old_index);
                self.vars.get_mut(other)?.home_reg = Some(old_index);
                self.ctx.registers.assign(old_reg, other);
            }
            Some(other) => {
                let a = self.reg_operand(id, old_index)?;
                let b = self.reg_operand(id, index)?;
                match class {
                    RegClass::Gp => {
                        self.emit_generated(Opcode::Xchg, &[Operand::gpq(old_index), Operand::gpq(index)])?;
                    }
                    _ => {
                        self.emit_generated(Opcode::Pxor, &[a, b])?;
                        self.emit_generated(Opcode::Pxor, &[b, a])?;
                        self.emit_generated(Opcode::Pxor, &[a, b])?;
                    }
                }
                self.vars.get_mut(other)?.reg = Some(old_index);
                self.vars.get_mut(other)?.home_reg = Some(old_index);
                self.ctx.registers.assign(old_reg, other);
            }
        }

        {
            let var = self.vars.get_mut(id)?;
            var.reg = Some(index);
            var.home_reg = Some(index);
        }
        self.ctx.registers.assign(new_reg, id);
        self.ctx.mark_modified(new_reg);
        self.ctx.mark_modified(old_reg);
        self.stats_mut().exchanges += 1;
        log::trace!("moved variable {} from {:?} to {:?}", id.0, old_reg, new_reg);
        Ok(())
    }

    /// Move `id`, an operand of the current item, out of the registers in `avoid`.
    /// Falls back to a spill when no other register is free.
    fn relocate_var(&mut self, id: VarId, avoid: RegMask) -> CompileResult<()> {
        let class = self.vars.get(id)?.class;
        let free = self.ctx.allocable(class)
            & !self.ctx.registers.used(class)
            & !self.ctx.reserved[class.index()]
            & !avoid;
        match free.iter().next() {
            Some(index) => {
                self.emit_exchange_var(id, index, Access::Read, None)?;
                log::trace!("relocated variable {} out of a fixed register", id.0);
            }
            None => self.spill_var(id)?,
        }
        Ok(())
    }

    /// Copy `id` from its register into register `index` when the access reads it.
    fn emit_move_var(&mut self, id: VarId, index: u8, access: Access) -> CompileResult<()> {
        if !access.reads() {
            return Ok(());
        }
        let var = self.vars.get(id)?;
        let opcode = var.ty.move_opcode();
        let from = var
            .reg
            .ok_or_else(|| CompileError::usage("moving a variable without register"))?;
        let dst = self.reg_operand(id, index)?;
        let src = self.reg_operand(id, from)?;
        self.emit_generated(opcode, &[dst, src])?;
        Ok(())
    }

    /// Load `id` from its home into register `index`.
    pub(crate) fn emit_load_var(&mut self, id: VarId, index: u8) -> CompileResult<()> {
        let opcode = self.vars.get(id)?.ty.move_opcode();
        let dst = self.reg_operand(id, index)?;
        let src = self.home_operand(id)?;
        self.emit_generated(opcode, &[dst, src])?;
        self.stats_mut().loads += 1;
        log::trace!("loaded variable {} into register {}", id.0, index);
        Ok(())
    }

    /// Store the register copy of `id` to its home. The variable stays in its register.
    pub(crate) fn save_var(&mut self, id: VarId) -> CompileResult<()> {
        let (opcode, index) = {
            let var = self.vars.get(id)?;
            let index = var
                .current_reg()
                .ok_or_else(|| CompileError::usage("saving a variable that is not in a register"))?
                .index;
            (var.ty.move_opcode(), index)
        };
        let dst = self.home_operand(id)?;
        let src = self.reg_operand(id, index)?;
        self.emit_generated(opcode, &[dst, src])?;
        self.vars.get_mut(id)?.changed = false;
        Ok(())
    }

    /// Flush `id` if dirty and release its register.
    pub(crate) fn spill_var(&mut self, id: VarId) -> CompileResult<()> {
        let var = self.vars.get(id)?;
        if var.current_reg().is_none() {
            return Err(CompileError::usage(format!(
                "spilling variable {} that is not in a register",
                id.0
            )));
        }
        if var.changed {
            self.save_var(id)?;
        }
        self.unuse_var(id, VarState::Memory)?;
        self.stats_mut().spills += 1;
        log::trace!("spilled variable {}", id.0);
        Ok(())
    }

    /// Release the register of `id` without storing it and move it to `state`.
    pub(crate) fn unuse_var(&mut self, id: VarId, state: VarState) -> CompileResult<()> {
        if let Some(reg) = self.vars.get(id)?.current_reg() {
            self.ctx.registers.release(reg);
        }
        if state == VarState::Memory {
            self.ensure_home(id)?;
        }
        let var = self.vars.get_mut(id)?;
        var.state = state;
        var.reg = None;
        var.changed = false;
        Ok(())
    }

    /// Retire `id` when `item` is its last use.
    pub(crate) fn unuse_var_on_end_of_scope(&mut self, item: ItemId, id: VarId) -> CompileResult<()> {
        if self.vars.get(id)?.last_item != Some(item) {
            return Ok(());
        }
        self.unuse_var(id, VarState::Unused)?;
        self.vars.remove_active(id);

        // A pending jump may still reconcile against a state holding this variable.
        if self.ctx.forward_jumps.is_empty() && self.ctx.backward_pos == self.ctx.backward_code.len() {
            let var = self.vars.get_mut(id)?;
            if !var.is_mem_argument {
                if let Some(slot) = var.home_slot.take() {
                    self.ctx.slots.release(slot);
                }
            }
        }
        Ok(())
    }

    /// Retire every active variable whose scope ends at `item`.
    pub(crate) fn unuse_active_on_end_of_scope(&mut self, item: ItemId) -> CompileResult<()> {
        for id in self.vars.active_ids() {
            self.unuse_var_on_end_of_scope(item, id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocable_excludes_stack_pointer() {
        let mut ctx = CompilationContext::new();
        let mask = ctx.allocable(RegClass::Gp);
        assert!(!mask.contains(gp::RSP));
        assert!(!mask.contains(gp::RBP));
        assert_eq!(mask.count(), 14);

        ctx.allocable_rbp = true;
        assert_eq!(ctx.allocable(RegClass::Gp).count(), 15);
        assert_eq!(ctx.allocable(RegClass::Mm).count(), 8);
        assert_eq!(ctx.allocable(RegClass::Xmm).count(), 16);
    }

    #[test]
    fn test_preference() {
        let free = RegMask(0b1110);
        assert_eq!(first_with_preference(free, RegMask::single(3)), Some(3));
        assert_eq!(first_with_preference(free, RegMask::EMPTY), Some(1));
        assert_eq!(first_with_preference(RegMask::EMPTY, RegMask(!0)), None);
    }

    #[test]
    fn test_pending_jumps() {
        let mut ctx = CompilationContext::new();
        ctx.backward_code.push(ItemId(4));
        assert_eq!(ctx.pending_jumps(), 1);
        ctx.backward_pos = 1;
        assert_eq!(ctx.pending_jumps(), 0);
    }
}
