// This module implements the four passes every item of a function goes through. Prepare walks
// the function once in order, numbers the items, merges the operand accesses of each
// instruction into allocation records, and computes variable live ranges (first and last
// item, first call inside the range) and access counts. Translate is driven by the compiler
// along control flow: it allocates registers for each item, rewrites variable operands into
// registers or stack homes, records state snapshots at targets and reconciles the context at
// jumps. Emit hands the resolved items to the encoder, and post checks that every jump
// target was bound. Items generated while translating (spills, loads, moves, reconciliation
// blocks) are prepared on the spot and count as already translated.

//! Per-item prepare, translate, emit and post passes.

use super::context::ForwardJump;
use super::encoder::{Encoder, EncodingError};
use super::error::{CompileError, CompileResult};
use super::item::{
    BranchHint, CallItem, FunctionId, HintItem, HintKind, InstructionItem, ItemId, ItemKind,
    JumpItem, LabelId, ReturnItem, TargetItem, VarAllocRecord,
};
use super::operand::{Home, Mem, MemBase, Opcode, Operand, RegOperand};
use super::register_file::{gp, Reg, RegClass, RegMask, NUM_REG_CLASSES};
use super::session::CompilationSession;
use super::state::StateSnapshot;
use super::variable::{Access, VarId, VarState, VariableType};
use crate::x64::calling_convention::{ArgLocation, FunctionPrototype};
use crate::x64::frame::FrameLayout;

/// Merge one operand access into the records of an instruction.
fn add_record(
    records: &mut Vec<VarAllocRecord>,
    var: VarId,
    access: Access,
    fixed: Option<u8>,
) -> CompileResult<()> {
    match records.iter_mut().find(|r| r.var == var) {
        Some(record) => {
            record.access = record.access.merge(access);
            match (record.fixed, fixed) {
                (Some(a), Some(b)) if a != b => {
                    return Err(CompileError::usage(format!(
                        "variable {} is bound to two fixed registers",
                        var.0
                    )));
                }
                (None, Some(b)) => record.fixed = Some(b),
                _ => {}
            }
        }
        None => records.push(VarAllocRecord { var, access, fixed }),
    }
    Ok(())
}

/// Source of a register argument at a call site.
#[derive(Debug, Clone, Copy)]
enum ArgSource {
    Reg(Reg),
    Home(VarId),
    Imm(i64),
}

impl<'a> CompilationSession<'a> {
    /// Extend the live range of `id` to `item`.
    fn touch_var(&mut self, item: ItemId, id: VarId) -> CompileResult<()> {
        let function = self.ctx.function.ok_or(CompileError::NoFunction)?;
        let var = self.vars.get_mut(id)?;
        if var.function != function {
            return Err(CompileError::usage(format!(
                "variable {} belongs to another function",
                id.0
            )));
        }
        if var.first_item.is_none() {
            var.first_item = Some(item);
        }
        var.last_item = Some(item);
        self.vars.add_active(id)
    }

    // ---- prepare ----

    /// Number `id` and compute the live ranges it contributes to.
    pub(crate) fn prepare_item(&mut self, id: ItemId) -> CompileResult<()> {
        let offset = self.ctx.current_offset;
        self.graph.get_mut(id)?.offset = Some(offset);

        match self.graph.kind(id)? {
            ItemKind::Instruction(inst) => self.prepare_instruction(id, inst)?,
            ItemKind::Jump(jump) => self.prepare_jump(id, jump)?,
            ItemKind::Function(function) => self.prepare_function_item(id, function)?,
            ItemKind::Return(ret) => self.prepare_return(id, ret)?,
            ItemKind::Call(call) => self.prepare_call(id, call)?,
            ItemKind::Hint(hint) => {
                // hints share the offset of the item they precede
                return self.touch_var(id, hint.var);
            }
            ItemKind::Target(_) | ItemKind::FunctionEnd(_) => {}
            ItemKind::Align(_) | ItemKind::Comment(_) | ItemKind::EmbeddedData(_) => {
                return Ok(());
            }
        }

        self.ctx.current_offset += 1;
        Ok(())
    }

    /// Prepare an item emitted during translation.
    pub(crate) fn prepare_generated(&mut self, id: ItemId) -> CompileResult<()> {
        let offset = self.ctx.current_offset;
        let item = self.graph.get_mut(id)?;
        item.offset = Some(offset);
        item.translated = true;
        Ok(())
    }

    fn prepare_instruction(&mut self, id: ItemId, inst: InstructionItem<'a>) -> CompileResult<()> {
        let count = inst.operands.len();
        let zeroing = inst.opcode.is_zeroing_idiom()
            && count == 2
            && matches!(
                (inst.operands[0], inst.operands[1]),
                (Operand::Var(a), Operand::Var(b)) if a.id == b.id
            );

        let mut records: Vec<VarAllocRecord> = Vec::new();
        let mut mem_vars: Vec<VarId> = Vec::new();
        for (index, operand) in inst.operands.iter().enumerate() {
            let constraint = inst.opcode.constraint(index, count);
            match operand {
                Operand::Var(v) => {
                    if zeroing && index == 1 {
                        continue;
                    }
                    let access = if zeroing { Access::Write } else { constraint.access };
                    add_record(&mut records, v.id, access, constraint.fixed)?;
                }
                Operand::Mem(m) => {
                    for var in m.address_vars() {
                        add_record(&mut records, var, Access::Read, None)?;
                    }
                    if let Some(var) = m.home_var() {
                        self.vars.get_mut(var)?.counts.record_mem(constraint.access);
                        if !mem_vars.contains(&var) {
                            mem_vars.push(var);
                        }
                    }
                }
                _ => {}
            }
        }

        for record in &records {
            if mem_vars.contains(&record.var) {
                return Err(CompileError::usage(format!(
                    "variable {} is used both in a register and in its home in one instruction",
                    record.var.0
                )));
            }
            self.touch_var(id, record.var)?;
            let var = self.vars.get_mut(record.var)?;
            var.counts.record_reg(record.access);
            if let Some(fixed) = record.fixed {
                if var.class != RegClass::Gp {
                    return Err(CompileError::usage(format!(
                        "{} needs a general purpose variable",
                        inst.opcode.name()
                    )));
                }
                if var.home_reg.is_none() {
                    var.home_reg = Some(fixed);
                }
            }
        }
        for &var in &mem_vars {
            self.touch_var(id, var)?;
            self.ensure_home(var)?;
        }

        let records = self.arena().alloc_slice_copy(&records);
        let mem_vars = self.arena().alloc_slice_copy(&mem_vars);
        self.graph.get_mut(id)?.kind = ItemKind::Instruction(InstructionItem {
            records,
            mem_vars,
            ..inst
        });
        Ok(())
    }

    fn prepare_jump(&mut self, id: ItemId, jump: JumpItem<'a>) -> CompileResult<()> {
        let current = self.ctx.current_offset;
        let target = self.label_target(jump.target)?;
        let target_offset = self.graph.offset(target);

        let taken = match jump.hint {
            BranchHint::Taken => true,
            BranchHint::NotTaken => false,
            BranchHint::None => {
                jump.opcode == Opcode::Jmp || target_offset.is_some_and(|t| t < current)
            }
        };
        self.graph.get_mut(id)?.kind = ItemKind::Jump(JumpItem { taken, ..jump });

        // A backward jump keeps every variable live at the target alive up to here.
        if let Some(t) = target_offset {
            for var_id in self.vars.active_ids() {
                let (first, last) = {
                    let var = self.vars.get(var_id)?;
                    (
                        var.first_item.and_then(|i| self.graph.offset(i)),
                        var.last_item.and_then(|i| self.graph.offset(i)),
                    )
                };
                if let (Some(first), Some(last)) = (first, last) {
                    if first <= t && t <= last {
                        self.vars.get_mut(var_id)?.last_item = Some(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn prepare_function_item(&mut self, id: ItemId, function: FunctionId) -> CompileResult<()> {
        let args = self.function(function)?.args.clone();
        for arg in args {
            self.touch_var(id, arg)?;
        }
        Ok(())
    }

    fn prepare_return(&mut self, id: ItemId, ret: ReturnItem<'a>) -> CompileResult<()> {
        let prototype = self.function(ret.function)?.prototype;
        let returns = self.prototype(prototype)?.returns.clone();
        for (index, operand) in ret.operands.iter().enumerate() {
            if let Operand::Var(v) = operand {
                self.touch_var(id, v.id)?;
                let var = self.vars.get_mut(v.id)?;
                var.counts.record_reg(Access::Read);
                if let Some((_, reg)) = returns.get(index) {
                    if reg.class == var.class && var.home_reg.is_none() {
                        var.home_reg = Some(reg.index);
                    }
                }
            }
        }
        Ok(())
    }

    fn prepare_call(&mut self, id: ItemId, call: CallItem<'a>) -> CompileResult<()> {
        let stack = self.prototype(call.prototype)?.args_stack_size;
        self.ctx.is_caller = true;
        self.ctx.call_stack_size = self.ctx.call_stack_size.max((stack + 15) & !15);

        for operand in call.args.iter().chain(std::iter::once(&call.target)) {
            match operand {
                Operand::Var(v) => {
                    self.touch_var(id, v.id)?;
                    self.vars.get_mut(v.id)?.counts.record_reg(Access::Read);
                }
                Operand::Mem(m) => {
                    for var in m.address_vars() {
                        self.touch_var(id, var)?;
                        self.vars.get_mut(var)?.counts.record_reg(Access::Read);
                    }
                }
                _ => {}
            }
        }
        for &ret in call.returns {
            self.touch_var(id, ret)?;
            self.vars.get_mut(ret)?.counts.record_reg(Access::Write);
        }

        for var_id in self.vars.active_ids() {
            let var = self.vars.get_mut(var_id)?;
            if var.first_callable.is_none() {
                var.first_callable = Some(id);
            }
        }
        Ok(())
    }

    // ---- translate ----

    /// Translate `id` and return the item translation continues with.
    pub(crate) fn translate_item(&mut self, id: ItemId) -> CompileResult<Option<ItemId>> {
        let item = *self.graph.get(id)?;
        if item.translated && !matches!(item.kind, ItemKind::Target(_)) {
            return Err(CompileError::AlreadyTranslated);
        }
        if let Some(offset) = item.offset {
            self.ctx.current_offset = offset;
        }
        self.graph.set_cursor(item.prev);

        let next = match item.kind {
            ItemKind::Instruction(inst) => self.translate_instruction(id, inst)?,
            ItemKind::Jump(jump) => self.translate_jump(id, jump)?,
            ItemKind::Target(target) => self.translate_target(id, target, item.translated)?,
            ItemKind::Function(function) => self.translate_function(id, function)?,
            ItemKind::Return(ret) => self.translate_return(id, ret)?,
            ItemKind::Call(call) => self.translate_call(id, call)?,
            ItemKind::Hint(hint) => self.translate_hint(id, hint)?,
            ItemKind::FunctionEnd(_) => None,
            ItemKind::Align(_) | ItemKind::Comment(_) | ItemKind::EmbeddedData(_) => {
                self.graph.next(id)
            }
        };

        if !item.translated {
            self.graph.get_mut(id)?.translated = true;
            self.stats_mut().items_translated += 1;
        }
        Ok(next)
    }

    fn translate_instruction(
        &mut self,
        id: ItemId,
        inst: InstructionItem<'a>,
    ) -> CompileResult<Option<ItemId>> {
        let current = self.ctx.current_offset;
        for record in inst.records {
            self.vars.get_mut(record.var)?.work_offset = Some(current);
        }

        for record in inst.records {
            if let Some(fixed) = record.fixed {
                let class = self.vars.get(record.var)?.class;
                self.ctx.reserved[class.index()].insert(fixed);
            }
        }
        for record in inst.records.iter().filter(|r| r.fixed.is_some()) {
            let fixed = record.fixed.map(RegMask::single).unwrap_or(RegMask::EMPTY);
            self.alloc_var(record.var, fixed, record.access)?;
        }
        self.ctx.reserved = [RegMask::EMPTY; NUM_REG_CLASSES];
        for record in inst.records.iter().filter(|r| r.fixed.is_none()) {
            self.alloc_var(record.var, RegMask::EMPTY, record.access)?;
        }

        // Operands addressing a home need the memory copy to be current.
        for &var in inst.mem_vars {
            let (state, changed) = {
                let v = self.vars.get(var)?;
                (v.state, v.changed)
            };
            match state {
                VarState::Register => {
                    if changed {
                        self.save_var(var)?;
                    }
                    self.unuse_var(var, VarState::Memory)?;
                }
                VarState::Unused => self.unuse_var(var, VarState::Memory)?,
                VarState::Memory => {}
            }
        }

        let mut operands = inst.operands.to_vec();
        for operand in operands.iter_mut() {
            *operand = self.resolve_operand(*operand)?;
        }
        let operands = self.arena().alloc_slice_copy(&operands);
        self.graph.get_mut(id)?.kind = ItemKind::Instruction(InstructionItem { operands, ..inst });

        for record in inst.records {
            self.unuse_var_on_end_of_scope(id, record.var)?;
        }
        for &var in inst.mem_vars {
            self.unuse_var_on_end_of_scope(id, var)?;
        }
        Ok(self.graph.next(id))
    }

    /// Rewrite variable references of `operand` into registers and homes.
    fn resolve_operand(&mut self, operand: Operand) -> CompileResult<Operand> {
        Ok(match operand {
            Operand::Var(v) => {
                let reg = self.vars.get(v.id)?.current_reg().ok_or_else(|| {
                    CompileError::usage(format!("variable {} is not in a register", v.id.0))
                })?;
                Operand::Reg(RegOperand { reg, size: v.size })
            }
            Operand::Mem(mut m) => {
                m.base = self.resolve_address(m.base)?;
                m.index = self.resolve_address(m.index)?;
                if let Some(var) = m.home_var() {
                    m.home = Some(self.resolve_home(var)?);
                }
                Operand::Mem(m)
            }
            other => other,
        })
    }

    fn resolve_address(&self, base: Option<MemBase>) -> CompileResult<Option<MemBase>> {
        match base {
            Some(MemBase::Var(id)) => {
                let reg = self.vars.get(id)?.current_reg().ok_or_else(|| {
                    CompileError::usage(format!("address variable {} is not in a register", id.0))
                })?;
                if reg.class != RegClass::Gp {
                    return Err(CompileError::usage(format!(
                        "address variable {} is not a general purpose variable",
                        id.0
                    )));
                }
                Ok(Some(MemBase::Reg(reg)))
            }
            other => Ok(other),
        }
    }

    fn translate_jump(&mut self, id: ItemId, jump: JumpItem<'a>) -> CompileResult<Option<ItemId>> {
        let target = self.label_target(jump.target)?;
        let target_item = *self.graph.get(target)?;
        if !target_item.linked {
            return Err(CompileError::usage(format!(
                "jump to label {} whose code was removed as unreachable",
                jump.target.0
            )));
        }

        if jump.opcode == Opcode::Jmp && !target_item.translated {
            self.ctx.backward_code.push(id);
            return Ok(Some(target));
        }

        let state = self.save_state()?;
        self.graph.get_mut(id)?.kind = ItemKind::Jump(JumpItem {
            state: Some(state),
            ..jump
        });

        if target_item.translated {
            self.do_jump(id)?;
        } else {
            self.ctx.forward_jumps.push_back(ForwardJump { jump: id, state });
            if let ItemKind::Target(t) = target_item.kind {
                if t.state.is_none() {
                    self.set_target_state(target, state)?;
                }
            }
        }

        if jump.opcode == Opcode::Jmp {
            self.ctx.unreachable = true;
        }
        self.unuse_active_on_end_of_scope(id)?;
        Ok(self.graph.next(id))
    }

    fn set_target_state(&mut self, id: ItemId, state: &'a StateSnapshot<'a>) -> CompileResult<()> {
        match self.graph.kind(id)? {
            ItemKind::Target(t) => {
                self.graph.get_mut(id)?.kind = ItemKind::Target(TargetItem {
                    state: Some(state),
                    ..t
                });
                Ok(())
            }
            _ => Err(CompileError::usage("label is not bound to a target")),
        }
    }

    /// Reconcile the context at jump `id` with the state of its translated target.
    ///
    /// Unconditional and likely-taken backward jumps restore in place. Other
    /// conditional jumps get an out-of-line block holding the reconciliation
    /// code, and are retargeted to it when it is not empty.
    pub(crate) fn do_jump(&mut self, id: ItemId) -> CompileResult<()> {
        let ItemKind::Jump(jump) = self.graph.kind(id)? else {
            return Err(CompileError::usage("not a jump"));
        };
        let target = self.label_target(jump.target)?;
        let ItemKind::Target(target_item) = self.graph.kind(target)? else {
            return Err(CompileError::usage("label is not bound to a target"));
        };
        let target_state = target_item
            .state
            .ok_or_else(|| CompileError::usage("jump target has no state"))?;

        let backward = match (self.graph.offset(target), self.graph.offset(id)) {
            (Some(t), Some(j)) => t < j,
            _ => false,
        };
        if jump.opcode == Opcode::Jmp || (jump.taken && backward) {
            return self.restore_state(target_state);
        }

        let extra = self
            .ctx
            .extra_block
            .ok_or_else(|| CompileError::usage("no block for reconciliation code"))?;
        let saved_cursor = self.graph.cursor();
        self.graph.set_cursor(Some(extra));
        self.restore_state(target_state)?;

        if self.graph.cursor() != Some(extra) {
            self.emit_generated(Opcode::Jmp, &[Operand::Label(jump.target)])?;
            let block_end = self.graph.cursor();

            let label = self.create_label();
            let label_item = self.label_target(label)?;
            self.graph.insert_after(label_item, extra)?;
            {
                let offset = self.ctx.current_offset;
                let item = self.graph.get_mut(label_item)?;
                item.offset = Some(offset);
                item.translated = true;
            }
            self.graph.get_mut(id)?.kind = ItemKind::Jump(JumpItem {
                target: label,
                ..jump
            });
            self.ctx.extra_block = block_end;
            log::trace!("jump {} reconciled through label {}", id.0, label.0);
        }

        self.graph.set_cursor(saved_cursor);
        let own = jump
            .state
            .ok_or_else(|| CompileError::usage("jump was not translated"))?;
        self.assign_state(own)
    }

    fn translate_target(
        &mut self,
        id: ItemId,
        target: TargetItem<'a>,
        translated: bool,
    ) -> CompileResult<Option<ItemId>> {
        if translated {
            let state = target
                .state
                .ok_or_else(|| CompileError::usage("translated target has no state"))?;
            self.restore_state(state)?;
            return Ok(None);
        }

        if self.ctx.unreachable {
            match target.state {
                None => return self.remove_unreachable(id),
                Some(state) => {
                    self.ctx.unreachable = false;
                    self.assign_state(state)?;
                    return Ok(self.graph.next(id));
                }
            }
        }

        let state = self.save_state()?;
        self.set_target_state(id, state)?;
        Ok(self.graph.next(id))
    }

    /// Drop the dead code from target `id` up to the next target.
    fn remove_unreachable(&mut self, id: ItemId) -> CompileResult<Option<ItemId>> {
        let mut removed = 0;
        let mut cur = Some(id);
        while let Some(item) = cur {
            let kind = self.graph.kind(item)?;
            if (item != id && matches!(kind, ItemKind::Target(_)))
                || matches!(kind, ItemKind::FunctionEnd(_))
            {
                break;
            }
            cur = self.graph.next(item);
            self.graph.unlink(item)?;
            self.graph.get_mut(item)?.unreachable = true;
            removed += 1;
        }
        log::warn!("removed {} unreachable items", removed);
        self.stats_mut().items_removed += removed;
        Ok(cur)
    }

    fn translate_function(
        &mut self,
        id: ItemId,
        function: FunctionId,
    ) -> CompileResult<Option<ItemId>> {
        let args = self.function(function)?.args.clone();
        for &arg in &args {
            let var = self.vars.get_mut(arg)?;
            if var.is_reg_argument {
                let index = var
                    .home_reg
                    .ok_or_else(|| CompileError::usage("register argument without register"))?;
                var.state = VarState::Register;
                var.reg = Some(index);
                var.changed = true;
                let reg = Reg::new(var.class, index);
                self.ctx.registers.assign(reg, arg);
            } else {
                var.state = VarState::Memory;
            }
        }
        for arg in args {
            self.unuse_var_on_end_of_scope(id, arg)?;
        }
        Ok(self.graph.next(id))
    }

    fn translate_return(&mut self, id: ItemId, ret: ReturnItem<'a>) -> CompileResult<Option<ItemId>> {
        let prototype = self.function(ret.function)?.prototype;
        let returns = self.prototype(prototype)?.returns.clone();
        if ret.operands.len() > returns.len() {
            return Err(CompileError::usage(format!(
                "function returns {} values, {} given",
                returns.len(),
                ret.operands.len()
            )));
        }

        let location = |session: &Self, operand: &Operand| -> CompileResult<Option<Reg>> {
            Ok(match operand {
                Operand::Var(v) => session.vars.get(v.id)?.current_reg(),
                Operand::Reg(r) => Some(r.reg),
                _ => None,
            })
        };

        if ret.operands.len() == 2 {
            let first = location(self, &ret.operands[0])?;
            let second = location(self, &ret.operands[1])?;
            let (dst0, dst1) = (returns[0].1, returns[1].1);
            if first == Some(dst1) && second == Some(dst0) && dst0.class == RegClass::Gp {
                self.emit_generated(
                    Opcode::Xchg,
                    &[Operand::gpq(dst0.index), Operand::gpq(dst1.index)],
                )?;
            } else if second == Some(dst0) {
                self.emit_return_value(ret.operands[1], returns[1])?;
                self.emit_return_value(ret.operands[0], returns[0])?;
            } else {
                self.emit_return_value(ret.operands[0], returns[0])?;
                self.emit_return_value(ret.operands[1], returns[1])?;
            }
        } else if let Some(&operand) = ret.operands.first() {
            self.emit_return_value(operand, returns[0])?;
        }

        let emit_jump = self.should_emit_jump(id, ret.function)?;
        self.graph.get_mut(id)?.kind = ItemKind::Return(ReturnItem { emit_jump, ..ret });
        if emit_jump {
            self.ctx.unreachable = true;
        }
        self.unuse_active_on_end_of_scope(id)?;
        Ok(self.graph.next(id))
    }

    /// Move one return value into its register, converting between float widths.
    fn emit_return_value(
        &mut self,
        operand: Operand,
        (ty, reg): (VariableType, Reg),
    ) -> CompileResult<()> {
        self.ctx.mark_modified(reg);
        match operand {
            Operand::Var(v) => {
                let (class, source, state, from) = {
                    let var = self.vars.get(v.id)?;
                    (var.class, var.ty, var.state, var.reg)
                };
                if class != reg.class {
                    return Err(CompileError::usage(format!(
                        "variable {} cannot be returned in {:?}",
                        v.id.0, reg
                    )));
                }
                let (opcode, convert) = match (source, ty) {
                    (VariableType::Xmm1F, VariableType::Xmm1D) => (Opcode::Cvtss2sd, true),
                    (VariableType::Xmm1D, VariableType::Xmm1F) => (Opcode::Cvtsd2ss, true),
                    _ => (source.move_opcode(), false),
                };
                let dst = Operand::reg(reg, source.reg_size());
                match (state, from) {
                    (VarState::Register, Some(index)) => {
                        if index != reg.index || convert {
                            let src = self.reg_operand(v.id, index)?;
                            self.emit_generated(opcode, &[dst, src])?;
                        }
                    }
                    (VarState::Memory, _) => {
                        let src = self.home_operand(v.id)?;
                        self.emit_generated(opcode, &[dst, src])?;
                    }
                    _ => {}
                }
            }
            Operand::Imm(value) => {
                if reg.class != RegClass::Gp {
                    return Err(CompileError::usage("immediate return value needs a GP register"));
                }
                self.emit_generated(Opcode::Mov, &[Operand::gpq(reg.index), Operand::Imm(value)])?;
            }
            Operand::Reg(r) => {
                if r.reg != reg {
                    self.emit_register_copy(reg, r.reg)?;
                }
            }
            _ => {
                return Err(CompileError::Unsupported {
                    what: "memory and label return values".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether a return needs an explicit jump to the function exit.
    fn should_emit_jump(&self, id: ItemId, function: FunctionId) -> CompileResult<bool> {
        let exit = self.label_target(self.function(function)?.exit_label)?;
        let mut cur = self.graph.next(id);
        while let Some(item) = cur {
            if item == exit {
                return Ok(false);
            }
            match self.graph.kind(item)? {
                ItemKind::Comment(_) | ItemKind::Hint(_) | ItemKind::Align(_) | ItemKind::Target(_) => {}
                _ => return Ok(true),
            }
            cur = self.graph.next(item);
        }
        Ok(true)
    }

    fn emit_register_copy(&mut self, dst: Reg, src: Reg) -> CompileResult<()> {
        if dst.class != src.class {
            return Err(CompileError::usage(format!("cannot copy {src:?} into {dst:?}")));
        }
        let (opcode, size) = match dst.class {
            RegClass::Gp => (Opcode::Mov, 8),
            RegClass::Mm => (Opcode::Movq, 8),
            RegClass::Xmm => (Opcode::Movaps, 16),
        };
        self.emit_generated(opcode, &[Operand::reg(dst, size), Operand::reg(src, size)])?;
        self.ctx.mark_modified(dst);
        Ok(())
    }

    fn emit_register_swap(&mut self, a: Reg, b: Reg) -> CompileResult<()> {
        match a.class {
            RegClass::Gp => {
                self.emit_generated(Opcode::Xchg, &[Operand::gpq(a.index), Operand::gpq(b.index)])?;
            }
            class => {
                let size = if class == RegClass::Mm { 8 } else { 16 };
                let (x, y) = (Operand::reg(a, size), Operand::reg(b, size));
                self.emit_generated(Opcode::Pxor, &[x, y])?;
                self.emit_generated(Opcode::Pxor, &[y, x])?;
                self.emit_generated(Opcode::Pxor, &[x, y])?;
            }
        }
        self.ctx.mark_modified(a);
        self.ctx.mark_modified(b);
        Ok(())
    }

    /// Free scratch register for staging a stack argument.
    fn call_scratch(&mut self, class: RegClass, prototype: &FunctionPrototype) -> CompileResult<Reg> {
        let free = self.ctx.allocable(class) & !self.ctx.registers.used(class);
        let index = (free & !prototype.preserved(class) & !prototype.passed(class))
            .iter()
            .next()
            .or_else(|| free.iter().next())
            .ok_or(CompileError::NotEnoughRegisters)?;
        let reg = Reg::new(class, index);
        self.ctx.mark_modified(reg);
        Ok(reg)
    }

    fn translate_call(&mut self, id: ItemId, call: CallItem<'a>) -> CompileResult<Option<ItemId>> {
        let prototype = self.prototype(call.prototype)?.clone();
        if call.args.len() != prototype.args.len() {
            return Err(CompileError::usage(format!(
                "call passes {} arguments to a prototype taking {}",
                call.args.len(),
                prototype.args.len()
            )));
        }
        let current = self.ctx.current_offset;

        let mut used: Vec<VarId> = call.args.iter().filter_map(Operand::as_var).collect();
        match call.target {
            Operand::Var(v) => used.push(v.id),
            Operand::Mem(m) => used.extend(m.address_vars()),
            _ => {}
        }
        for &var in used.iter().chain(call.returns) {
            self.vars.get_mut(var)?.work_offset = Some(current);
        }

        // Variables left in caller-saved registers do not survive the call.
        for class in RegClass::ALL {
            let clobbered = self.ctx.registers.used(class) & !prototype.preserved(class);
            for index in clobbered.iter() {
                let Some(var) = self.ctx.registers.occupant(Reg::new(class, index)) else {
                    continue;
                };
                if used.contains(&var) {
                    continue;
                }
                if call.returns.contains(&var) {
                    self.unuse_var(var, VarState::Unused)?;
                } else {
                    self.spill_var(var)?;
                }
            }
        }

        // Stack arguments.
        for (operand, info) in call.args.iter().zip(&prototype.args) {
            let ArgLocation::Stack(offset) = info.location else {
                continue;
            };
            let size = info.ty.size();
            let store = if size == 16 { Opcode::Movups } else { info.ty.move_opcode() };
            let dst = Operand::Mem(Mem::base(Reg::gp(gp::RSP), offset, size));
            match *operand {
                Operand::Var(v) => {
                    let (state, class, reg, ty) = {
                        let var = self.vars.get(v.id)?;
                        (var.state, var.class, var.reg, var.ty)
                    };
                    match (state, reg) {
                        (VarState::Register, Some(index)) => {
                            let src = self.reg_operand(v.id, index)?;
                            self.emit_generated(store, &[dst, src])?;
                        }
                        (VarState::Memory, _) => {
                            let scratch = self.call_scratch(class, &prototype)?;
                            let tmp = Operand::reg(scratch, ty.reg_size());
                            let home = self.home_operand(v.id)?;
                            self.emit_generated(ty.move_opcode(), &[tmp, home])?;
                            self.emit_generated(store, &[dst, tmp])?;
                        }
                        _ => {}
                    }
                }
                Operand::Imm(value) if i32::try_from(value).is_ok() => {
                    self.emit_generated(Opcode::Mov, &[dst, Operand::Imm(value)])?;
                }
                Operand::Imm(value) => {
                    let scratch = self.call_scratch(RegClass::Gp, &prototype)?;
                    let tmp = Operand::gpq(scratch.index);
                    self.emit_generated(Opcode::Mov, &[tmp, Operand::Imm(value)])?;
                    self.emit_generated(Opcode::Mov, &[dst, tmp])?;
                }
                Operand::Reg(r) => {
                    let src = Operand::reg(r.reg, info.ty.reg_size());
                    self.emit_generated(store, &[dst, src])?;
                }
                _ => {
                    return Err(CompileError::Unsupported {
                        what: "memory and label call arguments".to_string(),
                    });
                }
            }
        }

        // The call target must not sit in an argument register.
        let target_mask = self.ctx.allocable(RegClass::Gp) & !prototype.passed(RegClass::Gp);
        match call.target {
            Operand::Var(v) => self.alloc_var(v.id, target_mask, Access::Read)?,
            Operand::Mem(m) => {
                for var in m.address_vars() {
                    self.alloc_var(var, target_mask, Access::Read)?;
                }
            }
            _ => {}
        }
        let target = match self.resolve_operand(call.target)? {
            Operand::Reg(r) => Operand::gpq(r.reg.index),
            other => other,
        };

        // Dirty values used by the call and live after it go home now, their
        // registers are clobbered below.
        for class in RegClass::ALL {
            let clobbered = self.ctx.registers.used(class) & !prototype.preserved(class);
            for index in clobbered.iter() {
                let Some(var) = self.ctx.registers.occupant(Reg::new(class, index)) else {
                    continue;
                };
                let v = self.vars.get(var)?;
                if v.changed && v.last_item != Some(id) {
                    self.save_var(var)?;
                }
            }
        }

        // Register arguments, as one parallel copy.
        let mut moves: Vec<(Reg, Reg)> = Vec::new();
        let mut loads: Vec<(Reg, ArgSource)> = Vec::new();
        for (operand, info) in call.args.iter().zip(&prototype.args) {
            let ArgLocation::Register(dst) = info.location else {
                continue;
            };
            let source = match *operand {
                Operand::Var(v) => {
                    let var = self.vars.get(v.id)?;
                    if var.class != dst.class {
                        return Err(CompileError::usage(format!(
                            "variable {} cannot be passed in {:?}",
                            v.id.0, dst
                        )));
                    }
                    match var.current_reg() {
                        Some(reg) => Some(ArgSource::Reg(reg)),
                        None if var.state == VarState::Memory => Some(ArgSource::Home(v.id)),
                        None => None,
                    }
                }
                Operand::Imm(value) => Some(ArgSource::Imm(value)),
                Operand::Reg(r) => Some(ArgSource::Reg(r.reg)),
                _ => {
                    return Err(CompileError::Unsupported {
                        what: "memory and label call arguments".to_string(),
                    });
                }
            };
            match source {
                Some(ArgSource::Reg(src)) if src == dst => {}
                Some(ArgSource::Reg(src)) => moves.push((dst, src)),
                Some(other) => loads.push((dst, other)),
                None => {}
            }
        }

        while !moves.is_empty() {
            let ready = moves
                .iter()
                .position(|&(dst, _)| !moves.iter().any(|&(_, src)| src == dst));
            match ready {
                Some(pos) => {
                    let (dst, src) = moves.remove(pos);
                    self.emit_register_copy(dst, src)?;
                }
                None => {
                    // only cycles are left
                    let (dst, src) = moves.remove(0);
                    self.emit_register_swap(dst, src)?;
                    for m in moves.iter_mut() {
                        if m.1 == dst {
                            m.1 = src;
                        } else if m.1 == src {
                            m.1 = dst;
                        }
                    }
                    moves.retain(|&(d, s)| d != s);
                }
            }
        }

        for (dst, source) in loads {
            self.ctx.mark_modified(dst);
            match source {
                ArgSource::Home(var) => {
                    let ty = self.vars.get(var)?.ty;
                    let home = self.home_operand(var)?;
                    self.emit_generated(ty.move_opcode(), &[Operand::reg(dst, ty.reg_size()), home])?;
                }
                ArgSource::Imm(value) => {
                    if dst.class != RegClass::Gp {
                        return Err(CompileError::usage("immediate argument needs a GP register"));
                    }
                    self.emit_generated(Opcode::Mov, &[Operand::gpq(dst.index), Operand::Imm(value)])?;
                }
                ArgSource::Reg(_) => {}
            }
        }

        // Every caller-saved register is garbage after the call.
        for class in RegClass::ALL {
            let clobbered = self.ctx.registers.used(class) & !prototype.preserved(class);
            for index in clobbered.iter() {
                let Some(var) = self.ctx.registers.occupant(Reg::new(class, index)) else {
                    continue;
                };
                let state = if self.vars.get(var)?.last_item == Some(id) {
                    VarState::Unused
                } else {
                    VarState::Memory
                };
                self.unuse_var(var, state)?;
            }
        }

        self.emit_generated(Opcode::Call, &[target])?;
        if prototype.callee_pops_stack && prototype.args_stack_size > 0 {
            self.emit_generated(
                Opcode::Sub,
                &[Operand::gpq(gp::RSP), Operand::Imm(prototype.args_stack_size as i64)],
            )?;
        }

        for (&var, &(_, reg)) in call.returns.iter().zip(&prototype.returns) {
            if self.vars.get(var)?.class != reg.class {
                return Err(CompileError::usage(format!(
                    "variable {} cannot receive a value returned in {:?}",
                    var.0, reg
                )));
            }
            self.alloc_var(var, RegMask::single(reg.index), Access::Write)?;
        }

        self.unuse_active_on_end_of_scope(id)?;
        Ok(self.graph.next(id))
    }

    fn translate_hint(&mut self, id: ItemId, hint: HintItem) -> CompileResult<Option<ItemId>> {
        let (in_register, changed, state) = {
            let var = self.vars.get(hint.var)?;
            (var.current_reg().is_some(), var.changed, var.state)
        };
        match hint.kind {
            HintKind::Alloc => {
                let mask = hint.reg.map(RegMask::single).unwrap_or(RegMask::EMPTY);
                self.alloc_var(hint.var, mask, Access::Read)?;
            }
            HintKind::Spill => {
                if in_register {
                    self.spill_var(hint.var)?;
                }
            }
            HintKind::Save => {
                if in_register && changed {
                    self.save_var(hint.var)?;
                }
            }
            HintKind::SaveAndUnuse => {
                if in_register && changed {
                    self.save_var(hint.var)?;
                }
                if state != VarState::Unused {
                    self.unuse_var(hint.var, VarState::Memory)?;
                }
            }
            HintKind::Unuse => self.unuse_var(hint.var, VarState::Unused)?,
        }
        self.unuse_var_on_end_of_scope(id, hint.var)?;
        Ok(self.graph.next(id))
    }

    // ---- displacement patching ----

    /// Bind every home memory operand in `start..=end` to the final frame.
    pub(crate) fn patch_memory_operands(
        &mut self,
        start: ItemId,
        end: ItemId,
        frame: &FrameLayout,
    ) -> CompileResult<()> {
        for id in self.graph.range(start, end) {
            let ItemKind::Instruction(inst) = self.graph.kind(id)? else {
                continue;
            };
            if !inst
                .operands
                .iter()
                .any(|op| matches!(op, Operand::Mem(m) if m.home.is_some()))
            {
                continue;
            }
            let mut operands = inst.operands.to_vec();
            for operand in operands.iter_mut() {
                if let Operand::Mem(m) = operand {
                    if let Some(home) = m.home {
                        self.patch_home(m, home, frame)?;
                    }
                }
            }
            let operands = self.arena().alloc_slice_copy(&operands);
            self.graph.get_mut(id)?.kind = ItemKind::Instruction(InstructionItem { operands, ..inst });
        }
        Ok(())
    }

    fn patch_home(&self, m: &mut Mem, home: Home, frame: &FrameLayout) -> CompileResult<()> {
        match home {
            Home::Argument(offset) => {
                m.base = Some(MemBase::Reg(frame.args_base));
                m.disp += offset + frame.args_base_offset;
            }
            Home::Slot(slot) => {
                let offset = self
                    .ctx
                    .slots
                    .offset(slot)
                    .ok_or_else(|| CompileError::usage("spill slot was not laid out"))?;
                m.base = Some(MemBase::Reg(frame.vars_base));
                m.disp += offset as i32 + frame.vars_base_offset;
            }
            Home::Var(var) => {
                return Err(CompileError::usage(format!(
                    "home of variable {} was never bound",
                    var.0
                )));
            }
        }
        m.home = None;
        Ok(())
    }

    // ---- emit / post ----

    /// Hand `id` to the encoder.
    pub(crate) fn emit_item(&mut self, id: ItemId, encoder: &mut dyn Encoder) -> CompileResult<()> {
        let item = *self.graph.get(id)?;
        if let (true, Some(comment)) = (self.options.emit_comments, item.comment) {
            encoder.comment(comment);
        }

        match item.kind {
            ItemKind::Instruction(inst) => {
                let operands = inst.opcode.explicit_operands(inst.operands);
                if !operands.iter().all(Operand::is_resolved) {
                    return Err(EncodingError::UnresolvedOperand.into());
                }
                encoder.emit(inst.opcode, operands)?;
                self.record_instruction(inst.opcode);
            }
            ItemKind::Jump(jump) => {
                encoder.emit(jump.opcode, &[Operand::Label(jump.target)])?;
                self.record_instruction(jump.opcode);
            }
            ItemKind::Target(target) => encoder.mark_label(target.label)?,
            ItemKind::Return(ret) => {
                if ret.emit_jump {
                    let exit = self.function(ret.function)?.exit_label;
                    encoder.emit(Opcode::Jmp, &[Operand::Label(exit)])?;
                    self.record_instruction(Opcode::Jmp);
                }
            }
            ItemKind::Align(alignment) => encoder.align(alignment)?,
            ItemKind::Comment(text) => {
                if self.options.emit_comments {
                    encoder.comment(text);
                }
            }
            ItemKind::EmbeddedData(data) => encoder.embed(data)?,
            ItemKind::Function(_)
            | ItemKind::FunctionEnd(_)
            | ItemKind::Call(_)
            | ItemKind::Hint(_) => {}
        }
        Ok(())
    }

    /// Check that every label `id` refers to was bound.
    pub(crate) fn post_item(&self, id: ItemId, encoder: &dyn Encoder) -> CompileResult<()> {
        let check = |label: LabelId| {
            if encoder.is_label_marked(label) {
                Ok(())
            } else {
                Err(CompileError::UnknownLabel { id: label.0 })
            }
        };
        match self.graph.kind(id)? {
            ItemKind::Jump(jump) => check(jump.target),
            ItemKind::Instruction(inst) => {
                for operand in inst.operands {
                    if let Operand::Label(label) = operand {
                        check(*label)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_merge_duplicate_operands() {
        let mut records = Vec::new();
        add_record(&mut records, VarId(1), Access::Read, None).unwrap();
        add_record(&mut records, VarId(2), Access::Write, None).unwrap();
        add_record(&mut records, VarId(1), Access::Write, Some(gp::RCX)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].access, Access::ReadWrite);
        assert_eq!(records[0].fixed, Some(gp::RCX));
    }

    #[test]
    fn test_conflicting_fixed_registers_are_rejected() {
        let mut records = Vec::new();
        add_record(&mut records, VarId(1), Access::Write, Some(gp::RDX)).unwrap();
        let err = add_record(&mut records, VarId(1), Access::ReadWrite, Some(gp::RAX));
        assert!(matches!(err, Err(CompileError::Usage { .. })));
    }
}
