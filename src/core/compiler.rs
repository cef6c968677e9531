// This module provides the builder API and the serialization driver. Compiler borrows a
// CompilationSession and appends items to its graph: functions with their argument
// variables, instructions over variables, labels, jumps, returns, calls, allocator hints,
// comments, alignment and raw data. Serialization walks the graph; items outside functions go
// straight to the encoder, and every function runs the full pipeline: prepare the function's
// items, translate them along control flow (draining the deferred unconditional jumps),
// reconcile the forward jumps, lay out the spill slots, compute the frame, insert the prolog
// after the entry target and the epilog after the exit target, bind home memory operands to
// the frame, emit, and finally check every label reference.

//! Builder API and compilation driver.

use super::encoder::Encoder;
use super::error::{CompileError, CompileResult};
use super::item::{
    BranchHint, CallItem, FunctionId, HintItem, HintKind, ItemId, ItemKind, JumpItem, LabelId,
    ReturnItem, TargetItem,
};
use super::operand::{Condition, Opcode, Operand, VarRef};
use super::register_file::Reg;
use super::session::{CompilationSession, FunctionData, FunctionHints};
use super::variable::{VarId, VariableType};
use crate::x64::calling_convention::{ArgLocation, FunctionPrototype};
use crate::x64::frame::{FrameInput, FrameLayout};

/// Builder over a compilation session.
///
/// ```
/// use bumpalo::Bump;
/// use regjit::core::compiler::Compiler;
/// use regjit::core::operand::Opcode;
/// use regjit::core::session::{CompilationSession, FunctionHints};
/// use regjit::core::test_utils::RecordingEncoder;
/// use regjit::core::variable::VariableType;
/// use regjit::x64::calling_convention::FunctionPrototype;
///
/// let arena = Bump::new();
/// let mut session = CompilationSession::new(&arena);
/// let mut c = Compiler::new(&mut session);
///
/// let proto = FunctionPrototype::sysv(&[VariableType::Gpq; 2], &[VariableType::Gpq]).unwrap();
/// c.new_function(proto, FunctionHints::default()).unwrap();
/// let a = c.arg(0).unwrap();
/// let b = c.arg(1).unwrap();
/// c.emit(Opcode::Add, &[a.into(), b.into()]).unwrap();
/// c.ret(&[a.into()]).unwrap();
/// c.end_function().unwrap();
///
/// let mut encoder = RecordingEncoder::new();
/// c.serialize(&mut encoder).unwrap();
/// assert!(encoder.count(Opcode::Add) == 1);
/// ```
pub struct Compiler<'s, 'arena> {
    session: &'s mut CompilationSession<'arena>,
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub fn new(session: &'s mut CompilationSession<'arena>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &CompilationSession<'arena> {
        self.session
    }

    fn current(&self) -> CompileResult<FunctionId> {
        self.session.current_function.ok_or(CompileError::NoFunction)
    }

    /// Append an item at the end of the graph.
    fn append(&mut self, kind: ItemKind<'arena>) -> CompileResult<ItemId> {
        let id = self.session.graph.create(kind);
        self.session.graph.set_cursor(self.session.graph.last());
        self.session.graph.insert(id)?;
        Ok(id)
    }

    fn var_ref(&self, id: VarId) -> CompileResult<VarRef> {
        let var = self.session.vars.get(id)?;
        Ok(VarRef {
            id,
            size: var.ty.reg_size(),
        })
    }

    fn check_operand(&self, operand: &Operand) -> CompileResult<()> {
        let check_var = |id: VarId| -> CompileResult<()> {
            let function = self.current()?;
            if self.session.vars.get(id)?.function != function {
                return Err(CompileError::usage(format!(
                    "variable {} belongs to another function",
                    id.0
                )));
            }
            Ok(())
        };
        match operand {
            Operand::Var(v) => check_var(v.id),
            Operand::Mem(m) => {
                for id in m.address_vars().chain(m.home_var()) {
                    check_var(id)?;
                }
                Ok(())
            }
            Operand::Label(label) => self.session.label_target(*label).map(|_| ()),
            Operand::Reg(_) | Operand::Imm(_) => Ok(()),
        }
    }

    /// Open a function. Argument variables are created from the prototype.
    pub fn new_function(
        &mut self,
        prototype: FunctionPrototype,
        hints: FunctionHints,
    ) -> CompileResult<FunctionId> {
        if self.session.current_function.is_some() {
            return Err(CompileError::FunctionInProgress);
        }

        let function = FunctionId(self.session.functions.len() as u32);
        let mut args = Vec::with_capacity(prototype.args.len());
        for info in &prototype.args {
            let id = self.session.vars.new_var(info.ty, function)?;
            let var = self.session.vars.get_mut(id)?;
            match info.location {
                ArgLocation::Register(reg) => {
                    var.is_reg_argument = true;
                    var.home_reg = Some(reg.index);
                }
                ArgLocation::Stack(offset) => {
                    var.is_mem_argument = true;
                    var.home_memory_offset = offset + 8;
                }
            }
            args.push(id);
        }

        let prototype = self.session.add_prototype(prototype);
        let entry_label = self.session.create_label();
        let exit_label = self.session.create_label();
        let item = self.append(ItemKind::Function(function))?;
        self.session.functions.push(FunctionData {
            prototype,
            hints,
            item,
            entry_label,
            exit_label,
            end: None,
            args,
            frame: None,
        });
        self.session.current_function = Some(function);
        self.bind(entry_label)?;

        log::debug!("new function {}", function.0);
        Ok(function)
    }

    /// Argument `index` of the open function.
    pub fn arg(&self, index: usize) -> CompileResult<VarRef> {
        let function = self.current()?;
        let id = self
            .session
            .function(function)?
            .args
            .get(index)
            .copied()
            .ok_or_else(|| CompileError::usage(format!("function has no argument {index}")))?;
        self.var_ref(id)
    }

    pub fn new_var(&mut self, ty: VariableType) -> CompileResult<VarRef> {
        let function = self.current()?;
        let id = self.session.vars.new_var(ty, function)?;
        self.var_ref(id)
    }

    pub fn set_priority(&mut self, var: VarRef, priority: u32) -> CompileResult<()> {
        self.session.vars.get_mut(var.id)?.priority = priority;
        Ok(())
    }

    /// Append an instruction.
    pub fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> CompileResult<ItemId> {
        if matches!(opcode, Opcode::Jmp | Opcode::Jcc(_) | Opcode::Call | Opcode::Ret) {
            return Err(CompileError::usage(format!(
                "{} is emitted through the control flow builder methods",
                opcode.name()
            )));
        }
        for operand in operands {
            self.check_operand(operand)?;
        }
        let operands = self.session.arena().alloc_slice_copy(operands);
        self.append(ItemKind::Instruction(super::item::InstructionItem {
            opcode,
            operands,
            records: &[],
            mem_vars: &[],
        }))
    }

    pub fn new_label(&mut self) -> LabelId {
        self.session.create_label()
    }

    /// Bind `label` at the current position.
    pub fn bind(&mut self, label: LabelId) -> CompileResult<()> {
        let target = self.session.label_target(label)?;
        if self.session.graph.get(target)?.linked {
            return Err(CompileError::usage(format!("label {} is already bound", label.0)));
        }
        self.session.graph.set_cursor(self.session.graph.last());
        self.session.graph.insert(target)
    }

    fn jump(&mut self, opcode: Opcode, label: LabelId, hint: BranchHint) -> CompileResult<ItemId> {
        self.current()?;
        let target = self.session.label_target(label)?;
        let ItemKind::Target(target_item) = self.session.graph.kind(target)? else {
            return Err(CompileError::usage("label is not bound to a target"));
        };
        let id = self.append(ItemKind::Jump(JumpItem {
            opcode,
            target: label,
            hint,
            taken: false,
            state: None,
            next_jump: target_item.first_jump,
        }))?;
        self.session.graph.get_mut(target)?.kind = ItemKind::Target(TargetItem {
            first_jump: Some(id),
            jump_count: target_item.jump_count + 1,
            ..target_item
        });
        Ok(id)
    }

    pub fn jmp(&mut self, label: LabelId) -> CompileResult<ItemId> {
        self.jump(Opcode::Jmp, label, BranchHint::None)
    }

    pub fn jcc(&mut self, condition: Condition, label: LabelId, hint: BranchHint) -> CompileResult<ItemId> {
        self.jump(Opcode::Jcc(condition), label, hint)
    }

    /// Return up to two values from the open function.
    pub fn ret(&mut self, operands: &[Operand]) -> CompileResult<ItemId> {
        let function = self.current()?;
        if operands.len() > 2 {
            return Err(CompileError::usage("at most two values can be returned"));
        }
        for operand in operands {
            self.check_operand(operand)?;
        }
        let operands = self.session.arena().alloc_slice_copy(operands);
        self.append(ItemKind::Return(ReturnItem {
            function,
            operands,
            emit_jump: false,
        }))
    }

    /// Call `target` with `prototype`, binding its return values to `returns`.
    pub fn call(
        &mut self,
        target: Operand,
        prototype: FunctionPrototype,
        args: &[Operand],
        returns: &[VarRef],
    ) -> CompileResult<ItemId> {
        self.current()?;
        if args.len() != prototype.args.len() {
            return Err(CompileError::usage(format!(
                "prototype takes {} arguments, {} given",
                prototype.args.len(),
                args.len()
            )));
        }
        if returns.len() > prototype.returns.len() {
            return Err(CompileError::usage(format!(
                "prototype returns {} values, {} requested",
                prototype.returns.len(),
                returns.len()
            )));
        }
        for operand in args {
            if matches!(operand, Operand::Mem(_) | Operand::Label(_)) {
                return Err(CompileError::Unsupported {
                    what: "memory and label call arguments".to_string(),
                });
            }
            self.check_operand(operand)?;
        }
        self.check_operand(&target)?;
        for ret in returns {
            self.check_operand(&Operand::Var(*ret))?;
        }

        let prototype = self.session.add_prototype(prototype);
        let arena = self.session.arena();
        let args = arena.alloc_slice_copy(args);
        let returns = arena.alloc_slice_fill_iter(returns.iter().map(|r| r.id));
        self.append(ItemKind::Call(CallItem {
            prototype,
            target,
            args,
            returns,
        }))
    }

    fn hint(&mut self, var: VarRef, kind: HintKind, reg: Option<Reg>) -> CompileResult<ItemId> {
        self.check_operand(&Operand::Var(var))?;
        let reg = match reg {
            Some(reg) => {
                if reg.class != self.session.vars.get(var.id)?.class {
                    return Err(CompileError::usage(format!(
                        "{:?} cannot hold variable {}",
                        reg, var.id.0
                    )));
                }
                Some(reg.index)
            }
            None => None,
        };
        self.append(ItemKind::Hint(HintItem {
            var: var.id,
            kind,
            reg,
        }))
    }

    /// Ask for `var` to be in a register here, in `reg` when given.
    pub fn alloc(&mut self, var: VarRef, reg: Option<Reg>) -> CompileResult<ItemId> {
        self.hint(var, HintKind::Alloc, reg)
    }

    pub fn spill(&mut self, var: VarRef) -> CompileResult<ItemId> {
        self.hint(var, HintKind::Spill, None)
    }

    pub fn save(&mut self, var: VarRef) -> CompileResult<ItemId> {
        self.hint(var, HintKind::Save, None)
    }

    pub fn save_and_unuse(&mut self, var: VarRef) -> CompileResult<ItemId> {
        self.hint(var, HintKind::SaveAndUnuse, None)
    }

    pub fn unuse(&mut self, var: VarRef) -> CompileResult<ItemId> {
        self.hint(var, HintKind::Unuse, None)
    }

    pub fn comment(&mut self, text: &str) -> CompileResult<ItemId> {
        let text = self.session.intern_str(text);
        self.append(ItemKind::Comment(text))
    }

    pub fn align(&mut self, alignment: u32) -> CompileResult<ItemId> {
        if !alignment.is_power_of_two() {
            return Err(CompileError::usage(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        self.append(ItemKind::Align(alignment))
    }

    pub fn embed(&mut self, data: &[u8]) -> CompileResult<ItemId> {
        let data = self.session.arena().alloc_slice_copy(data);
        self.append(ItemKind::EmbeddedData(data))
    }

    /// Entry and exit labels of the open function.
    pub fn function_labels(&self) -> CompileResult<(LabelId, LabelId)> {
        let data = self.session.function(self.current()?)?;
        Ok((data.entry_label, data.exit_label))
    }

    /// Close the open function.
    pub fn end_function(&mut self) -> CompileResult<FunctionId> {
        let function = self.current()?;
        let exit = self.session.function(function)?.exit_label;
        self.bind(exit)?;
        let end = self.append(ItemKind::FunctionEnd(function))?;
        self.session.function_mut(function)?.end = Some(end);
        self.session.current_function = None;
        Ok(function)
    }

    /// Compile every function and hand the result to `encoder`.
    pub fn serialize(&mut self, encoder: &mut dyn Encoder) -> CompileResult<()> {
        if self.session.current_function.is_some() {
            return Err(CompileError::IncompleteFunction);
        }
        for label in 0..self.session.label_count() {
            encoder.define_label(LabelId(label as u32));
        }

        let mut cur = self.session.graph.first();
        while let Some(id) = cur {
            cur = match self.session.graph.kind(id)? {
                ItemKind::Function(function) => {
                    let last = self.session.compile_function(function, encoder)?;
                    self.session.graph.next(last)
                }
                _ => {
                    self.session.emit_item(id, encoder)?;
                    self.session.graph.next(id)
                }
            };
        }
        Ok(())
    }

    /// Serialize and return the finished code.
    pub fn make(&mut self, encoder: &mut dyn Encoder) -> CompileResult<Vec<u8>> {
        self.serialize(encoder)?;
        let code = encoder.finish()?;
        log::debug!("made {} bytes of code", code.len());
        Ok(code)
    }
}

impl<'a> CompilationSession<'a> {
    /// Run the whole pipeline over one function, returning its last item.
    pub(crate) fn compile_function(
        &mut self,
        function: FunctionId,
        encoder: &mut dyn Encoder,
    ) -> CompileResult<ItemId> {
        let data = self.function(function)?.clone();
        let stop = data.end.ok_or(CompileError::IncompleteFunction)?;
        let start = data.item;
        let prototype = self.prototype(data.prototype)?.clone();
        let labels_before = self.label_count();

        self.ctx.clear();
        self.vars.clear_active();
        self.ctx.function = Some(function);
        self.ctx.start = Some(start);
        self.ctx.stop = Some(stop);
        self.ctx.extra_block = Some(stop);
        self.ctx.preserved = prototype.preserved;
        self.ctx.allocable_rbp = data.hints.naked;
        log::debug!("compiling function {}", function.0);

        for id in self.graph.range(start, stop) {
            self.prepare_item(id)?;
        }

        self.ctx.active = true;
        let mut cur = Some(start);
        loop {
            while let Some(id) = cur {
                cur = self.translate_item(id)?;
            }
            if self.ctx.backward_pos >= self.ctx.backward_code.len() {
                break;
            }
            // code after a deferred unconditional jump starts without a live state
            let jump = self.ctx.backward_code[self.ctx.backward_pos];
            self.ctx.backward_pos += 1;
            self.ctx.unreachable = true;
            cur = match self.graph.next(jump) {
                Some(next) if !self.graph.get(next)?.translated => Some(next),
                _ => None,
            };
        }

        while let Some(forward) = self.ctx.forward_jumps.pop_front() {
            self.ctx.current_offset = self.graph.offset(forward.jump).unwrap_or(0);
            self.assign_state(forward.state)?;
            self.graph.set_cursor(self.graph.prev(forward.jump));
            self.do_jump(forward.jump)?;
            self.stats_mut().forward_jumps_resolved += 1;
        }
        self.ctx.active = false;

        let mem_bytes = self.ctx.slots.layout();
        let frame = FrameLayout::compute(&FrameInput {
            hints: data.hints,
            is_caller: self.ctx.is_caller,
            stack_aligned_by_os: self
                .options
                .stack_aligned_by_os
                .unwrap_or(prototype.stack_aligned_by_os),
            modified: self.ctx.modified,
            preserved: self.ctx.preserved,
            call_stack_size: self.ctx.call_stack_size,
            mem_bytes,
            mem16_count: self.ctx.slots.count16(),
            mem8_count: self.ctx.slots.count8(),
            red_zone_size: prototype.red_zone_size,
            callee_pops_stack: prototype.callee_pops_stack,
            args_stack_size: prototype.args_stack_size,
            cpu_vendor: self.options.cpu_vendor,
        });
        log::debug!(
            "function {} frame: {} bytes, {} spill bytes",
            function.0,
            frame.frame_size(),
            mem_bytes
        );

        let entry = self.label_target(data.entry_label)?;
        self.graph.set_cursor(Some(entry));
        self.emit_prolog(&frame)?;
        let exit = self.label_target(data.exit_label)?;
        if self.graph.get(exit)?.linked {
            self.graph.set_cursor(Some(exit));
            self.emit_epilog(&frame)?;
        }

        let last = self.ctx.extra_block.unwrap_or(stop);
        self.patch_memory_operands(start, last, &frame)?;

        for label in labels_before..self.label_count() {
            encoder.define_label(LabelId(label as u32));
        }
        let items = self.graph.range(start, last);
        for &id in &items {
            self.emit_item(id, encoder)?;
        }
        for &id in &items {
            self.post_item(id, encoder)?;
        }

        self.function_mut(function)?.frame = Some(frame);
        self.record_function_compiled(encoder.code_size());
        Ok(last)
    }
}
