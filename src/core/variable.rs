// This module defines virtual variables and the per-session variable registry. A variable
// is an unlimited-supply virtual register the builder hands out; the allocator later binds
// it to a physical register or a stack slot. Each variable carries its type (which selects
// a register class, a size, and the move opcode used for loads and stores), its current
// allocation state, a home register hint, a dirty bit, per-access counters used to score
// spill candidates, and the first/last items bounding its live range in item order. The
// registry also owns the intrusive "active ring": a circular doubly linked list threaded
// through the variables that have been referenced inside the function being compiled.

//! Virtual variables and the active-variable ring.

use super::error::{CompileError, CompileResult};
use super::item::{FunctionId, ItemId};
use super::memory::SlotId;
use super::operand::Opcode;
use super::register_file::{Reg, RegClass};

/// Handle of a variable, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// Variable type, selecting register class, size and move instruction.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    /// 32-bit general purpose.
    Gpd,
    /// 64-bit general purpose.
    Gpq,
    X87,
    X87_1F,
    X87_1D,
    /// 64-bit MMX.
    Mm,
    /// 128-bit integer vector.
    Xmm,
    /// Scalar single precision.
    Xmm1F,
    /// Scalar double precision.
    Xmm1D,
    /// Packed single precision.
    Xmm4F,
    /// Packed double precision.
    Xmm2D,
}

impl VariableType {
    /// Register class, or `None` for types the target cannot hold in registers.
    pub fn class(self) -> Option<RegClass> {
        match self {
            VariableType::Gpd | VariableType::Gpq => Some(RegClass::Gp),
            VariableType::Mm => Some(RegClass::Mm),
            VariableType::Xmm
            | VariableType::Xmm1F
            | VariableType::Xmm1D
            | VariableType::Xmm4F
            | VariableType::Xmm2D => Some(RegClass::Xmm),
            VariableType::X87 | VariableType::X87_1F | VariableType::X87_1D => None,
        }
    }

    /// Size of the value in memory.
    pub fn size(self) -> u32 {
        match self {
            VariableType::Gpd | VariableType::Xmm1F | VariableType::X87_1F => 4,
            VariableType::Gpq | VariableType::Mm | VariableType::Xmm1D | VariableType::X87_1D => 8,
            VariableType::X87 => 10,
            VariableType::Xmm | VariableType::Xmm4F | VariableType::Xmm2D => 16,
        }
    }

    /// Width of a register operand holding this type.
    pub fn reg_size(self) -> u32 {
        match self {
            VariableType::Gpd => 4,
            VariableType::Gpq | VariableType::Mm => 8,
            _ => 16,
        }
    }

    /// Instruction used to load, store and copy values of this type.
    pub fn move_opcode(self) -> Opcode {
        match self {
            VariableType::Gpd | VariableType::Gpq => Opcode::Mov,
            VariableType::Mm => Opcode::Movq,
            VariableType::Xmm => Opcode::Movdqa,
            VariableType::Xmm1F => Opcode::Movss,
            VariableType::Xmm1D => Opcode::Movsd,
            VariableType::Xmm4F => Opcode::Movaps,
            VariableType::Xmm2D => Opcode::Movapd,
            VariableType::X87 | VariableType::X87_1F | VariableType::X87_1D => Opcode::Nop,
        }
    }

    pub fn is_float(self) -> bool {
        self.class() == Some(RegClass::Xmm)
    }
}

/// Allocation state of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarState {
    #[default]
    Unused,
    Register,
    Memory,
}

/// How an access touches a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    /// Union of two accesses to the same variable.
    pub fn merge(self, other: Access) -> Access {
        if self == other {
            self
        } else {
            Access::ReadWrite
        }
    }
}

/// Per-access statistics feeding the spill score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub reg_read: u32,
    pub reg_write: u32,
    pub reg_rw: u32,
    pub mem_read: u32,
    pub mem_write: u32,
    pub mem_rw: u32,
}

impl AccessCounts {
    pub fn record_reg(&mut self, access: Access) {
        match access {
            Access::Read => self.reg_read += 1,
            Access::Write => self.reg_write += 1,
            Access::ReadWrite => self.reg_rw += 1,
        }
    }

    pub fn record_mem(&mut self, access: Access) {
        match access {
            Access::Read => self.mem_read += 1,
            Access::Write => self.mem_write += 1,
            Access::ReadWrite => self.mem_rw += 1,
        }
    }
}

pub const DEFAULT_PRIORITY: u32 = 10;

/// A virtual register.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: VarId,
    pub ty: VariableType,
    pub class: RegClass,
    pub size: u32,
    pub function: FunctionId,

    pub state: VarState,
    /// Physical register index while `state == Register`.
    pub reg: Option<u8>,
    /// Preferred register for the next allocation.
    pub home_reg: Option<u8>,
    /// Among spill candidates a higher priority is spilled first; 0 is never spilled.
    pub priority: u32,
    /// Register copy differs from memory.
    pub changed: bool,

    pub first_item: Option<ItemId>,
    pub last_item: Option<ItemId>,
    /// First call item inside the live range.
    pub first_callable: Option<ItemId>,
    /// Offset of the item currently being allocated for.
    pub work_offset: Option<u32>,

    pub counts: AccessCounts,

    pub home_slot: Option<SlotId>,
    pub is_reg_argument: bool,
    pub is_mem_argument: bool,
    /// Offset of a stack argument relative to the arguments base.
    pub home_memory_offset: i32,

    next_active: Option<VarId>,
    prev_active: Option<VarId>,
}

impl Variable {
    pub fn current_reg(&self) -> Option<Reg> {
        match (self.state, self.reg) {
            (VarState::Register, Some(index)) => Some(Reg::new(self.class, index)),
            _ => None,
        }
    }

    pub fn is_argument(&self) -> bool {
        self.is_reg_argument || self.is_mem_argument
    }
}

/// All variables of a session, plus the active ring of the function being compiled.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    vars: Vec<Variable>,
    active_head: Option<VarId>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new variable. X87 types are rejected here so the caller gets
    /// precise attribution.
    pub fn new_var(&mut self, ty: VariableType, function: FunctionId) -> CompileResult<VarId> {
        let class = ty.class().ok_or_else(|| CompileError::Unsupported {
            what: format!("{ty:?} variables"),
        })?;
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable {
            id,
            ty,
            class,
            size: ty.size(),
            function,
            state: VarState::Unused,
            reg: None,
            home_reg: None,
            priority: DEFAULT_PRIORITY,
            changed: false,
            first_item: None,
            last_item: None,
            first_callable: None,
            work_offset: None,
            counts: AccessCounts::default(),
            home_slot: None,
            is_reg_argument: false,
            is_mem_argument: false,
            home_memory_offset: 0,
            next_active: None,
            prev_active: None,
        });
        Ok(id)
    }

    pub fn get(&self, id: VarId) -> CompileResult<&Variable> {
        self.vars
            .get(id.0 as usize)
            .ok_or(CompileError::UnknownVariable { id: id.0 })
    }

    pub fn get_mut(&mut self, id: VarId) -> CompileResult<&mut Variable> {
        self.vars
            .get_mut(id.0 as usize)
            .ok_or(CompileError::UnknownVariable { id: id.0 })
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    /// Ids of all variables owned by `function`.
    pub fn function_vars(&self, function: FunctionId) -> Vec<VarId> {
        self.vars
            .iter()
            .filter(|v| v.function == function)
            .map(|v| v.id)
            .collect()
    }

    pub fn is_active(&self, id: VarId) -> bool {
        self.vars
            .get(id.0 as usize)
            .map(|v| v.next_active.is_some())
            .unwrap_or(false)
    }

    /// Link `id` into the active ring (no-op when already linked).
    pub fn add_active(&mut self, id: VarId) -> CompileResult<()> {
        if self.is_active(id) {
            return Ok(());
        }
        self.get(id)?;
        match self.active_head {
            None => {
                let var = &mut self.vars[id.0 as usize];
                var.next_active = Some(id);
                var.prev_active = Some(id);
                self.active_head = Some(id);
            }
            Some(head) => {
                let tail = self.vars[head.0 as usize].prev_active.unwrap_or(head);
                self.vars[id.0 as usize].next_active = Some(head);
                self.vars[id.0 as usize].prev_active = Some(tail);
                self.vars[tail.0 as usize].next_active = Some(id);
                self.vars[head.0 as usize].prev_active = Some(id);
            }
        }
        Ok(())
    }

    /// Unlink `id` from the active ring (no-op when not linked).
    pub fn remove_active(&mut self, id: VarId) {
        if !self.is_active(id) {
            return;
        }
        let (next, prev) = {
            let var = &self.vars[id.0 as usize];
            (var.next_active, var.prev_active)
        };
        if next == Some(id) {
            self.active_head = None;
        } else {
            if let Some(prev) = prev {
                self.vars[prev.0 as usize].next_active = next;
            }
            if let Some(next) = next {
                self.vars[next.0 as usize].prev_active = prev;
            }
            if self.active_head == Some(id) {
                self.active_head = next;
            }
        }
        let var = &mut self.vars[id.0 as usize];
        var.next_active = None;
        var.prev_active = None;
    }

    /// Snapshot of the active ring in insertion order.
    pub fn active_ids(&self) -> Vec<VarId> {
        let mut ids = Vec::new();
        let Some(head) = self.active_head else {
            return ids;
        };
        let mut cur = head;
        loop {
            ids.push(cur);
            match self.vars[cur.0 as usize].next_active {
                Some(next) if next != head => cur = next,
                _ => break,
            }
        }
        ids
    }

    /// Empty the active ring.
    pub fn clear_active(&mut self) {
        for id in self.active_ids() {
            let var = &mut self.vars[id.0 as usize];
            var.next_active = None;
            var.prev_active = None;
        }
        self.active_head = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_properties() {
        assert_eq!(VariableType::Gpd.size(), 4);
        assert_eq!(VariableType::Xmm1D.size(), 8);
        assert_eq!(VariableType::Xmm2D.size(), 16);
        assert_eq!(VariableType::Xmm1F.reg_size(), 16);
        assert_eq!(VariableType::Mm.class(), Some(RegClass::Mm));
        assert_eq!(VariableType::X87.class(), None);
        assert_eq!(VariableType::Xmm1F.move_opcode(), Opcode::Movss);
        assert_eq!(VariableType::Gpq.move_opcode(), Opcode::Mov);
    }

    #[test]
    fn test_x87_rejected_at_creation() {
        let mut registry = VariableRegistry::new();
        let err = registry.new_var(VariableType::X87_1D, FunctionId(0));
        assert!(matches!(err, Err(CompileError::Unsupported { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_active_ring() {
        let mut registry = VariableRegistry::new();
        let a = registry.new_var(VariableType::Gpq, FunctionId(0)).unwrap();
        let b = registry.new_var(VariableType::Gpd, FunctionId(0)).unwrap();
        let c = registry.new_var(VariableType::Xmm, FunctionId(0)).unwrap();

        registry.add_active(a).unwrap();
        registry.add_active(b).unwrap();
        registry.add_active(c).unwrap();
        registry.add_active(b).unwrap();
        assert_eq!(registry.active_ids(), vec![a, b, c]);

        registry.remove_active(a);
        assert_eq!(registry.active_ids(), vec![b, c]);
        assert!(!registry.is_active(a));

        registry.remove_active(c);
        registry.remove_active(b);
        assert!(registry.active_ids().is_empty());

        registry.add_active(c).unwrap();
        assert_eq!(registry.active_ids(), vec![c]);
        registry.clear_active();
        assert!(!registry.is_active(c));
    }

    #[test]
    fn test_unknown_variable() {
        let registry = VariableRegistry::new();
        assert!(matches!(
            registry.get(VarId(3)),
            Err(CompileError::UnknownVariable { id: 3 })
        ));
    }

    #[test]
    fn test_access_merge() {
        assert_eq!(Access::Read.merge(Access::Read), Access::Read);
        assert_eq!(Access::Read.merge(Access::Write), Access::ReadWrite);
        assert!(Access::ReadWrite.reads() && Access::ReadWrite.writes());
    }
}
