// This module implements allocator state snapshots and their replay. A snapshot records which
// variable occupies each physical register, which of those registers are dirty, and which
// variables currently live in memory. Targets freeze the state they are first reached with;
// every jump into a target must leave the machine in that state. `save_state` captures the
// live context into the arena, `assign_state` adopts a snapshot as the live context without
// emitting code (used when resuming after an unconditional jump, or when resolving a deferred
// forward jump), and `restore_state` emits the spills, flushes and loads that turn the live
// context into a given snapshot: first every conflicting occupant is evicted, then every
// register the snapshot expects is filled.

//! Allocator state snapshots and reconciliation.

use hashbrown::HashMap;

use super::error::{CompileError, CompileResult};
use super::register_file::{Occupants, RegClass, RegMask, NUM_REG_CLASSES};
use super::session::CompilationSession;
use super::variable::{Access, VarId, VarState};

/// Point-in-time register and memory assignment of a function's variables.
#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot<'a> {
    pub regs: Occupants,
    /// Registers whose occupant was dirty.
    pub changed: [RegMask; NUM_REG_CLASSES],
    /// Variables in the Memory state.
    pub mem_vars: &'a [VarId],
}

impl StateSnapshot<'_> {
    pub fn occupant(&self, class: RegClass, index: u8) -> Option<VarId> {
        self.regs[class.index()][index as usize]
    }

    /// Same register assignment, ignoring dirty bits and memory residents.
    pub fn same_registers(&self, other: &StateSnapshot<'_>) -> bool {
        self.regs == other.regs
    }
}

impl<'a> CompilationSession<'a> {
    /// Capture the live allocator state into the arena.
    pub(crate) fn save_state(&mut self) -> CompileResult<&'a StateSnapshot<'a>> {
        let function = self.ctx.function.ok_or(CompileError::NoFunction)?;
        let regs = *self.ctx.registers.occupants();

        let mut changed = [RegMask::EMPTY; NUM_REG_CLASSES];
        for class in RegClass::ALL {
            for index in 0..class.count() {
                if let Some(id) = regs[class.index()][index as usize] {
                    if self.vars.get(id)?.changed {
                        changed[class.index()].insert(index);
                    }
                }
            }
        }

        let mem: Vec<VarId> = self
            .vars
            .iter()
            .filter(|v| v.function == function && v.state == VarState::Memory)
            .map(|v| v.id)
            .collect();
        let mem_vars: &'a [VarId] = self.arena().alloc_slice_copy(&mem);

        Ok(self.arena().alloc(StateSnapshot {
            regs,
            changed,
            mem_vars,
        }))
    }

    /// Make `state` the live context without emitting any code.
    pub(crate) fn assign_state(&mut self, state: &StateSnapshot<'a>) -> CompileResult<()> {
        let function = self.ctx.function.ok_or(CompileError::NoFunction)?;

        for id in self.vars.function_vars(function) {
            let var = self.vars.get_mut(id)?;
            var.state = VarState::Unused;
            var.reg = None;
            var.changed = false;
        }
        for &id in state.mem_vars {
            self.vars.get_mut(id)?.state = VarState::Memory;
        }

        self.ctx.registers.load(&state.regs);
        for class in RegClass::ALL {
            for index in 0..class.count() {
                if let Some(id) = state.regs[class.index()][index as usize] {
                    let var = self.vars.get_mut(id)?;
                    var.state = VarState::Register;
                    var.reg = Some(index);
                    var.changed = state.changed[class.index()].contains(index);
                }
            }
        }
        Ok(())
    }

    /// Emit code that turns the live context into `state`.
    pub(crate) fn restore_state(&mut self, state: &StateSnapshot<'a>) -> CompileResult<()> {
        let function = self.ctx.function.ok_or(CompileError::NoFunction)?;
        log::trace!("restoring allocator state");

        let mut target_states: HashMap<VarId, VarState> = HashMap::new();
        for class in RegClass::ALL {
            for id in state.regs[class.index()].iter().flatten() {
                target_states.insert(*id, VarState::Register);
            }
        }
        for &id in state.mem_vars {
            target_states.insert(id, VarState::Memory);
        }
        let target_of =
            |id: VarId| target_states.get(&id).copied().unwrap_or(VarState::Unused);

        // Evict every occupant that does not match, flush dirty registers the
        // target expects to be clean.
        for class in RegClass::ALL {
            for index in 0..class.count() {
                let from = self.ctx.registers.occupants()[class.index()][index as usize];
                let to = state.occupant(class, index);
                match from {
                    Some(from) if Some(from) != to => {
                        if target_of(from) == VarState::Unused {
                            self.unuse_var(from, VarState::Unused)?;
                        } else {
                            self.spill_var(from)?;
                        }
                    }
                    Some(from) => {
                        if self.vars.get(from)?.changed
                            && !state.changed[class.index()].contains(index)
                        {
                            self.save_var(from)?;
                        }
                    }
                    None => {}
                }
            }
        }

        // Fill the registers the target expects.
        for class in RegClass::ALL {
            for index in 0..class.count() {
                let from = self.ctx.registers.occupants()[class.index()][index as usize];
                let to = state.occupant(class, index);
                if let Some(to) = to {
                    if from != Some(to) {
                        self.alloc_var(to, RegMask::single(index), Access::Read)?;
                    }
                }
            }
        }

        for id in self.vars.function_vars(function) {
            let target = target_of(id);
            if target != VarState::Register {
                let var = self.vars.get_mut(id)?;
                var.state = target;
                var.reg = None;
                var.changed = false;
            }
        }

        self.stats_mut().state_restores += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_registers_ignores_memory() {
        let mut regs: Occupants = Default::default();
        regs[RegClass::Gp.index()][3] = Some(VarId(1));
        let mem = [VarId(2)];
        let a = StateSnapshot {
            regs,
            changed: [RegMask::EMPTY; NUM_REG_CLASSES],
            mem_vars: &mem,
        };
        let b = StateSnapshot {
            regs,
            changed: [RegMask::single(3), RegMask::EMPTY, RegMask::EMPTY],
            mem_vars: &[],
        };
        assert!(a.same_registers(&b));
        assert_eq!(a.occupant(RegClass::Gp, 3), Some(VarId(1)));
        assert_eq!(a.occupant(RegClass::Xmm, 3), None);
    }
}
