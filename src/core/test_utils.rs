//! Test utilities for arena-based testing.
//!
//! `TestContext` owns the arena a test session borrows, and `RecordingEncoder`
//! captures the resolved item stream so tests can assert on spills, loads and
//! reconciliation code without decoding machine code.

use bumpalo::Bump;
use hashbrown::HashSet;

use super::encoder::{Encoder, EncodingError};
use super::item::LabelId;
use super::operand::{Mem, MemBase, Opcode, Operand};
use super::register_file::{gp, Reg, RegClass};
use super::session::{CompilationSession, CompilerOptions};

/// Test context that manages arena lifetime for tests.
pub struct TestContext {
    arena: Bump,
}

impl TestContext {
    pub fn new() -> Self {
        Self { arena: Bump::new() }
    }

    /// Create a test context with specified capacity, simulating memory limits.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Bump::with_capacity(capacity),
        }
    }

    pub fn arena(&self) -> &Bump {
        &self.arena
    }

    /// Create a compilation session using this context's arena.
    pub fn create_session(&self) -> CompilationSession<'_> {
        CompilationSession::new(&self.arena)
    }

    pub fn create_session_with(&self, options: CompilerOptions) -> CompilationSession<'_> {
        CompilationSession::with_options(&self.arena, options)
    }

    /// Bytes allocated by the arena so far.
    pub fn memory_used(&self) -> usize {
        self.arena.allocated_bytes()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a test with a temporary arena context.
pub fn with_test_context<F, R>(f: F) -> R
where
    F: FnOnce(&TestContext) -> R,
{
    let ctx = TestContext::new();
    f(&ctx)
}

/// One entry of the recorded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Instruction { opcode: Opcode, operands: Vec<Operand> },
    Label(LabelId),
    Align(u32),
    Data(Vec<u8>),
    Comment(String),
}

/// Encoder that records what it is given.
#[derive(Debug, Default)]
pub struct RecordingEncoder {
    entries: Vec<Recorded>,
    defined: HashSet<LabelId>,
    marked: HashSet<LabelId>,
}

fn is_stack_mem(m: &Mem) -> bool {
    matches!(
        m.base,
        Some(MemBase::Reg(Reg { class: RegClass::Gp, index }))
            if index == gp::RSP || index == gp::RBP
    )
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Recorded] {
        &self.entries
    }

    /// Recorded instructions in order.
    pub fn instructions(&self) -> impl Iterator<Item = (Opcode, &[Operand])> {
        self.entries.iter().filter_map(|e| match e {
            Recorded::Instruction { opcode, operands } => Some((*opcode, operands.as_slice())),
            _ => None,
        })
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.instructions().filter(|(op, _)| *op == opcode).count()
    }

    /// Instructions touching stack memory, prolog and epilog included.
    pub fn stack_accesses(&self) -> usize {
        self.instructions()
            .filter(|(_, ops)| ops.iter().any(|op| matches!(op, Operand::Mem(m) if is_stack_mem(m))))
            .count()
    }

    /// Stores of `reg` (any width) to stack memory.
    pub fn stores_of(&self, reg: Reg) -> usize {
        self.instructions()
            .filter(|(_, ops)| {
                matches!(ops, [Operand::Mem(m), Operand::Reg(r)] if is_stack_mem(m) && r.reg == reg)
            })
            .count()
    }

    /// Loads of `reg` (any width) from stack memory.
    pub fn loads_of(&self, reg: Reg) -> usize {
        self.instructions()
            .filter(|(_, ops)| {
                matches!(ops, [Operand::Reg(r), Operand::Mem(m)] if is_stack_mem(m) && r.reg == reg)
            })
            .count()
    }

    /// Index of the first instruction with `opcode`.
    pub fn position(&self, opcode: Opcode) -> Option<usize> {
        self.instructions().position(|(op, _)| op == opcode)
    }

    pub fn embedded(&self) -> Vec<u8> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Recorded::Data(d) => Some(d.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn comments(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Recorded::Comment(c) => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Encoder for RecordingEncoder {
    fn define_label(&mut self, label: LabelId) {
        self.defined.insert(label);
    }

    fn mark_label(&mut self, label: LabelId) -> Result<(), EncodingError> {
        if !self.defined.contains(&label) {
            return Err(EncodingError::AssemblyError(format!("label {} is not defined", label.0)));
        }
        if !self.marked.insert(label) {
            return Err(EncodingError::AssemblyError(format!("label {} bound twice", label.0)));
        }
        self.entries.push(Recorded::Label(label));
        Ok(())
    }

    fn is_label_marked(&self, label: LabelId) -> bool {
        self.marked.contains(&label)
    }

    fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError> {
        for operand in operands {
            match operand {
                Operand::Label(label) if !self.defined.contains(label) => {
                    return Err(EncodingError::AssemblyError(format!(
                        "label {} is not defined",
                        label.0
                    )));
                }
                op if !op.is_resolved() => return Err(EncodingError::UnresolvedOperand),
                _ => {}
            }
        }
        self.entries.push(Recorded::Instruction {
            opcode,
            operands: operands.to_vec(),
        });
        Ok(())
    }

    fn align(&mut self, alignment: u32) -> Result<(), EncodingError> {
        self.entries.push(Recorded::Align(alignment));
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> Result<(), EncodingError> {
        self.entries.push(Recorded::Data(data.to_vec()));
        Ok(())
    }

    fn comment(&mut self, text: &str) {
        self.entries.push(Recorded::Comment(text.to_string()));
    }

    fn finish(&mut self) -> Result<Vec<u8>, EncodingError> {
        Ok(self.embedded())
    }

    fn code_size(&self) -> usize {
        self.instructions().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_encoder_checks_labels() {
        let mut encoder = RecordingEncoder::new();
        assert!(encoder.mark_label(LabelId(0)).is_err());
        encoder.define_label(LabelId(0));
        encoder.mark_label(LabelId(0)).unwrap();
        assert!(encoder.is_label_marked(LabelId(0)));
        assert!(encoder.mark_label(LabelId(0)).is_err());
    }

    #[test]
    fn test_recording_encoder_counts_stack_traffic() {
        let mut encoder = RecordingEncoder::new();
        let slot = Operand::Mem(Mem::base(Reg::gp(gp::RSP), -8, 8));
        encoder.emit(Opcode::Mov, &[slot, Operand::gpq(gp::RBX)]).unwrap();
        encoder.emit(Opcode::Mov, &[Operand::gpq(gp::RCX), slot]).unwrap();
        encoder.emit(Opcode::Add, &[Operand::gpq(gp::RCX), Operand::Imm(1)]).unwrap();

        assert_eq!(encoder.stack_accesses(), 2);
        assert_eq!(encoder.stores_of(Reg::gp(gp::RBX)), 1);
        assert_eq!(encoder.loads_of(Reg::gp(gp::RCX)), 1);
        assert_eq!(encoder.position(Opcode::Add), Some(2));
        assert_eq!(encoder.code_size(), 3);
    }

    #[test]
    fn test_unresolved_operands_are_rejected() {
        let mut encoder = RecordingEncoder::new();
        let home = Operand::Mem(Mem::home(crate::core::variable::VarId(0), 8));
        assert_eq!(
            encoder.emit(Opcode::Mov, &[Operand::gpq(0), home]),
            Err(EncodingError::UnresolvedOperand)
        );
    }

    #[test]
    fn test_context_session() {
        with_test_context(|ctx| {
            let session = ctx.create_session();
            assert_eq!(session.label_count(), 0);
        });
    }
}
