// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession is the central hub of one compilation: it borrows the arena that owns
// operand lists, comments and allocator state snapshots, and it owns the item graph, the
// variable registry, the label table, the per-function records, the stored prototypes, the
// allocator context and the statistics. Everything that runs during compilation receives the
// session by exclusive reference, so nested emission (a spill emitted while allocating) is a
// plain method call on the same session. CompilerOptions carries the global configuration
// (CPU vendor, comment forwarding, OS stack alignment override) and FunctionHints the
// per-function frame hints. SessionStats tracks functions compiled, code size, items
// translated, instructions emitted per opcode, register allocations, spills, loads,
// exchanges, state restores and resolved forward jumps.

//! Arena-based compilation session management.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::fmt;

use super::context::CompilationContext;
use super::error::{CompileError, CompileResult};
use super::item::{FunctionId, ItemGraph, ItemId, ItemKind, LabelId, PrototypeId, TargetItem};
use super::operand::Opcode;
use super::variable::{VarId, VariableRegistry};
use crate::x64::calling_convention::FunctionPrototype;
use crate::x64::frame::FrameLayout;

/// CPU vendor, used to pick between equivalent epilogue idioms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuVendor {
    Intel,
    Amd,
    #[default]
    Unknown,
}

/// Global compiler configuration.
#[derive(Debug, Clone, Default)]
pub struct CompilerOptions {
    pub cpu_vendor: CpuVendor,
    /// Forward item comments to the encoder.
    pub emit_comments: bool,
    /// Overrides the calling convention's stack alignment fact.
    pub stack_aligned_by_os: Option<bool>,
}

/// Per-function frame hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionHints {
    /// No base pointer frame.
    pub naked: bool,
    /// Preserve callee-saved GP registers with push/pop instead of moves.
    pub push_pop_sequence: bool,
    pub emms: bool,
    pub sfence: bool,
    pub lfence: bool,
    pub mfence: bool,
}

/// Builder-side record of a function.
#[derive(Debug, Clone)]
pub struct FunctionData {
    pub prototype: PrototypeId,
    pub hints: FunctionHints,
    /// Function item.
    pub item: ItemId,
    pub entry_label: LabelId,
    pub exit_label: LabelId,
    /// FunctionEnd item, set when the function is closed.
    pub end: Option<ItemId>,
    pub args: Vec<VarId>,
    /// Frame geometry, known once the function is compiled.
    pub frame: Option<FrameLayout>,
}

/// Compilation session with arena-based memory management.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    pub(crate) options: CompilerOptions,
    pub(crate) graph: ItemGraph<'arena>,
    pub(crate) vars: VariableRegistry,
    /// Target item of each label.
    pub(crate) labels: Vec<ItemId>,
    pub(crate) functions: Vec<FunctionData>,
    pub(crate) prototypes: Vec<FunctionPrototype>,
    pub(crate) ctx: CompilationContext<'arena>,
    pub(crate) current_function: Option<FunctionId>,
    stats: SessionStats,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session using the provided arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self::with_options(arena, CompilerOptions::default())
    }

    pub fn with_options(arena: &'arena Bump, options: CompilerOptions) -> Self {
        Self {
            arena,
            options,
            graph: ItemGraph::new(),
            vars: VariableRegistry::new(),
            labels: Vec::new(),
            functions: Vec::new(),
            prototypes: Vec::new(),
            ctx: CompilationContext::new(),
            current_function: None,
            stats: SessionStats::default(),
        }
    }

    /// Get the arena allocator for this session.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Copy a string into the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        self.arena.alloc_str(s)
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn graph(&self) -> &ItemGraph<'arena> {
        &self.graph
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.vars
    }

    pub fn context(&self) -> &CompilationContext<'arena> {
        &self.ctx
    }

    pub fn function(&self, id: FunctionId) -> CompileResult<&FunctionData> {
        self.functions
            .get(id.0 as usize)
            .ok_or_else(|| CompileError::usage(format!("unknown function {}", id.0)))
    }

    pub(crate) fn function_mut(&mut self, id: FunctionId) -> CompileResult<&mut FunctionData> {
        self.functions
            .get_mut(id.0 as usize)
            .ok_or_else(|| CompileError::usage(format!("unknown function {}", id.0)))
    }

    pub fn prototype(&self, id: PrototypeId) -> CompileResult<&FunctionPrototype> {
        self.prototypes
            .get(id.0 as usize)
            .ok_or_else(|| CompileError::usage(format!("unknown prototype {}", id.0)))
    }

    pub(crate) fn add_prototype(&mut self, prototype: FunctionPrototype) -> PrototypeId {
        self.prototypes.push(prototype);
        PrototypeId(self.prototypes.len() as u32 - 1)
    }

    /// Target item bound to `label`.
    pub fn label_target(&self, label: LabelId) -> CompileResult<ItemId> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .ok_or(CompileError::UnknownLabel { id: label.0 })
    }

    /// New label with an unlinked target item.
    pub(crate) fn create_label(&mut self) -> LabelId {
        let label = LabelId(self.labels.len() as u32);
        let target = self.graph.create(ItemKind::Target(TargetItem {
            label,
            state: None,
            first_jump: None,
            jump_count: 0,
        }));
        self.labels.push(target);
        label
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    pub(crate) fn record_instruction(&mut self, opcode: Opcode) {
        self.stats.instructions_emitted += 1;
        *self
            .stats
            .instruction_counts
            .entry(opcode.name())
            .or_insert(0) += 1;
    }

    pub(crate) fn record_function_compiled(&mut self, code_size: usize) {
        self.stats.functions_compiled += 1;
        self.stats.total_code_size = code_size;
        log::debug!(
            "compiled function #{} ({} bytes emitted so far)",
            self.stats.functions_compiled,
            code_size
        );
    }
}

/// Statistics collected during compilation.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of functions compiled.
    pub functions_compiled: usize,

    /// Total code size emitted so far (bytes).
    pub total_code_size: usize,

    /// Items passed through translation.
    pub items_translated: usize,

    /// Instructions handed to the encoder.
    pub instructions_emitted: usize,

    /// Count of each instruction emitted.
    pub instruction_counts: HashMap<&'static str, usize>,

    /// Registers allocated.
    pub registers_allocated: usize,

    /// Variables spilled.
    pub spills: usize,

    /// Loads from spill slots.
    pub loads: usize,

    /// Register to register relocations.
    pub exchanges: usize,

    /// State reconciliations.
    pub state_restores: usize,

    /// Forward jumps resolved after translation.
    pub forward_jumps_resolved: usize,

    /// Unreachable items removed.
    pub items_removed: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Items translated: {}", self.items_translated)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Spills: {}", self.spills)?;
        writeln!(f, "  Loads: {}", self.loads)?;
        writeln!(f, "  Exchanges: {}", self.exchanges)?;
        writeln!(f, "  State restores: {}", self.state_restores)?;
        writeln!(f, "  Forward jumps resolved: {}", self.forward_jumps_resolved)?;
        if self.items_removed > 0 {
            writeln!(f, "  Unreachable items removed: {}", self.items_removed)?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        assert_eq!(session.stats().functions_compiled, 0);
        assert_eq!(session.label_count(), 0);
        assert!(session.graph().is_empty());
        assert_eq!(session.options().cpu_vendor, CpuVendor::Unknown);
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("spill slot");
        assert_eq!(s1, "spill slot");
    }

    #[test]
    fn test_unknown_label() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(matches!(
            session.label_target(LabelId(2)),
            Err(CompileError::UnknownLabel { id: 2 })
        ));
    }

    #[test]
    fn test_labels_own_unlinked_targets() {
        let arena = Bump::new();
        let mut session = CompilationSession::new(&arena);
        let a = session.create_label();
        let b = session.create_label();
        assert_eq!(b, LabelId(1));
        let target = session.label_target(a).unwrap();
        assert!(!session.graph().get(target).unwrap().linked);
        assert!(matches!(
            session.graph().kind(target).unwrap(),
            ItemKind::Target(TargetItem { label, .. }) if label == a
        ));
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let mut session = CompilationSession::new(&arena);

        session.record_instruction(Opcode::Mov);
        session.record_instruction(Opcode::Mov);
        session.record_instruction(Opcode::Add);
        session.stats_mut().spills = 3;
        session.record_function_compiled(42);

        let display = format!("{}", session.stats());
        assert!(display.contains("Functions compiled: 1"));
        assert!(display.contains("Instructions emitted: 3"));
        assert!(display.contains("Spills: 3"));
        assert!(display.contains("mov: 2"));
        assert!(display.contains("Total code size: 42 bytes"));
    }
}
