// This module is the target-independent half of the compiler. The item graph holds the
// program as a doubly linked list of instructions, jumps, targets and function markers; the
// variable registry tracks every virtual register and its live range; the compilation context
// and the passes allocate physical registers while walking the graph along control flow, with
// state snapshots keeping all paths into a label consistent. The session ties these together
// around a bumpalo arena, the compiler exposes the builder API and the serialization driver,
// and the encoder trait is the boundary to machine code generation.

//! Core compiler infrastructure.
//!
//! # Key Components
//!
//! ## Item graph (`item`)
//! - Arena of items linked in program order, with an insertion cursor
//! - Labels own exactly one Target item
//!
//! ## Variables (`variable`, `register_file`, `memory`)
//! - Typed virtual registers with live ranges and access counters
//! - Physical register occupancy per register class
//! - Spill slot pool with exact-size reuse
//!
//! ## Allocation (`context`, `state`, `passes`)
//! - Local register allocation during translation
//! - Snapshots at targets, reconciliation at jumps
//!
//! ## Driver (`session`, `compiler`, `encoder`)
//! - Arena-backed session with statistics
//! - Builder API and per-function pipeline

pub mod compiler;
pub mod context;
pub mod encoder;
pub mod error;
pub mod item;
pub mod memory;
pub mod operand;
mod passes;
pub mod register_file;
pub mod session;
pub mod state;
pub mod test_utils;
pub mod variable;

pub use compiler::Compiler;
pub use encoder::{Encoder, EncodingError};
pub use error::{CompileError, CompileResult};
pub use item::{BranchHint, FunctionId, ItemId, LabelId};
pub use operand::{Condition, Mem, MemBase, Opcode, Operand, VarRef};
pub use register_file::{gp, Reg, RegClass, RegMask};
pub use session::{CompilationSession, CompilerOptions, CpuVendor, FunctionHints, SessionStats};
pub use variable::{VarId, VariableType};
