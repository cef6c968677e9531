//! regjit - a JIT compiler core with local register allocation.
//!
//! Programs are built as a graph of items over typed virtual registers. At
//! serialization time every function is translated along its control flow:
//! variables are bound to physical registers on demand, spilled to stack slots
//! under pressure, and reconciled at every jump so all paths into a label agree
//! on where each variable lives. A stack frame is then computed and the
//! resolved instructions are handed to an encoder.
//!
//! # Primary Usage
//!
//! ```
//! use bumpalo::Bump;
//! use regjit::core::{CompilationSession, Compiler, FunctionHints, Opcode, VariableType};
//! use regjit::x64::{FunctionPrototype, X64Encoder};
//!
//! let arena = Bump::new();
//! let mut session = CompilationSession::new(&arena);
//! let mut c = Compiler::new(&mut session);
//!
//! let proto = FunctionPrototype::sysv(&[VariableType::Gpq; 2], &[VariableType::Gpq])?;
//! c.new_function(proto, FunctionHints::default())?;
//! let a = c.arg(0)?;
//! let b = c.arg(1)?;
//! c.emit(Opcode::Add, &[a.into(), b.into()])?;
//! c.ret(&[a.into()])?;
//! c.end_function()?;
//!
//! let mut encoder = X64Encoder::new()?;
//! let code = c.make(&mut encoder)?;
//! assert!(!code.is_empty());
//! # Ok::<(), regjit::core::CompileError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Item graph, variables, allocator, driver
//! - [`x64`] - x86-64 specific code (calling convention, frame, encoder)

pub mod core;
pub mod x64;

pub use self::core::{
    CompilationSession, CompileError, CompileResult, Compiler, CompilerOptions, Encoder,
    FunctionHints, Opcode, Operand, VariableType,
};
