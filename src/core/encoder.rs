// This module defines the interface between the compiler and a machine code encoder. The
// compiler hands over fully resolved instructions (no variable operands, no unbound homes)
// together with label definitions and bindings, alignment requests, raw data and optional
// comments; the encoder owns the byte layout, branch displacement resolution and the final
// code buffer. EncodingError is the error type every encoder reports, it converts into the
// compiler's error type transparently.

//! Encoder interface consumed by the compiler.

use super::item::LabelId;
use super::operand::{Opcode, Operand};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Assembly error from the backing assembler.
    AssemblyError(String),
    /// Memory operand construction failed.
    InvalidMemoryOperand,
    /// An operand still refers to a variable or an unbound home.
    UnresolvedOperand,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidMemoryOperand => write!(f, "Invalid memory operand"),
            EncodingError::UnresolvedOperand => write!(f, "Operand was not resolved"),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Machine code sink driven by `Compiler::serialize`.
pub trait Encoder {
    /// Make `label` known before any instruction refers to it.
    fn define_label(&mut self, label: LabelId);

    /// Bind `label` to the current position.
    fn mark_label(&mut self, label: LabelId) -> Result<(), EncodingError>;

    fn is_label_marked(&self, label: LabelId) -> bool;

    /// Encode one instruction with its explicit operands.
    fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError>;

    /// Pad the code with NOPs up to a multiple of `alignment`.
    fn align(&mut self, alignment: u32) -> Result<(), EncodingError>;

    /// Append raw bytes.
    fn embed(&mut self, data: &[u8]) -> Result<(), EncodingError>;

    fn comment(&mut self, _text: &str) {}

    /// Produce the final code.
    fn finish(&mut self) -> Result<Vec<u8>, EncodingError>;

    /// Number of instructions or bytes handed over so far, an estimate before `finish`.
    fn code_size(&self) -> usize;
}
