// This module defines the error taxonomy of the compiler using the thiserror crate.
// CompileError covers three families of failures. Usage errors are malformed graph
// operations made by the builder layer (double-linking an item, unknown variable or label
// ids, operations outside their phase). Resource failures abort a function: no register or
// spill candidate is available, or a function was never closed. Unsupported-feature errors
// are raised at the offending builder call. Encoder failures are wrapped through the
// Encoding variant so that `?` works across the Encoder boundary. CompileResult<T> is the
// alias used throughout the crate.

//! Error types for the compiler.
//!
//! Using thiserror for idiomatic error handling.

use crate::core::encoder::EncodingError;
use thiserror::Error;

/// Main error type for compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Usage error: {reason}")]
    Usage { reason: String },

    #[error("Unknown variable: {id}")]
    UnknownVariable { id: u32 },

    #[error("Unknown label: {id}")]
    UnknownLabel { id: u32 },

    #[error("Item is already linked into the graph")]
    ItemAlreadyLinked,

    #[error("Item was already translated")]
    AlreadyTranslated,

    #[error("No function is open")]
    NoFunction,

    #[error("A function is already open")]
    FunctionInProgress,

    #[error("Registers overlap")]
    RegistersOverlap,

    #[error("Not enough registers")]
    NotEnoughRegisters,

    #[error("Function is not finished")]
    IncompleteFunction,

    #[error("Unsupported: {what}")]
    Unsupported { what: String },

    #[error("Naked function can't align stack")]
    NakedAlignment,

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl CompileError {
    pub(crate) fn usage(reason: impl Into<String>) -> Self {
        CompileError::Usage {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_descriptive() {
        assert_eq!(CompileError::NotEnoughRegisters.to_string(), "Not enough registers");
        assert_eq!(CompileError::RegistersOverlap.to_string(), "Registers overlap");
        assert_eq!(
            CompileError::UnknownVariable { id: 7 }.to_string(),
            "Unknown variable: 7"
        );
        assert_eq!(
            CompileError::usage("bad cursor").to_string(),
            "Usage error: bad cursor"
        );
    }

    #[test]
    fn encoding_errors_convert() {
        fn fails() -> CompileResult<()> {
            Err(EncodingError::UnresolvedOperand)?
        }
        assert!(matches!(fails(), Err(CompileError::Encoding(_))));
    }
}
