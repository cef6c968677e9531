//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - System V calling convention implementation
//! - Function frame geometry and prolog/epilog synthesis
//! - Instruction encoding using iced-x86

pub mod calling_convention;
pub mod encoder;
pub mod frame;

pub use calling_convention::{ArgLocation, CCAssigner, FunctionPrototype, SysVAssigner};
pub use encoder::X64Encoder;
pub use frame::{FrameInput, FrameLayout};
