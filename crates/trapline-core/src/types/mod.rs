//! # Types
//!
//! Small value types shared by every part of the debug layer.
//!
//! Offsets, indices and identities are newtypes so that a bytecode offset,
//! a function index and a machine-code position can never be confused with
//! one another, even though all of them are 32-bit integers underneath.

pub mod ids;
pub mod offset;
pub mod value;

// Re-export all public types
pub use ids::{DebuggerId, FuncIndex, GlobalIndex, HandlerId, InstanceId};
pub use offset::BytecodeOffset;
pub use value::{ExprType, HostValue, Val, ValType};
