//! # trapline-core
//!
//! Debug-instrumentation control plane for compiled binary modules.
//!
//! This crate lets an external debugger work against live compiled code:
//! - Breakpoints at bytecode offsets, installed by patching trap slots
//! - Ref-counted per-function single stepping
//! - Ref-counted function entry/exit ("frame") traps
//! - Translation between bytecode offsets and source line/column positions
//! - Reading globals, local types and result types of a paused instance
//! - Memory accounting that deduplicates shared code and module bytes
//!
//! Everything debugger-facing goes through [`DebugState`], which owns the
//! instance's compiled code exclusively while it is being debugged.
//!
//! ## Addressing
//!
//! Instruction offsets are byte offsets into the module's canonical binary
//! encoding. They are stable across compiler tiers and debug sessions.

pub mod breakpoints;
pub mod code;
pub mod debug_state;
pub mod error;
pub mod frame_traps;
pub mod instance;
pub mod memory;
pub mod module;
pub mod prelude;
pub mod source_map;
pub mod stepping;
pub mod types;

pub use debug_state::DebugState;
// Re-export commonly used types
pub use error::{Result, TraplineError};
pub use types::{BytecodeOffset, FuncIndex};
