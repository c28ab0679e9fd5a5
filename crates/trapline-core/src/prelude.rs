//! Common module for library exports

pub use crate::breakpoints::{BreakpointOwner, BreakpointSite, SiteId};
pub use crate::code::{CodeBuilder, CodePatcher, CodeStore, CompiledCode, FunctionSpec, GlobalDesc, GlobalKind, Tier};
pub use crate::debug_state::DebugState;
pub use crate::error::{Result, TraplineError};
pub use crate::instance::Instance;
pub use crate::memory::{MemoryUsage, SeenSets};
pub use crate::module::{Module, SharedModule};
pub use crate::source_map::{ExprLoc, SourceLocation};
pub use crate::types::{BytecodeOffset, DebuggerId, ExprType, FuncIndex, GlobalIndex, HandlerId, HostValue, InstanceId, Val, ValType};
