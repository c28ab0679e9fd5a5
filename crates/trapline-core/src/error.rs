//! # Error Types
//!
//! General error handling for the debug-instrumentation layer.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use std::collections::TryReserveError;

use thiserror::Error;

use crate::code::Tier;
use crate::types::{BytecodeOffset, FuncIndex, GlobalIndex, InstanceId};

/// Main error type for debug-state operations
///
/// ## Error Categories
///
/// 1. **Resource errors**: OutOfMemory. Tables are left exactly as they were
///    before the failing call.
/// 2. **Lookup errors**: FuncIndexOutOfRange, GlobalIndexOutOfRange, NoTrapSite,
///    NoBreakpointSite, TierUnavailable, InstanceMismatch. Debuggers routinely
///    probe speculative offsets and indices, so these are ordinary results, not faults.
/// 3. **Contract violations**: StepModeUnderflow, FrameTrapUnderflow. These point
///    at an unbalanced caller and are never clamped.
/// 4. **Ownership errors**: CodeShared, DebugNotEnabled
/// 5. **Module/code errors**: InvalidModule, CorruptCode, Io
#[derive(Error, Debug)]
pub enum TraplineError
{
    /// An allocation needed to record debug state failed
    #[error("Out of memory while {what}")]
    OutOfMemory
    {
        /// What the allocation was for
        what: &'static str,
    },

    /// The compiled code is still referenced by another instance
    ///
    /// Instrumentation writes into machine code, so debugging requires the
    /// code to be exclusively owned by the debugged instance.
    #[error("Compiled code is shared with {holders} other holder(s) and cannot be debugged")]
    CodeShared
    {
        /// Number of other strong references observed
        holders: usize,
    },

    /// The compiled code carries no Debug tier
    #[error("Code was not compiled with debugging enabled")]
    DebugNotEnabled,

    /// The requested tier was never compiled for this code
    #[error("Tier {0} is not available")]
    TierUnavailable(Tier),

    /// The offset is not an instrumentable instruction boundary
    #[error("No trap site at bytecode offset {0}")]
    NoTrapSite(BytecodeOffset),

    /// No breakpoint site exists at the offset
    #[error("No breakpoint site at bytecode offset {0}")]
    NoBreakpointSite(BytecodeOffset),

    /// The function index is outside the module's function index space
    #[error("Function index {index} out of range (module has {count} functions)")]
    FuncIndexOutOfRange
    {
        /// The rejected index
        index: FuncIndex,
        /// Number of functions in the module
        count: usize,
    },

    /// The global index is outside the instance's globals
    #[error("Global index {index} out of range (instance has {count} globals)")]
    GlobalIndexOutOfRange
    {
        /// The rejected index
        index: GlobalIndex,
        /// Number of globals
        count: usize,
    },

    /// The instance passed in is not the one this debug state belongs to
    #[error("Instance {found} is not the debugged instance {expected}")]
    InstanceMismatch
    {
        /// Instance being debugged
        expected: InstanceId,
        /// Instance passed by the caller
        found: InstanceId,
    },

    /// A step-mode count was decremented below zero
    #[error("Step mode count for {0} decremented below zero")]
    StepModeUnderflow(FuncIndex),

    /// The frame-trap counter was decremented below zero
    #[error("Enter/leave frame trap counter decremented below zero")]
    FrameTrapUnderflow,

    /// Code metadata points outside the compiled segment
    #[error("Corrupt compiled code: {0}")]
    CorruptCode(String),

    /// The module bytes are malformed
    #[error("Invalid module: {0}")]
    InvalidModule(String),

    /// I/O error (reading module files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraplineError
{
    /// Build an `OutOfMemory` error from a failed `try_reserve`.
    pub(crate) fn oom(what: &'static str) -> impl FnOnce(TryReserveError) -> Self
    {
        move |_| TraplineError::OutOfMemory { what }
    }

    /// True for resource-exhaustion failures.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool
    {
        matches!(self, TraplineError::OutOfMemory { .. })
    }

    /// True for caller-side contract violations (unbalanced counters).
    #[must_use]
    pub fn is_contract_violation(&self) -> bool
    {
        matches!(self, TraplineError::StepModeUnderflow(_) | TraplineError::FrameTrapUnderflow)
    }
}

/// Convert a LEB128/byte reader error into an `InvalidModule` error with context.
pub(crate) fn map_reader_error(context: &str, err: gimli::Error) -> TraplineError
{
    TraplineError::InvalidModule(format!("{context}: {err}"))
}

/// Convenience type alias for `Result<T, TraplineError>`
///
/// ```rust
/// use trapline_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, TraplineError>;
