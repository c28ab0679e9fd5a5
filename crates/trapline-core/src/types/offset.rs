//! Bytecode offset type.

use std::fmt;

/// Byte offset into a module's canonical binary encoding.
///
/// This is the only addressing scheme the debug layer exposes to tools. The
/// same module bytes always produce the same offsets, whichever compiled tier
/// happens to be running, so source maps and IDE integrations can persist
/// them across sessions.
///
/// ## Why not a plain `u32`?
///
/// Offsets share their width with line numbers, function indices and code
/// offsets inside a compiled segment. Keeping them in their own type stops a
/// machine-code position from being handed to something that expects a
/// bytecode position.
///
/// ## Example
///
/// ```rust
/// use trapline_core::types::BytecodeOffset;
///
/// let offset = BytecodeOffset::from(0x2a);
/// assert_eq!(offset.value(), 42);
/// assert_eq!(offset.to_string(), "0x0000002a");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BytecodeOffset(u32);

impl BytecodeOffset
{
    /// Create a new offset in const contexts.
    pub const fn new(value: u32) -> Self
    {
        BytecodeOffset(value)
    }

    /// Raw `u32` value of this offset.
    pub const fn value(self) -> u32
    {
        self.0
    }

    /// Offset as a `usize`, for slicing the module bytes.
    pub const fn as_usize(self) -> usize
    {
        self.0 as usize
    }
}

impl From<u32> for BytecodeOffset
{
    fn from(value: u32) -> Self
    {
        BytecodeOffset(value)
    }
}

impl From<BytecodeOffset> for u32
{
    fn from(offset: BytecodeOffset) -> Self
    {
        offset.0
    }
}

impl fmt::Display for BytecodeOffset
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:08x}", self.0)
    }
}
