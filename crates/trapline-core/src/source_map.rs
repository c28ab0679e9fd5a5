//! # Source Location Index
//!
//! Immutable mapping between bytecode offsets and source line/column
//! positions, built once from the compiler's debug output.
//!
//! Records are kept sorted by offset so `offset -> position` is a binary
//! search. The reverse `line -> offsets` direction is answered from a second
//! table sorted by line, built together with the index. Both tables are
//! allocated fallibly, so a failed build reports `OutOfMemory` and leaves
//! nothing behind.
//!
//! ## Binary sources
//!
//! Modules without a text rendering still need line-based tooling. For those,
//! [`SourceLocationIndex::from_binary_offsets`] uses the offset itself as the
//! line number and [`BINARY_SOURCE_COLUMN`] as the column.

use std::fmt;

use crate::error::{Result, TraplineError};
use crate::types::BytecodeOffset;

/// Column reported for every location of a binary source.
pub const BINARY_SOURCE_COLUMN: u32 = 1;

/// Compile-time mapping from one instruction offset to a source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprLoc
{
    pub line: u32,
    pub column: u32,
    pub offset: BytecodeOffset,
}

impl ExprLoc
{
    #[must_use]
    pub const fn new(line: u32, column: u32, offset: BytecodeOffset) -> Self
    {
        Self { line, column, offset }
    }
}

/// Line/column pair returned by offset lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation
{
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Offset-sorted table of [`ExprLoc`] records.
#[derive(Debug, Default)]
pub struct SourceLocationIndex
{
    locations: Vec<ExprLoc>,
    /// Line of each entry of `line_offsets`, ascending.
    lines: Vec<u32>,
    /// Offsets ordered by `(line, offset)`.
    line_offsets: Vec<BytecodeOffset>,
}

impl SourceLocationIndex
{
    /// Build the index from unordered records.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: the line table could not be allocated
    /// - `InvalidModule`: two records claim the same offset
    pub fn from_records(mut records: Vec<ExprLoc>) -> Result<Self>
    {
        records.sort_unstable_by_key(|loc| loc.offset);
        if let Some(pair) = records.windows(2).find(|pair| pair[0].offset == pair[1].offset) {
            return Err(TraplineError::InvalidModule(format!(
                "duplicate source location records for offset {}",
                pair[0].offset
            )));
        }

        let mut by_line = Vec::new();
        by_line
            .try_reserve_exact(records.len())
            .map_err(TraplineError::oom("building the line table"))?;
        by_line.extend(records.iter().map(|loc| (loc.line, loc.offset)));
        by_line.sort_unstable();

        let mut lines = Vec::new();
        lines
            .try_reserve_exact(by_line.len())
            .map_err(TraplineError::oom("building the line table"))?;
        let mut line_offsets = Vec::new();
        line_offsets
            .try_reserve_exact(by_line.len())
            .map_err(TraplineError::oom("building the line table"))?;
        for (line, offset) in by_line {
            lines.push(line);
            line_offsets.push(offset);
        }

        tracing::debug!(records = records.len(), "built source location index");
        Ok(Self {
            locations: records,
            lines,
            line_offsets,
        })
    }

    /// Build the index from a borrowed record table.
    ///
    /// ## Errors
    ///
    /// Same as [`SourceLocationIndex::from_records`].
    pub fn from_slice(records: &[ExprLoc]) -> Result<Self>
    {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(records.len())
            .map_err(TraplineError::oom("copying source location records"))?;
        owned.extend_from_slice(records);
        Self::from_records(owned)
    }

    /// Build a binary-source index where each offset is its own line.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: the record table could not be allocated
    /// - `InvalidModule`: an offset is listed twice
    pub fn from_binary_offsets<I>(offsets: I) -> Result<Self>
    where
        I: IntoIterator<Item = BytecodeOffset>,
    {
        let offsets = offsets.into_iter();
        let mut records = Vec::new();
        records
            .try_reserve(offsets.size_hint().0)
            .map_err(TraplineError::oom("building the source location index"))?;
        for offset in offsets {
            records.try_reserve(1).map_err(TraplineError::oom("building the source location index"))?;
            records.push(ExprLoc::new(offset.value(), BINARY_SOURCE_COLUMN, offset));
        }
        Self::from_records(records)
    }

    /// Source position recorded for `offset`.
    ///
    /// Returns `None` when `offset` is not an instrumentable instruction boundary.
    #[must_use]
    pub fn location_of(&self, offset: BytecodeOffset) -> Option<SourceLocation>
    {
        self.locations
            .binary_search_by_key(&offset, |loc| loc.offset)
            .ok()
            .map(|idx| {
                let loc = &self.locations[idx];
                SourceLocation {
                    line: loc.line,
                    column: loc.column,
                }
            })
    }

    /// All offsets on `line`, ascending. Empty when the line has none.
    #[must_use]
    pub fn offsets_of_line(&self, line: u32) -> &[BytecodeOffset]
    {
        let start = self.lines.partition_point(|&l| l < line);
        let end = self.lines.partition_point(|&l| l <= line);
        &self.line_offsets[start..end]
    }

    /// Every record, ascending by offset.
    #[must_use]
    pub fn all_locations(&self) -> &[ExprLoc]
    {
        &self.locations
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.locations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.locations.is_empty()
    }

    /// Heap bytes owned by the index.
    #[must_use]
    pub fn size_of_excluding_this(&self) -> usize
    {
        self.locations.capacity() * std::mem::size_of::<ExprLoc>()
            + self.lines.capacity() * std::mem::size_of::<u32>()
            + self.line_offsets.capacity() * std::mem::size_of::<BytecodeOffset>()
    }
}
