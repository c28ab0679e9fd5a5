//! Memory accounting helpers.
//!
//! Code, metadata and module bytes may be reachable from several debug states
//! at once. Reporters pass the same [`SeenSets`] to every state they visit so
//! each object is counted exactly once.

use std::collections::HashSet;
use std::sync::Arc;

/// Identities of objects that have already been counted.
#[derive(Debug, Default, Clone)]
pub struct SeenSet
{
    seen: HashSet<usize>,
}

impl SeenSet
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Record `value`'s identity. Returns `true` the first time it is seen.
    pub fn insert<T>(&mut self, value: &T) -> bool
    {
        self.seen.insert(std::ptr::from_ref(value) as usize)
    }

    /// Record the identity of the allocation behind `value`.
    pub fn insert_arc<T>(&mut self, value: &Arc<T>) -> bool
    {
        self.seen.insert(Arc::as_ptr(value) as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.seen.is_empty()
    }
}

/// One seen-set per kind of shared object.
#[derive(Debug, Default, Clone)]
pub struct SeenSets
{
    pub metadata: SeenSet,
    pub bytes: SeenSet,
    pub code: SeenSet,
}

impl SeenSets
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }
}

/// Byte totals reported by memory accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage
{
    /// Machine code.
    pub code: usize,
    /// Metadata, bytecode and debug tables.
    pub data: usize,
}

impl MemoryUsage
{
    /// Sum of code and data.
    #[must_use]
    pub fn total(&self) -> usize
    {
        self.code + self.data
    }
}

impl std::ops::AddAssign for MemoryUsage
{
    fn add_assign(&mut self, rhs: Self)
    {
        self.code += rhs.code;
        self.data += rhs.data;
    }
}
