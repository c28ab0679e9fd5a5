//! Per-function step-mode reference counts.
//!
//! Several debuggers may single-step the same function at once, so step mode
//! is a counter rather than a flag. The counters only record state; arming
//! trap slots and switching tiers on the 0 <-> 1 crossings is done by
//! [`DebugState`](crate::debug_state::DebugState).

use std::collections::HashMap;

use crate::error::{Result, TraplineError};
use crate::types::FuncIndex;

/// Step-mode counts keyed by function index.
///
/// A missing entry and an entry at zero both mean "not stepping".
#[derive(Debug, Default, Clone)]
pub struct StepModeCounters
{
    counts: HashMap<FuncIndex, u32>,
}

impl StepModeCounters
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Current count for `func`.
    #[must_use]
    pub fn count(&self, func: FuncIndex) -> u32
    {
        self.counts.get(&func).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_enabled(&self, func: FuncIndex) -> bool
    {
        self.count(func) > 0
    }

    /// Increment the count for `func`. Returns `true` on the 0 -> 1 transition.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: a new entry could not be allocated; the counters are unchanged
    pub fn increment(&mut self, func: FuncIndex) -> Result<bool>
    {
        if !self.counts.contains_key(&func) {
            self.counts
                .try_reserve(1)
                .map_err(TraplineError::oom("recording step mode"))?;
        }
        let count = self.counts.entry(func).or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count == 1)
    }

    /// Decrement the count for `func`. Returns `true` on the 1 -> 0 transition.
    ///
    /// ## Errors
    ///
    /// - `StepModeUnderflow`: the count is already zero
    pub fn decrement(&mut self, func: FuncIndex) -> Result<bool>
    {
        match self.counts.get_mut(&func) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(*count == 0)
            }
            _ => {
                tracing::error!(func = %func, "step mode decremented below zero");
                Err(TraplineError::StepModeUnderflow(func))
            }
        }
    }

    /// Functions currently in step mode, ascending.
    #[must_use]
    pub fn enabled_functions(&self) -> Vec<FuncIndex>
    {
        let mut funcs: Vec<_> = self
            .counts
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&func, _)| func)
            .collect();
        funcs.sort_unstable();
        funcs
    }

    /// Drop every count.
    pub fn clear(&mut self)
    {
        self.counts.clear();
    }

    pub(crate) fn size_of_excluding_this(&self) -> usize
    {
        self.counts.capacity() * std::mem::size_of::<(FuncIndex, u32)>()
    }
}
