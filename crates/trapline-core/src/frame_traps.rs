//! Ref-counted enter/leave frame traps.
//!
//! Frame traps fire on every function entry and exit. Independent debugger
//! requests pair [`FrameTrapController::adjust`] calls; the slots are armed
//! while at least one reference is held.
//!
//! [`FrameTrapController::ensure`] owns exactly one reference of its own:
//! `ensure(true)` takes it (if not already held) and `ensure(false)` releases
//! it. Because the observable state is `count > 0`, frame traps are always
//! enabled after `ensure(true)`, and `ensure(false)` never drops references
//! that other callers took through `adjust`.

use crate::code::CodePatcher;
use crate::error::{Result, TraplineError};

/// Enter/leave frame trap state for one debugged instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameTrapController
{
    count: u32,
    forced: bool,
}

impl FrameTrapController
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool
    {
        self.count > 0
    }

    /// Number of outstanding references, including the one held by `ensure`.
    #[must_use]
    pub fn count(&self) -> u32
    {
        self.count
    }

    /// True while `ensure(true)` holds its reference.
    #[must_use]
    pub fn is_forced(&self) -> bool
    {
        self.forced
    }

    /// Take (`true`) or release (`false`) one reference, patching the frame
    /// trap slots on the 0 <-> 1 crossings. Returns `true` if the enabled
    /// state changed.
    ///
    /// The reference held by `ensure(true)` can only be released by
    /// `ensure(false)`.
    ///
    /// ## Errors
    ///
    /// - `FrameTrapUnderflow`: released with no outstanding `adjust` reference
    /// - any error from the patcher; the counter is unchanged
    pub fn adjust<P>(&mut self, enabled: bool, patcher: &mut P) -> Result<bool>
    where
        P: CodePatcher + ?Sized,
    {
        if enabled {
            return self.take(patcher);
        }
        if self.count - u32::from(self.forced) == 0 {
            tracing::error!(forced = self.forced, "enter/leave frame trap counter decremented below zero");
            return Err(TraplineError::FrameTrapUnderflow);
        }
        self.release(patcher)
    }

    /// Take or release the controller's own reference. Idempotent.
    ///
    /// Returns `true` if the enabled state changed.
    ///
    /// ## Errors
    ///
    /// Any error from the patcher; the controller is unchanged.
    pub fn ensure<P>(&mut self, enabled: bool, patcher: &mut P) -> Result<bool>
    where
        P: CodePatcher + ?Sized,
    {
        if self.forced == enabled {
            tracing::trace!(enabled, "frame trap state already ensured");
            return Ok(false);
        }
        let changed = if enabled { self.take(patcher)? } else { self.release(patcher)? };
        self.forced = enabled;
        Ok(changed)
    }

    fn take<P>(&mut self, patcher: &mut P) -> Result<bool>
    where
        P: CodePatcher + ?Sized,
    {
        if self.count == 0 {
            patcher.set_frame_traps(true)?;
            tracing::debug!("enter/leave frame traps enabled");
        }
        self.count = self.count.saturating_add(1);
        Ok(self.count == 1)
    }

    /// Callers check `count > 0`.
    fn release<P>(&mut self, patcher: &mut P) -> Result<bool>
    where
        P: CodePatcher + ?Sized,
    {
        if self.count == 1 {
            patcher.set_frame_traps(false)?;
            tracing::debug!("enter/leave frame traps disabled");
        }
        self.count -= 1;
        Ok(self.count == 0)
    }

    /// Release every reference, disarming the slots if any were armed.
    ///
    /// ## Errors
    ///
    /// Any error from the patcher; the controller is unchanged.
    pub fn reset<P>(&mut self, patcher: &mut P) -> Result<()>
    where
        P: CodePatcher + ?Sized,
    {
        if self.count > 0 {
            patcher.set_frame_traps(false)?;
            tracing::debug!(released = self.count, "enter/leave frame traps reset");
        }
        *self = Self::default();
        Ok(())
    }
}
