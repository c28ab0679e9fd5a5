//! Tests that failed patches leave the debug state exactly as it was

mod common;

use std::sync::Arc;

use common::{module, off, HELPER, INSTANCE, MAIN};
use trapline_core::code::{CodePatcher, CodeStore, CompiledCode, Metadata, MetadataTier, Tier};
use trapline_core::debug_state::DebugState;
use trapline_core::error::{Result, TraplineError};
use trapline_core::memory::{MemoryUsage, SeenSet};
use trapline_core::types::{BytecodeOffset, DebuggerId, FuncIndex, HandlerId};

const DBG: DebuggerId = DebuggerId(1);
const HANDLER: HandlerId = HandlerId(100);

/// Code store that refuses exactly one patch request.
#[derive(Debug)]
struct FlakyCode
{
    inner: CompiledCode,
    countdown: Option<usize>,
    refused: usize,
}

impl FlakyCode
{
    /// Let the next `succeed` patch requests through and refuse the one after.
    fn fail_after(&mut self, succeed: usize)
    {
        self.countdown = Some(succeed);
    }

    fn gate(&mut self) -> Result<()>
    {
        match self.countdown {
            Some(0) => {
                self.countdown = None;
                self.refused += 1;
                Err(TraplineError::CorruptCode("patch refused".into()))
            }
            Some(left) => {
                self.countdown = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl CodePatcher for FlakyCode
{
    fn install_trap(&mut self, offset: BytecodeOffset) -> Result<()>
    {
        self.gate()?;
        self.inner.install_trap(offset)
    }

    fn remove_trap(&mut self, offset: BytecodeOffset) -> Result<()>
    {
        self.gate()?;
        self.inner.remove_trap(offset)
    }

    fn set_frame_traps(&mut self, enabled: bool) -> Result<()>
    {
        self.gate()?;
        self.inner.set_frame_traps(enabled)
    }

    fn select_tier(&mut self, func: FuncIndex, tier: Tier) -> Result<()>
    {
        self.gate()?;
        self.inner.select_tier(func, tier)
    }
}

impl CodeStore for FlakyCode
{
    fn metadata(&self) -> &Arc<Metadata>
    {
        self.inner.metadata()
    }

    fn metadata_tier(&self, tier: Tier) -> Option<&MetadataTier>
    {
        self.inner.metadata_tier(tier)
    }

    fn selected_tier(&self, func: FuncIndex) -> Option<Tier>
    {
        self.inner.selected_tier(func)
    }

    fn default_tier(&self) -> Tier
    {
        self.inner.default_tier()
    }

    fn is_trap_installed(&self, offset: BytecodeOffset) -> bool
    {
        self.inner.is_trap_installed(offset)
    }

    fn add_size_of(&self, seen_metadata: &mut SeenSet, seen_code: &mut SeenSet, usage: &mut MemoryUsage)
    {
        self.inner.add_size_of(seen_metadata, seen_code, usage);
    }
}

fn flaky_state() -> DebugState<FlakyCode>
{
    let inner = Arc::try_unwrap(common::code()).unwrap();
    let code = FlakyCode {
        inner,
        countdown: None,
        refused: 0,
    };
    DebugState::from_code(INSTANCE, code, module(true)).unwrap()
}

fn assert_untouched(state: &DebugState<FlakyCode>)
{
    assert!(state.breakpoints().is_empty());
    assert!(!state.step_mode_enabled(MAIN));
    assert!(!state.enter_and_leave_frame_traps_enabled());
    for offset in [off(10), off(20), off(30), off(36), off(38)] {
        assert!(!state.code().is_trap_installed(offset));
    }
    assert!(!state.code().inner.frame_traps_installed(MAIN));
    assert_eq!(state.selected_tier(MAIN), Some(Tier::Baseline));
    assert_eq!(state.selected_tier(HELPER), Some(Tier::Baseline));
}

#[test]
fn test_failed_trap_install_discards_new_site()
{
    let mut state = flaky_state();
    state.code_mut().fail_after(0);
    assert!(state.set_breakpoint(off(20), DBG, HANDLER).is_err());
    assert_eq!(state.code().refused, 1);
    assert!(!state.has_breakpoint(off(20)));
    assert_untouched(&state);
}

#[test]
fn test_failed_tier_switch_uninstalls_new_trap()
{
    let mut state = flaky_state();
    // Install succeeds, the switch to the Debug tier is refused.
    state.code_mut().fail_after(1);
    assert!(state.set_breakpoint(off(20), DBG, HANDLER).is_err());
    assert_eq!(state.code().refused, 1);
    assert!(!state.has_breakpoint_trap(off(20)));
    assert_untouched(&state);
}

#[test]
fn test_failed_set_keeps_existing_owner()
{
    let mut state = flaky_state();
    state.set_breakpoint(off(36), DBG, HANDLER).unwrap();
    state.code_mut().fail_after(0);
    assert!(state.set_breakpoint(off(20), DBG, HANDLER).is_err());

    assert!(!state.has_breakpoint(off(20)));
    assert!(!state.code().is_trap_installed(off(20)));
    assert_eq!(state.breakpoint_site(off(36)).unwrap().owners().len(), 1);
    assert!(state.code().is_trap_installed(off(36)));
    assert_eq!(state.selected_tier(HELPER), Some(Tier::Debug));
}

#[test]
fn test_failed_step_arming_restores_slots_and_count()
{
    // Refuse the second slot, then the tier switch after all three slots.
    for succeed in [1, 3] {
        let mut state = flaky_state();
        state.code_mut().fail_after(succeed);
        assert!(state.increment_step_mode_count(MAIN).is_err());
        assert_eq!(state.code().refused, 1);
        assert_untouched(&state);

        state.increment_step_mode_count(MAIN).unwrap();
        assert!(state.step_mode_enabled(MAIN));
    }
}

#[test]
fn test_failed_step_disarming_keeps_function_stepping()
{
    // Refuse the second slot, then the tier switch after all three slots.
    for succeed in [1, 3] {
        let mut state = flaky_state();
        state.increment_step_mode_count(MAIN).unwrap();
        state.code_mut().fail_after(succeed);
        assert!(state.decrement_step_mode_count(MAIN).is_err());
        assert_eq!(state.code().refused, 1);

        assert!(state.step_mode_enabled(MAIN));
        for offset in [off(10), off(20), off(30)] {
            assert!(state.code().is_trap_installed(offset));
        }
        assert_eq!(state.selected_tier(MAIN), Some(Tier::Debug));

        state.decrement_step_mode_count(MAIN).unwrap();
        assert_untouched(&state);
    }
}

#[test]
fn test_failed_frame_trap_toggle_keeps_counter()
{
    let mut state = flaky_state();
    state.code_mut().fail_after(0);
    assert!(state.adjust_enter_and_leave_frame_traps_state(true).is_err());
    assert_untouched(&state);

    // Slots armed and MAIN switched, HELPER's switch refused.
    state.code_mut().fail_after(2);
    assert!(state.ensure_enter_and_leave_frame_traps_state(true).is_err());
    assert_eq!(state.code().refused, 2);
    assert_untouched(&state);

    assert!(state.ensure_enter_and_leave_frame_traps_state(true).unwrap());
    assert!(state.code().inner.frame_traps_installed(HELPER));
}

#[test]
fn test_failed_handler_clear_keeps_remaining_owners()
{
    let mut state = flaky_state();
    state.set_breakpoint(off(20), DBG, HANDLER).unwrap();
    state.set_breakpoint(off(36), DBG, HANDLER).unwrap();

    // The trap at 20 comes out, the one at 36 is refused.
    state.code_mut().fail_after(1);
    assert!(state.clear_breakpoints_for_handler(DBG, HANDLER).is_err());

    assert!(!state.has_breakpoint(off(20)));
    assert!(!state.code().is_trap_installed(off(20)));
    assert_eq!(state.selected_tier(MAIN), Some(Tier::Baseline));

    let survivor = state.breakpoint_site(off(36)).unwrap();
    assert_eq!(survivor.owners().len(), 1);
    assert!(survivor.trap_installed());
    assert!(state.code().is_trap_installed(off(36)));
    assert_eq!(state.selected_tier(HELPER), Some(Tier::Debug));

    state.clear_breakpoints_for_handler(DBG, HANDLER).unwrap();
    assert_untouched(&state);
}
