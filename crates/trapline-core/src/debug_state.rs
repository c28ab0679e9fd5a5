//! # Debug State
//!
//! Per-instance debugger state: the orchestrator every debugger-facing
//! operation goes through.
//!
//! A [`DebugState`] takes exclusive ownership of the instance's compiled code
//! (patching shared code would instrument every other instance too) and
//! combines:
//!
//! - the [`SourceLocationIndex`] for offset <-> line/column translation
//! - the [`BreakpointSiteTable`] owning breakpoint traps
//! - the [`StepModeCounters`] for per-function single stepping
//! - the [`FrameTrapController`] for function entry/exit traps
//!
//! ## Tier selection
//!
//! A function runs in the Debug tier while it has at least one breakpoint
//! site, while its step-mode count is positive, or while frame traps are
//! enabled; otherwise it runs in the code's default tier. The required tier
//! is re-derived after every mutation, never stored.
//!
//! ## Failure atomicity
//!
//! Mutating operations either complete or leave breakpoint sites, counters
//! and armed trap slots exactly as they were. Rollback of a partially applied
//! patch is best effort; a rollback that itself fails is logged.
//!
//! ## Caller obligation
//!
//! Machine code is patched in place. Callers only invoke mutating operations
//! while the instance is paused at a safe point and not executing the
//! affected functions.

use std::sync::Arc;

use gimli::{EndianSlice, LittleEndian, Reader};

use crate::breakpoints::{BreakpointOwner, BreakpointSite, BreakpointSiteTable, SiteId};
use crate::code::{self, CallSite, CodeRange, CodeStore, CompiledCode, Metadata, MetadataTier, Tier};
use crate::error::{map_reader_error, Result, TraplineError};
use crate::frame_traps::FrameTrapController;
use crate::instance::Instance;
use crate::memory::{MemoryUsage, SeenSets};
use crate::module::SharedModule;
use crate::source_map::{ExprLoc, SourceLocation, SourceLocationIndex};
use crate::stepping::StepModeCounters;
use crate::types::{BytecodeOffset, DebuggerId, ExprType, FuncIndex, GlobalIndex, HandlerId, HostValue, InstanceId, ValType};

/// Upper bound on the locals (arguments included) of one function.
pub const MAX_LOCALS: u64 = 50_000;

/// Debugger state of one instance.
#[derive(Debug)]
pub struct DebugState<C: CodeStore = CompiledCode>
{
    instance: InstanceId,
    code: C,
    module: SharedModule,
    source_locations: SourceLocationIndex,
    breakpoints: BreakpointSiteTable,
    stepping: StepModeCounters,
    frame_traps: FrameTrapController,
}

impl<C: CodeStore> DebugState<C>
{
    /// Begin debugging `instance`, taking exclusive ownership of its code.
    ///
    /// ## Errors
    ///
    /// - `CodeShared`: the code is still referenced elsewhere
    /// - `DebugNotEnabled`: the code has no Debug tier
    /// - `InvalidModule`, `OutOfMemory`: the source location index could not be built
    pub fn new(instance: InstanceId, code: Arc<C>, module: SharedModule) -> Result<Self>
    {
        let code = code::take_exclusive(code)?;
        Self::from_code(instance, code, module)
    }

    /// Begin debugging with code the caller already owns exclusively.
    ///
    /// ## Errors
    ///
    /// Same as [`DebugState::new`], minus `CodeShared`.
    pub fn from_code(instance: InstanceId, code: C, module: SharedModule) -> Result<Self>
    {
        let debug = code.debug_metadata()?;
        let records = &code.metadata().source_locations;
        let source_locations = if records.is_empty() {
            SourceLocationIndex::from_binary_offsets(
                debug
                    .call_sites
                    .iter()
                    .filter(|site| site.kind == code::CallSiteKind::Breakpoint)
                    .map(|site| site.line_or_bytecode),
            )?
        } else {
            SourceLocationIndex::from_slice(records)?
        };
        tracing::debug!(
            instance = %instance,
            locations = source_locations.len(),
            functions = code.metadata().func_count(),
            "debug state created"
        );
        Ok(Self {
            instance,
            code,
            module,
            source_locations,
            breakpoints: BreakpointSiteTable::new(),
            stepping: StepModeCounters::new(),
            frame_traps: FrameTrapController::new(),
        })
    }

    #[must_use]
    pub fn instance(&self) -> InstanceId
    {
        self.instance
    }

    /// The debugged code.
    #[must_use]
    pub fn code(&self) -> &C
    {
        &self.code
    }

    /// Mutable access to the code, for execution bookkeeping by the embedder.
    ///
    /// Patching through this handle bypasses the debug state's tables.
    pub fn code_mut(&mut self) -> &mut C
    {
        &mut self.code
    }

    #[must_use]
    pub fn module(&self) -> &SharedModule
    {
        &self.module
    }

    /// Canonical module bytes every offset points into.
    #[must_use]
    pub fn bytecode(&self) -> &[u8]
    {
        self.module.debug_bytecode()
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata>
    {
        self.code.metadata()
    }

    /// Metadata of `tier`, if it was compiled.
    #[must_use]
    pub fn metadata_tier(&self, tier: Tier) -> Option<&MetadataTier>
    {
        self.code.metadata_tier(tier)
    }

    /// Code ranges of `tier`; empty if the tier was not compiled.
    #[must_use]
    pub fn code_ranges(&self, tier: Tier) -> &[CodeRange]
    {
        self.code.metadata_tier(tier).map(|t| t.code_ranges.as_slice()).unwrap_or(&[])
    }

    /// Call sites of `tier`; empty if the tier was not compiled.
    #[must_use]
    pub fn call_sites(&self, tier: Tier) -> &[CallSite]
    {
        self.code.metadata_tier(tier).map(|t| t.call_sites.as_slice()).unwrap_or(&[])
    }

    /// Index of `func`'s Debug-tier code range.
    #[must_use]
    pub fn func_to_code_range_index(&self, func: FuncIndex) -> Option<usize>
    {
        self.code
            .metadata_tier(Tier::Debug)
            .and_then(|t| t.func_to_code_range.get(func.as_usize()).copied().flatten())
    }

    #[must_use]
    pub fn source_locations(&self) -> &SourceLocationIndex
    {
        &self.source_locations
    }

    // ========================================================================
    // Source locations
    // ========================================================================

    /// Offsets on `line`, ascending. Empty if the line has none.
    #[must_use]
    pub fn map_line_to_offsets(&self, line: u32) -> &[BytecodeOffset]
    {
        self.source_locations.offsets_of_line(line)
    }

    /// Source position of `offset`, or `None` if it is not an instruction boundary.
    #[must_use]
    pub fn map_offset_to_location(&self, offset: BytecodeOffset) -> Option<SourceLocation>
    {
        self.source_locations.location_of(offset)
    }

    /// Every location record, ascending by offset.
    #[must_use]
    pub fn all_locations(&self) -> &[ExprLoc]
    {
        self.source_locations.all_locations()
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    /// Set a breakpoint at `offset` on behalf of `debugger`'s `handler`.
    ///
    /// Idempotent: repeated calls return the same site handle and install the
    /// trap once.
    ///
    /// ## Errors
    ///
    /// - `NoTrapSite`: `offset` is not an instruction boundary with a trap slot
    /// - `OutOfMemory`, patch errors: nothing changed
    pub fn set_breakpoint(&mut self, offset: BytecodeOffset, debugger: DebuggerId, handler: HandlerId) -> Result<SiteId>
    {
        let func = self.code.func_of_trap(offset).ok_or(TraplineError::NoTrapSite(offset))?;
        let owner = BreakpointOwner::new(self.instance, debugger, handler);
        let (id, created) = self.breakpoints.get_or_create(offset, func)?;

        let added = match self.breakpoints.add_owner(offset, owner) {
            Ok(added) => added,
            Err(err) => {
                if created {
                    self.destroy_site_quietly(offset);
                }
                return Err(err);
            }
        };
        if let Err(err) = self.arm_site(offset, func) {
            if added {
                self.breakpoints.remove_owner(offset, &owner);
            }
            if created {
                self.destroy_site_quietly(offset);
            }
            return Err(err);
        }
        tracing::debug!(offset = %offset, func = %func, site = %id, new_owner = added, "breakpoint set");
        Ok(id)
    }

    #[must_use]
    pub fn has_breakpoint(&self, offset: BytecodeOffset) -> bool
    {
        self.breakpoints.exists(offset)
    }

    /// True if a breakpoint site at `offset` has its trap installed.
    #[must_use]
    pub fn has_breakpoint_trap(&self, offset: BytecodeOffset) -> bool
    {
        self.breakpoints.has_installed_trap(offset)
    }

    #[must_use]
    pub fn breakpoint_site(&self, offset: BytecodeOffset) -> Option<&BreakpointSite>
    {
        self.breakpoints.get(offset)
    }

    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointSiteTable
    {
        &self.breakpoints
    }

    /// Destroy the breakpoint site at `offset`, whoever owns it. No-op if absent.
    ///
    /// ## Errors
    ///
    /// Patch errors; the site is kept.
    pub fn clear_breakpoint(&mut self, offset: BytecodeOffset) -> Result<()>
    {
        if let Some(site) = self.breakpoints.destroy(offset, &mut self.code, &self.stepping)? {
            self.sync_tier(site.func())?;
            tracing::debug!(offset = %offset, "breakpoint cleared");
        }
        Ok(())
    }

    /// Drop every owner of `instance` matching `debugger` and `handler`
    /// (`None` matches all) and destroy the sites left without owners.
    ///
    /// ## Errors
    ///
    /// `OutOfMemory` or patch errors. Sites destroyed before a patch failure
    /// stay destroyed and their functions leave the Debug tier; every other
    /// site keeps all of its owners.
    pub fn clear_breakpoints_in(
        &mut self,
        instance: InstanceId,
        debugger: Option<DebuggerId>,
        handler: Option<HandlerId>,
    ) -> Result<()>
    {
        let funcs = match self
            .breakpoints
            .clear_breakpoints_in(instance, debugger, handler, &mut self.code, &self.stepping)
        {
            Ok(funcs) => funcs,
            Err(err) => {
                self.resync_tiers_quietly();
                return Err(err);
            }
        };
        for func in funcs {
            self.sync_tier(func)?;
        }
        Ok(())
    }

    /// Drop every breakpoint `handler` of `debugger` holds in this instance.
    ///
    /// ## Errors
    ///
    /// See [`DebugState::clear_breakpoints_in`].
    pub fn clear_breakpoints_for_handler(&mut self, debugger: DebuggerId, handler: HandlerId) -> Result<()>
    {
        self.clear_breakpoints_in(self.instance, Some(debugger), Some(handler))
    }

    /// Destroy every breakpoint site, uninstalling all traps.
    ///
    /// ## Errors
    ///
    /// `OutOfMemory` or patch errors.
    pub fn clear_all_breakpoints(&mut self) -> Result<()>
    {
        let funcs = match self.breakpoints.clear_all(&mut self.code, &self.stepping) {
            Ok(funcs) => funcs,
            Err(err) => {
                self.resync_tiers_quietly();
                return Err(err);
            }
        };
        for func in funcs {
            self.sync_tier(func)?;
        }
        tracing::debug!(instance = %self.instance, "all breakpoints cleared");
        Ok(())
    }

    // ========================================================================
    // Step mode
    // ========================================================================

    #[must_use]
    pub fn step_mode_enabled(&self, func: FuncIndex) -> bool
    {
        self.stepping.is_enabled(func)
    }

    /// Take one step-mode reference on `func`. The first reference arms every
    /// trap slot of the function and moves it to the Debug tier.
    ///
    /// ## Errors
    ///
    /// - `FuncIndexOutOfRange`: `func` is not in the module
    /// - `TierUnavailable`: `func` has no Debug-tier code (imports)
    /// - `OutOfMemory`, patch errors: the count is unchanged
    pub fn increment_step_mode_count(&mut self, func: FuncIndex) -> Result<()>
    {
        self.check_debuggable(func)?;
        if !self.stepping.increment(func)? {
            return Ok(());
        }
        if let Err(err) = self.set_step_slots(func, true) {
            self.undo_step_increment(func);
            return Err(err);
        }
        if let Err(err) = self.sync_tier(func) {
            if let Err(rollback) = self.set_step_slots(func, false) {
                tracing::warn!(func = %func, "failed to disarm step slots during rollback: {rollback}");
            }
            self.undo_step_increment(func);
            return Err(err);
        }
        tracing::debug!(func = %func, "step mode enabled");
        Ok(())
    }

    /// Release one step-mode reference on `func`. The last reference disarms
    /// the slots that have no breakpoint and re-derives the function's tier.
    ///
    /// ## Errors
    ///
    /// - `FuncIndexOutOfRange`: `func` is not in the module
    /// - `StepModeUnderflow`: the count is already zero
    /// - patch errors: the count is unchanged
    pub fn decrement_step_mode_count(&mut self, func: FuncIndex) -> Result<()>
    {
        self.func_args(func)?;
        if self.stepping.count(func) == 1 {
            self.set_step_slots(func, false)?;
        }
        if self.stepping.decrement(func)? {
            if let Err(err) = self.sync_tier(func) {
                self.stepping.increment(func)?;
                if let Err(rollback) = self.set_step_slots(func, true) {
                    tracing::warn!(func = %func, "failed to re-arm step slots during rollback: {rollback}");
                }
                return Err(err);
            }
            tracing::debug!(func = %func, "step mode disabled");
        }
        Ok(())
    }

    /// Take (`true`) or release (`false`) one step-mode reference.
    ///
    /// ## Errors
    ///
    /// See [`DebugState::increment_step_mode_count`] and
    /// [`DebugState::decrement_step_mode_count`].
    pub fn set_step_mode(&mut self, func: FuncIndex, enabled: bool) -> Result<()>
    {
        if enabled {
            self.increment_step_mode_count(func)
        } else {
            self.decrement_step_mode_count(func)
        }
    }

    // ========================================================================
    // Frame traps
    // ========================================================================

    #[must_use]
    pub fn enter_and_leave_frame_traps_enabled(&self) -> bool
    {
        self.frame_traps.is_enabled()
    }

    /// Take or release one frame-trap reference. Returns the resulting state.
    ///
    /// ## Errors
    ///
    /// - `FrameTrapUnderflow`: released with no outstanding `adjust` reference
    /// - patch errors: the counter is unchanged
    pub fn adjust_enter_and_leave_frame_traps_state(&mut self, enabled: bool) -> Result<bool>
    {
        let before = self.frame_traps;
        if self.frame_traps.adjust(enabled, &mut self.code)? {
            self.sync_frame_trap_tiers(before)?;
        }
        Ok(self.frame_traps.is_enabled())
    }

    /// Take or release the debug state's own frame-trap reference. Returns the
    /// resulting state.
    ///
    /// `ensure(true)` always leaves frame traps enabled. `ensure(false)`
    /// releases only the reference `ensure(true)` took, so traps stay enabled
    /// while other `adjust` references are outstanding.
    ///
    /// ## Errors
    ///
    /// Patch errors; the state is unchanged.
    pub fn ensure_enter_and_leave_frame_traps_state(&mut self, enabled: bool) -> Result<bool>
    {
        let before = self.frame_traps;
        if self.frame_traps.ensure(enabled, &mut self.code)? {
            self.sync_frame_trap_tiers(before)?;
        }
        Ok(self.frame_traps.is_enabled())
    }

    // ========================================================================
    // Function and global metadata
    // ========================================================================

    /// Types of `func`'s locals, arguments first, and the argument count.
    ///
    /// Declared locals are decoded from the function body in the module bytes.
    ///
    /// ## Errors
    ///
    /// - `FuncIndexOutOfRange`: `func` is not in the module
    /// - `InvalidModule`: the local declarations are malformed
    /// - `OutOfMemory`: the result could not be allocated
    pub fn debug_local_types(&self, func: FuncIndex) -> Result<(Vec<ValType>, usize)>
    {
        let args = self.func_args(func)?;
        let mut locals = Vec::new();
        locals
            .try_reserve(args.len())
            .map_err(TraplineError::oom("collecting local types"))?;
        locals.extend_from_slice(args);

        let Some(range) = self
            .code
            .metadata_tier(Tier::Debug)
            .and_then(|debug| debug.func_code_range(func))
        else {
            // Imports have no body.
            return Ok((locals, args.len()));
        };
        decode_local_entries(self.bytecode(), range.func_line_or_bytecode, &mut locals)?;
        Ok((locals, args.len()))
    }

    /// Result type of `func`.
    ///
    /// ## Errors
    ///
    /// - `FuncIndexOutOfRange`: `func` is not in the module
    pub fn debug_result_type(&self, func: FuncIndex) -> Result<ExprType>
    {
        let metadata = self.code.metadata();
        metadata
            .func_result_types
            .get(func.as_usize())
            .copied()
            .ok_or(TraplineError::FuncIndexOutOfRange {
                index: func,
                count: metadata.func_count(),
            })
    }

    /// Value of global `index` in `instance`, converted for the debugger.
    ///
    /// ## Errors
    ///
    /// - `InstanceMismatch`: `instance` is not the instance being debugged
    /// - `GlobalIndexOutOfRange`: `index` is not a global of the module
    /// - `CorruptCode`, `InvalidModule`: the global's storage cannot be read
    pub fn get_global(&self, instance: &Instance, index: GlobalIndex) -> Result<HostValue>
    {
        if instance.id() != self.instance {
            return Err(TraplineError::InstanceMismatch {
                expected: self.instance,
                found: instance.id(),
            });
        }
        let globals = &self.code.metadata().globals;
        let desc = globals.get(index.as_usize()).ok_or(TraplineError::GlobalIndexOutOfRange {
            index,
            count: globals.len(),
        })?;
        instance.read_global(desc).map(HostValue::from)
    }

    /// URL from the module's `sourceMappingURL` custom section.
    #[must_use]
    pub fn source_mapping_url(&self) -> Option<String>
    {
        self.module.source_mapping_url()
    }

    // ========================================================================
    // Tiers
    // ========================================================================

    /// Tier `func` must run in given the current debug state.
    #[must_use]
    pub fn required_tier(&self, func: FuncIndex) -> Tier
    {
        if self.frame_traps.is_enabled() || self.stepping.is_enabled(func) || self.breakpoints.has_sites_in(func) {
            Tier::Debug
        } else {
            self.code.default_tier()
        }
    }

    /// Tier `func` currently runs in; `None` for imports.
    #[must_use]
    pub fn selected_tier(&self, func: FuncIndex) -> Option<Tier>
    {
        self.code.selected_tier(func)
    }

    // ========================================================================
    // Memory and teardown
    // ========================================================================

    /// Memory owned by the code, module bytes and debug tables, skipping
    /// objects already recorded in `seen`.
    pub fn add_size_of_misc(&self, seen: &mut SeenSets) -> MemoryUsage
    {
        let mut usage = MemoryUsage::default();
        self.code.add_size_of(&mut seen.metadata, &mut seen.code, &mut usage);
        let bytes = self.module.bytecode_handle();
        if seen.bytes.insert_arc(bytes) {
            usage.data += bytes.size_of_excluding_this();
        }
        usage.data += std::mem::size_of::<Self>()
            + self.source_locations.size_of_excluding_this()
            + self.breakpoints.size_of_excluding_this()
            + self.stepping.size_of_excluding_this();
        usage
    }

    /// Stop debugging while keeping the instance alive.
    ///
    /// Clears every breakpoint, drops all step-mode and frame-trap references
    /// and returns every function to the default tier. The code is left fully
    /// disarmed.
    ///
    /// ## Errors
    ///
    /// Patch errors; whatever was torn down before the failure stays torn down.
    pub fn detach(&mut self) -> Result<()>
    {
        for func in self.stepping.enabled_functions() {
            self.set_step_slots(func, false)?;
        }
        self.stepping.clear();
        self.breakpoints.clear_all(&mut self.code, &self.stepping)?;
        self.frame_traps.reset(&mut self.code)?;
        self.sync_all_tiers()?;
        tracing::debug!(instance = %self.instance, "debugger detached");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn func_args(&self, func: FuncIndex) -> Result<&[ValType]>
    {
        let metadata = self.code.metadata();
        metadata
            .func_arg_types
            .get(func.as_usize())
            .map(Vec::as_slice)
            .ok_or(TraplineError::FuncIndexOutOfRange {
                index: func,
                count: metadata.func_count(),
            })
    }

    fn check_debuggable(&self, func: FuncIndex) -> Result<()>
    {
        self.func_args(func)?;
        if self.code.debug_metadata()?.func_code_range(func).is_none() {
            return Err(TraplineError::TierUnavailable(Tier::Debug));
        }
        Ok(())
    }

    /// Arm or disarm every trap slot of `func` that has no installed
    /// breakpoint trap. On failure the slots already patched are restored.
    fn set_step_slots(&mut self, func: FuncIndex, armed: bool) -> Result<()>
    {
        let offsets: Vec<_> = self
            .code
            .trap_offsets(func)
            .into_iter()
            .filter(|&offset| !self.breakpoints.has_installed_trap(offset))
            .collect();
        for (done, &offset) in offsets.iter().enumerate() {
            let patched = if armed {
                self.code.install_trap(offset)
            } else {
                self.code.remove_trap(offset)
            };
            if let Err(err) = patched {
                for &undo in &offsets[..done] {
                    let restored = if armed {
                        self.code.remove_trap(undo)
                    } else {
                        self.code.install_trap(undo)
                    };
                    if let Err(rollback) = restored {
                        tracing::warn!(offset = %undo, "failed to restore step slot: {rollback}");
                    }
                }
                return Err(err);
            }
        }
        tracing::debug!(func = %func, slots = offsets.len(), armed, "patched step slots");
        Ok(())
    }

    fn arm_site(&mut self, offset: BytecodeOffset, func: FuncIndex) -> Result<()>
    {
        self.breakpoints
            .install_or_remove_trap(offset, true, &mut self.code, &self.stepping)?;
        self.sync_tier(func)
    }

    fn undo_step_increment(&mut self, func: FuncIndex)
    {
        if let Err(err) = self.stepping.decrement(func) {
            tracing::warn!(func = %func, "failed to roll back step mode count: {err}");
        }
    }

    fn destroy_site_quietly(&mut self, offset: BytecodeOffset)
    {
        if let Err(err) = self.breakpoints.destroy(offset, &mut self.code, &self.stepping) {
            tracing::warn!(offset = %offset, "failed to destroy breakpoint site during rollback: {err}");
        }
    }

    fn sync_tier(&mut self, func: FuncIndex) -> Result<()>
    {
        let Some(current) = self.code.selected_tier(func) else {
            return Ok(());
        };
        let required = self.required_tier(func);
        if current != required {
            self.code.select_tier(func, required)?;
        }
        Ok(())
    }

    /// Re-derive every tier after a partially applied clear.
    fn resync_tiers_quietly(&mut self)
    {
        if let Err(err) = self.sync_all_tiers() {
            tracing::warn!("failed to re-derive tiers after a failed clear: {err}");
        }
    }

    fn sync_all_tiers(&mut self) -> Result<()>
    {
        let count = u32::try_from(self.code.metadata().func_count())
            .map_err(|_| TraplineError::CorruptCode("function count exceeds 32 bits".into()))?;
        for func in (0..count).map(FuncIndex) {
            self.sync_tier(func)?;
        }
        Ok(())
    }

    /// Re-derive every tier after a frame-trap crossing; on failure restore
    /// the controller state `before` and the matching slots.
    fn sync_frame_trap_tiers(&mut self, before: FrameTrapController) -> Result<()>
    {
        if let Err(err) = self.sync_all_tiers() {
            if let Err(rollback) = self.code.set_frame_traps(before.is_enabled()) {
                tracing::warn!("failed to restore frame trap slots: {rollback}");
            }
            self.frame_traps = before;
            if let Err(rollback) = self.sync_all_tiers() {
                tracing::warn!("failed to restore tiers after frame trap rollback: {rollback}");
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Append the locals declared at the start of the body at `body` to `locals`.
///
/// The declarations are a LEB128 group count followed by
/// `(count: LEB128, type: u8)` pairs.
fn decode_local_entries(bytecode: &[u8], body: BytecodeOffset, locals: &mut Vec<ValType>) -> Result<()>
{
    let bytes = bytecode.get(body.as_usize()..).ok_or_else(|| {
        TraplineError::InvalidModule(format!("function body {body} lies outside the module bytes"))
    })?;
    let mut reader = EndianSlice::new(bytes, LittleEndian);
    let groups = gimli::leb128::read::unsigned(&mut reader).map_err(|e| map_reader_error("reading local groups", e))?;
    let mut total = locals.len() as u64;
    for _ in 0..groups {
        let count = gimli::leb128::read::unsigned(&mut reader).map_err(|e| map_reader_error("reading local count", e))?;
        let code = reader.read_u8().map_err(|e| map_reader_error("reading local type", e))?;
        let ty = ValType::from_code(code)
            .ok_or_else(|| TraplineError::InvalidModule(format!("unknown local type {code:#04x} in body {body}")))?;
        total = total.saturating_add(count);
        if total > MAX_LOCALS {
            return Err(TraplineError::InvalidModule(format!(
                "body {body} declares more than {MAX_LOCALS} locals"
            )));
        }
        let count = usize::try_from(count).map_err(|_| TraplineError::InvalidModule("local count overflows".into()))?;
        locals.try_reserve(count).map_err(TraplineError::oom("collecting local types"))?;
        locals.resize(locals.len() + count, ty);
    }
    Ok(())
}
