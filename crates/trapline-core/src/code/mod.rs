//! # Compiled Code Store
//!
//! Machine code for every compiled tier of a module, with the per-tier
//! metadata the debug layer needs to find and patch trap slots.
//!
//! The debug layer talks to the store through two traits:
//!
//! - [`CodePatcher`]: the only way machine code is ever modified (trap
//!   install/remove, frame-trap toggling, tier selection)
//! - [`CodeStore`]: read access to metadata and lookups built on top of it
//!
//! [`CompiledCode`] is the in-process implementation.
//!
//! ## Safety obligation
//!
//! Patching must never happen while the instance is actively executing the
//! function being patched. Callers only patch when execution is paused at a
//! safe point. `CompiledCode` tracks executing functions (see
//! [`CompiledCode::begin_execution`]) and treats a violation as fatal.

pub mod builder;
pub mod patch;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub use builder::{CodeBuilder, FunctionSpec};
use patch::WritableCode;

use crate::error::{Result, TraplineError};
use crate::memory::{MemoryUsage, SeenSet};
use crate::source_map::ExprLoc;
use crate::types::{BytecodeOffset, ExprType, FuncIndex, Val, ValType};

/// Reference-counted code handle, shared until an instance is debugged.
pub type SharedCode = Arc<CompiledCode>;

/// A compiled variant of the module's functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier
{
    /// Fast-to-compile baseline code.
    Baseline,
    /// Optimized code.
    Optimized,
    /// Instrumented code: every instruction boundary has a trap slot and
    /// every function entry/exit has a frame-trap slot.
    Debug,
}

impl fmt::Display for Tier
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Tier::Baseline => "baseline",
            Tier::Optimized => "optimized",
            Tier::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// What a code range contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRangeKind
{
    Function,
    FarJumpIsland,
    DebugTrap,
}

/// A contiguous range of machine code within one tier's segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRange
{
    pub kind: CodeRangeKind,
    pub begin: u32,
    pub end: u32,
    /// Owning function, for `Function` ranges.
    pub func_index: Option<FuncIndex>,
    /// Bytecode offset of the function body, for `Function` ranges.
    pub func_line_or_bytecode: BytecodeOffset,
}

impl CodeRange
{
    #[must_use]
    pub fn is_function(&self) -> bool
    {
        self.kind == CodeRangeKind::Function
    }

    /// True if `code_offset` lies within `[begin, end]`.
    ///
    /// The end is inclusive so a return address just past the last
    /// instruction still belongs to the function.
    #[must_use]
    pub fn contains(&self, code_offset: u32) -> bool
    {
        self.begin <= code_offset && code_offset <= self.end
    }
}

/// Why a call site exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteKind
{
    /// Ordinary call to another function.
    Func,
    /// Patchable trap slot at an instruction boundary.
    Breakpoint,
    /// Patchable trap slot at function entry.
    EnterFrame,
    /// Patchable trap slot at function exit.
    LeaveFrame,
}

/// A call site in machine code, identified by its return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite
{
    pub kind: CallSiteKind,
    /// Bytecode offset of the instruction the site belongs to.
    pub line_or_bytecode: BytecodeOffset,
    /// Segment offset just past the call instruction.
    pub return_address_offset: u32,
}

/// Per-tier code metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTier
{
    pub tier: Tier,
    /// Sorted by `begin`, non-overlapping.
    pub code_ranges: Vec<CodeRange>,
    /// Sorted by `return_address_offset`.
    pub call_sites: Vec<CallSite>,
    /// Code range index per function; `None` for imports.
    pub func_to_code_range: Vec<Option<usize>>,
    /// Segment offsets of far-jump islands, ascending.
    pub debug_trap_far_jump_offsets: Vec<u32>,
}

impl MetadataTier
{
    /// Code range of `func`, if it was compiled in this tier.
    #[must_use]
    pub fn func_code_range(&self, func: FuncIndex) -> Option<&CodeRange>
    {
        let idx = (*self.func_to_code_range.get(func.as_usize())?)?;
        self.code_ranges.get(idx)
    }

    /// Function code range containing `code_offset`.
    #[must_use]
    pub fn lookup_func_range(&self, code_offset: u32) -> Option<&CodeRange>
    {
        let idx = self.code_ranges.partition_point(|range| range.end < code_offset);
        self.code_ranges
            .get(idx)
            .filter(|range| range.is_function() && range.contains(code_offset))
    }

    /// Breakpoint call site for a bytecode offset.
    #[must_use]
    pub fn breakpoint_site(&self, offset: BytecodeOffset) -> Option<&CallSite>
    {
        self.call_sites
            .iter()
            .find(|site| site.kind == CallSiteKind::Breakpoint && site.line_or_bytecode == offset)
    }

    /// Call sites of `kind` whose return address lies within `range`.
    pub fn call_sites_in<'a>(&'a self, range: &'a CodeRange, kind: CallSiteKind) -> impl Iterator<Item = &'a CallSite> + 'a
    {
        let first = self.call_sites.partition_point(|site| site.return_address_offset < range.begin);
        self.call_sites[first..]
            .iter()
            .take_while(move |site| site.return_address_offset <= range.end)
            .filter(move |site| site.kind == kind)
    }

    fn size_of_excluding_this(&self) -> usize
    {
        self.code_ranges.capacity() * std::mem::size_of::<CodeRange>()
            + self.call_sites.capacity() * std::mem::size_of::<CallSite>()
            + self.func_to_code_range.capacity() * std::mem::size_of::<Option<usize>>()
            + self.debug_trap_far_jump_offsets.capacity() * std::mem::size_of::<u32>()
    }
}

/// Where a global's value lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalKind
{
    /// Immutable global folded to a constant at compile time.
    Constant(Val),
    /// Stored in the instance's global data at `offset`. Indirect globals
    /// store a little-endian `u32` cell index there instead of the value.
    Variable
    {
        offset: u32, indirect: bool
    },
}

/// Static description of one global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalDesc
{
    pub ty: ValType,
    pub mutable: bool,
    pub kind: GlobalKind,
}

/// Tier-independent metadata produced by the compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata
{
    /// Argument types per function index.
    pub func_arg_types: Vec<Vec<ValType>>,
    /// Result type per function index.
    pub func_result_types: Vec<ExprType>,
    pub globals: Vec<GlobalDesc>,
    /// Source locations emitted from the module's debug section. Empty for
    /// binary-only modules.
    pub source_locations: Vec<ExprLoc>,
    pub debug_enabled: bool,
}

impl Metadata
{
    /// Number of functions, imports included.
    #[must_use]
    pub fn func_count(&self) -> usize
    {
        self.func_arg_types.len()
    }

    fn size_of_excluding_this(&self) -> usize
    {
        let args: usize = self
            .func_arg_types
            .iter()
            .map(|args| std::mem::size_of::<Vec<ValType>>() + args.capacity() * std::mem::size_of::<ValType>())
            .sum();
        args + self.func_result_types.capacity() * std::mem::size_of::<ExprType>()
            + self.globals.capacity() * std::mem::size_of::<GlobalDesc>()
            + self.source_locations.capacity() * std::mem::size_of::<ExprLoc>()
    }
}

/// Capability to modify live machine code.
///
/// Every write into compiled code goes through this trait. Callers guarantee
/// that the affected functions are not executing.
pub trait CodePatcher
{
    /// Arm the Debug-tier trap slot for the instruction at `offset`.
    fn install_trap(&mut self, offset: BytecodeOffset) -> Result<()>;

    /// Disarm the Debug-tier trap slot for the instruction at `offset`.
    fn remove_trap(&mut self, offset: BytecodeOffset) -> Result<()>;

    /// Arm or disarm every function entry/exit trap slot.
    fn set_frame_traps(&mut self, enabled: bool) -> Result<()>;

    /// Route calls to `func` through the code of `tier`.
    fn select_tier(&mut self, func: FuncIndex, tier: Tier) -> Result<()>;
}

/// Read access to compiled code and its metadata.
pub trait CodeStore: CodePatcher
{
    /// Tier-independent metadata.
    fn metadata(&self) -> &Arc<Metadata>;

    /// Metadata of `tier`, if it was compiled.
    fn metadata_tier(&self, tier: Tier) -> Option<&MetadataTier>;

    /// Tier currently selected for `func`; `None` for imports and out-of-range indices.
    fn selected_tier(&self, func: FuncIndex) -> Option<Tier>;

    /// Tier a function runs in when nothing requires instrumentation.
    fn default_tier(&self) -> Tier;

    /// True if the Debug-tier trap slot for `offset` is armed in machine code.
    fn is_trap_installed(&self, offset: BytecodeOffset) -> bool;

    /// Report machine code and metadata sizes not already in the seen sets.
    fn add_size_of(&self, seen_metadata: &mut SeenSet, seen_code: &mut SeenSet, usage: &mut MemoryUsage);

    /// Debug-tier metadata.
    ///
    /// ## Errors
    ///
    /// - `DebugNotEnabled`: the code has no Debug tier
    fn debug_metadata(&self) -> Result<&MetadataTier>
    {
        self.metadata_tier(Tier::Debug).ok_or(TraplineError::DebugNotEnabled)
    }

    /// Function owning the trap slot at `offset`.
    fn func_of_trap(&self, offset: BytecodeOffset) -> Option<FuncIndex>
    {
        let debug = self.metadata_tier(Tier::Debug)?;
        let site = debug.breakpoint_site(offset)?;
        debug.lookup_func_range(site.return_address_offset)?.func_index
    }

    /// Bytecode offsets of every trap slot in `func`, ascending by code position.
    fn trap_offsets(&self, func: FuncIndex) -> Vec<BytecodeOffset>
    {
        let Some(debug) = self.metadata_tier(Tier::Debug) else {
            return Vec::new();
        };
        let Some(range) = debug.func_code_range(func) else {
            return Vec::new();
        };
        debug
            .call_sites_in(range, CallSiteKind::Breakpoint)
            .map(|site| site.line_or_bytecode)
            .collect()
    }
}

/// Counters of code modifications, for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchStats
{
    pub traps_installed: u64,
    pub traps_removed: u64,
    pub frame_trap_toggles: u64,
    pub tier_switches: u64,
    pub icache_flushes: u64,
}

/// One tier's machine code and metadata.
#[derive(Debug)]
pub struct CodeTier
{
    pub(crate) metadata: MetadataTier,
    pub(crate) segment: Vec<u8>,
    pub(crate) writable: bool,
}

impl CodeTier
{
    #[must_use]
    pub fn metadata(&self) -> &MetadataTier
    {
        &self.metadata
    }

    #[must_use]
    pub fn segment(&self) -> &[u8]
    {
        &self.segment
    }
}

/// In-process compiled code store.
#[derive(Debug)]
pub struct CompiledCode
{
    metadata: Arc<Metadata>,
    tiers: Vec<CodeTier>,
    selected: Vec<Option<Tier>>,
    executing: BTreeSet<FuncIndex>,
    stats: PatchStats,
}

impl CompiledCode
{
    pub(crate) fn from_parts(metadata: Arc<Metadata>, tiers: Vec<CodeTier>, selected: Vec<Option<Tier>>) -> Self
    {
        Self {
            metadata,
            tiers,
            selected,
            executing: BTreeSet::new(),
            stats: PatchStats::default(),
        }
    }

    /// Code of `tier`, if it was compiled.
    #[must_use]
    pub fn tier(&self, tier: Tier) -> Option<&CodeTier>
    {
        self.tiers.iter().find(|t| t.metadata.tier == tier)
    }

    /// Tiers available, in compile order.
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_
    {
        self.tiers.iter().map(|t| t.metadata.tier)
    }

    #[must_use]
    pub fn patch_stats(&self) -> PatchStats
    {
        self.stats
    }

    /// True if the frame-trap slot of `func`'s entry is armed.
    #[must_use]
    pub fn frame_traps_installed(&self, func: FuncIndex) -> bool
    {
        let Some(debug) = self.tier(Tier::Debug) else {
            return false;
        };
        let Some(range) = debug.metadata.func_code_range(func) else {
            return false;
        };
        debug
            .metadata
            .call_sites_in(range, CallSiteKind::EnterFrame)
            .all(|site| patch::is_call_slot(&debug.segment, site.return_address_offset as usize))
    }

    /// Mark `func` as actively executing. Patching it is fatal until
    /// [`CompiledCode::end_execution`] is called.
    pub fn begin_execution(&mut self, func: FuncIndex)
    {
        self.executing.insert(func);
    }

    pub fn end_execution(&mut self, func: FuncIndex)
    {
        self.executing.remove(&func);
    }

    fn assert_not_executing(&self, func: Option<FuncIndex>)
    {
        if let Some(func) = func {
            assert!(
                !self.executing.contains(&func),
                "attempted to patch {func} while it is executing"
            );
        }
    }

    fn debug_tier_mut(&mut self) -> Result<(&mut CodeTier, &mut PatchStats)>
    {
        let tier = self
            .tiers
            .iter_mut()
            .find(|t| t.metadata.tier == Tier::Debug)
            .ok_or(TraplineError::DebugNotEnabled)?;
        Ok((tier, &mut self.stats))
    }

    fn toggle_trap(&mut self, offset: BytecodeOffset, enabled: bool) -> Result<()>
    {
        let debug = self.tier(Tier::Debug).ok_or(TraplineError::DebugNotEnabled)?;
        let site = *debug.metadata.breakpoint_site(offset).ok_or(TraplineError::NoTrapSite(offset))?;
        let owner = debug
            .metadata
            .lookup_func_range(site.return_address_offset)
            .and_then(|range| range.func_index);
        let island = patch::nearest_far_jump(&debug.metadata.debug_trap_far_jump_offsets, site.return_address_offset);
        self.assert_not_executing(owner);

        let (tier, stats) = self.debug_tier_mut()?;
        let mut code = WritableCode::new(&mut tier.segment, &mut tier.writable, &mut stats.icache_flushes);
        let return_address = site.return_address_offset as usize;
        if enabled {
            let island = island.ok_or_else(|| TraplineError::CorruptCode("debug tier has no far-jump islands".into()))?;
            code.patch_nop_to_call(return_address, island as usize)?;
            drop(code);
            stats.traps_installed += 1;
        } else {
            code.patch_call_to_nop(return_address)?;
            drop(code);
            stats.traps_removed += 1;
        }
        tracing::debug!(offset = %offset, enabled, "toggled debug trap");
        Ok(())
    }
}

impl CodePatcher for CompiledCode
{
    fn install_trap(&mut self, offset: BytecodeOffset) -> Result<()>
    {
        self.toggle_trap(offset, true)
    }

    fn remove_trap(&mut self, offset: BytecodeOffset) -> Result<()>
    {
        self.toggle_trap(offset, false)
    }

    fn set_frame_traps(&mut self, enabled: bool) -> Result<()>
    {
        let debug = self.tier(Tier::Debug).ok_or(TraplineError::DebugNotEnabled)?;
        let mut slots = Vec::new();
        for site in &debug.metadata.call_sites {
            if !matches!(site.kind, CallSiteKind::EnterFrame | CallSiteKind::LeaveFrame) {
                continue;
            }
            let owner = debug
                .metadata
                .lookup_func_range(site.return_address_offset)
                .and_then(|range| range.func_index);
            let island = patch::nearest_far_jump(&debug.metadata.debug_trap_far_jump_offsets, site.return_address_offset);
            slots.try_reserve(1).map_err(TraplineError::oom("collecting frame trap slots"))?;
            slots.push((site.return_address_offset as usize, island, owner));
        }
        for &(_, _, owner) in &slots {
            self.assert_not_executing(owner);
        }

        let (tier, stats) = self.debug_tier_mut()?;
        let mut code = WritableCode::new(&mut tier.segment, &mut tier.writable, &mut stats.icache_flushes);
        for (return_address, island, _) in slots {
            if enabled {
                let island =
                    island.ok_or_else(|| TraplineError::CorruptCode("debug tier has no far-jump islands".into()))?;
                code.patch_nop_to_call(return_address, island as usize)?;
            } else {
                code.patch_call_to_nop(return_address)?;
            }
        }
        drop(code);
        stats.frame_trap_toggles += 1;
        tracing::debug!(enabled, "toggled enter/leave frame traps");
        Ok(())
    }

    fn select_tier(&mut self, func: FuncIndex, tier: Tier) -> Result<()>
    {
        let count = self.metadata.func_count();
        let current = *self
            .selected
            .get(func.as_usize())
            .ok_or(TraplineError::FuncIndexOutOfRange { index: func, count })?;
        if current == Some(tier) {
            return Ok(());
        }
        let compiled = self
            .tier(tier)
            .and_then(|code| code.metadata.func_code_range(func))
            .is_some();
        if !compiled {
            return Err(TraplineError::TierUnavailable(tier));
        }
        self.assert_not_executing(Some(func));
        self.selected[func.as_usize()] = Some(tier);
        self.stats.tier_switches += 1;
        tracing::debug!(func = %func, tier = %tier, "switched function tier");
        Ok(())
    }
}

impl CodeStore for CompiledCode
{
    fn metadata(&self) -> &Arc<Metadata>
    {
        &self.metadata
    }

    fn metadata_tier(&self, tier: Tier) -> Option<&MetadataTier>
    {
        self.tier(tier).map(CodeTier::metadata)
    }

    fn selected_tier(&self, func: FuncIndex) -> Option<Tier>
    {
        self.selected.get(func.as_usize()).copied().flatten()
    }

    fn default_tier(&self) -> Tier
    {
        [Tier::Optimized, Tier::Baseline]
            .into_iter()
            .find(|tier| self.tier(*tier).is_some())
            .unwrap_or(Tier::Debug)
    }

    fn is_trap_installed(&self, offset: BytecodeOffset) -> bool
    {
        self.tier(Tier::Debug).is_some_and(|debug| {
            debug
                .metadata
                .breakpoint_site(offset)
                .is_some_and(|site| patch::is_call_slot(&debug.segment, site.return_address_offset as usize))
        })
    }

    fn add_size_of(&self, seen_metadata: &mut SeenSet, seen_code: &mut SeenSet, usage: &mut MemoryUsage)
    {
        if seen_metadata.insert_arc(&self.metadata) {
            usage.data += std::mem::size_of::<Metadata>() + self.metadata.size_of_excluding_this();
        }
        if seen_code.insert(self) {
            for tier in &self.tiers {
                usage.code += tier.segment.capacity();
                usage.data += tier.metadata.size_of_excluding_this();
            }
            usage.data += std::mem::size_of::<Self>() + self.selected.capacity() * std::mem::size_of::<Option<Tier>>();
        }
    }
}

/// Take exclusive ownership of shared code so it can be patched.
///
/// ## Errors
///
/// - `CodeShared`: another instance still holds a reference
pub fn take_exclusive<C>(code: Arc<C>) -> Result<C>
{
    Arc::try_unwrap(code).map_err(|code| TraplineError::CodeShared {
        holders: Arc::strong_count(&code) - 1,
    })
}
