//! Breakpoint site bookkeeping.
//!
//! A [`BreakpointSite`] is the record that owns the trap at one bytecode
//! offset, plus the set of (instance, debugger, handler) owners that asked for
//! it. Sites are created lazily on first reference and destroyed once their
//! last owner is gone.
//!
//! The table is the only caller of the trap half of [`CodePatcher`]. It keeps
//! a per-site trap bit so patch requests are issued only when the requested
//! state differs from the current one.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::code::CodePatcher;
use crate::error::{Result, TraplineError};
use crate::stepping::StepModeCounters;
use crate::types::{BytecodeOffset, DebuggerId, FuncIndex, HandlerId, InstanceId};

/// Handle identifying a breakpoint site for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(u64);

impl SiteId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for SiteId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "site#{}", self.0)
    }
}

/// One party holding a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointOwner
{
    pub instance: InstanceId,
    pub debugger: DebuggerId,
    pub handler: HandlerId,
}

impl BreakpointOwner
{
    #[must_use]
    pub const fn new(instance: InstanceId, debugger: DebuggerId, handler: HandlerId) -> Self
    {
        Self {
            instance,
            debugger,
            handler,
        }
    }

    /// True if the owner falls under the given scope. `None` matches anything.
    #[must_use]
    pub fn matches(&self, instance: InstanceId, debugger: Option<DebuggerId>, handler: Option<HandlerId>) -> bool
    {
        self.instance == instance
            && debugger.is_none_or(|d| d == self.debugger)
            && handler.is_none_or(|h| h == self.handler)
    }
}

/// The trap record for one bytecode offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSite
{
    id: SiteId,
    offset: BytecodeOffset,
    func: FuncIndex,
    trap_installed: bool,
    owners: SmallVec<[BreakpointOwner; 2]>,
}

impl BreakpointSite
{
    #[must_use]
    pub fn id(&self) -> SiteId
    {
        self.id
    }

    #[must_use]
    pub fn offset(&self) -> BytecodeOffset
    {
        self.offset
    }

    /// Function containing the site's instruction.
    #[must_use]
    pub fn func(&self) -> FuncIndex
    {
        self.func
    }

    #[must_use]
    pub fn trap_installed(&self) -> bool
    {
        self.trap_installed
    }

    #[must_use]
    pub fn owners(&self) -> &[BreakpointOwner]
    {
        &self.owners
    }
}

/// Breakpoint sites of one debugged instance, keyed by offset.
#[derive(Debug, Default)]
pub struct BreakpointSiteTable
{
    next_id: u64,
    sites: HashMap<BytecodeOffset, BreakpointSite>,
}

impl BreakpointSiteTable
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn allocate_id(&mut self) -> SiteId
    {
        self.next_id = self.next_id.wrapping_add(1);
        SiteId::from_raw(self.next_id)
    }

    /// Site at `offset`, created (trap not installed, no owners) if missing.
    ///
    /// Returns the site's id and whether it was created by this call.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: the table could not grow; it is unchanged
    pub fn get_or_create(&mut self, offset: BytecodeOffset, func: FuncIndex) -> Result<(SiteId, bool)>
    {
        if let Some(site) = self.sites.get(&offset) {
            return Ok((site.id, false));
        }
        self.sites
            .try_reserve(1)
            .map_err(TraplineError::oom("creating a breakpoint site"))?;
        let id = self.allocate_id();
        self.sites.insert(
            offset,
            BreakpointSite {
                id,
                offset,
                func,
                trap_installed: false,
                owners: SmallVec::new(),
            },
        );
        tracing::debug!(offset = %offset, func = %func, site = %id, "created breakpoint site");
        Ok((id, true))
    }

    /// Add `owner` to the site at `offset`. Returns `false` if it was already an owner.
    ///
    /// ## Errors
    ///
    /// - `NoBreakpointSite`: no site at `offset`
    /// - `OutOfMemory`: the owner list could not grow; it is unchanged
    pub fn add_owner(&mut self, offset: BytecodeOffset, owner: BreakpointOwner) -> Result<bool>
    {
        let site = self
            .sites
            .get_mut(&offset)
            .ok_or(TraplineError::NoBreakpointSite(offset))?;
        if site.owners.contains(&owner) {
            return Ok(false);
        }
        site.owners.try_reserve(1).map_err(|_| TraplineError::OutOfMemory {
            what: "recording a breakpoint owner",
        })?;
        site.owners.push(owner);
        Ok(true)
    }

    /// Remove `owner` from the site at `offset`. Returns `true` if it was present.
    pub fn remove_owner(&mut self, offset: BytecodeOffset, owner: &BreakpointOwner) -> bool
    {
        let Some(site) = self.sites.get_mut(&offset) else {
            return false;
        };
        let before = site.owners.len();
        site.owners.retain(|o| o != owner);
        site.owners.len() != before
    }

    #[must_use]
    pub fn get(&self, offset: BytecodeOffset) -> Option<&BreakpointSite>
    {
        self.sites.get(&offset)
    }

    #[must_use]
    pub fn exists(&self, offset: BytecodeOffset) -> bool
    {
        self.sites.contains_key(&offset)
    }

    /// True only if a site exists at `offset` and its trap bit is set.
    #[must_use]
    pub fn has_installed_trap(&self, offset: BytecodeOffset) -> bool
    {
        self.sites.get(&offset).is_some_and(|site| site.trap_installed)
    }

    /// True if `func` contains at least one site.
    #[must_use]
    pub fn has_sites_in(&self, func: FuncIndex) -> bool
    {
        self.sites.values().any(|site| site.func == func)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.sites.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.sites.is_empty()
    }

    /// Every site, ascending by offset.
    #[must_use]
    pub fn sites(&self) -> Vec<&BreakpointSite>
    {
        let mut sites: Vec<_> = self.sites.values().collect();
        sites.sort_unstable_by_key(|site| site.offset);
        sites
    }

    /// Set the trap bit of the site at `offset` to `enabled`.
    ///
    /// Machine code is patched only when the bit changes and the function is
    /// not in step mode (stepping keeps every slot of the function armed).
    ///
    /// ## Errors
    ///
    /// - `NoBreakpointSite`: no site at `offset`
    /// - any patch error; the trap bit is unchanged
    pub fn install_or_remove_trap<P>(
        &mut self,
        offset: BytecodeOffset,
        enabled: bool,
        patcher: &mut P,
        stepping: &StepModeCounters,
    ) -> Result<()>
    where
        P: CodePatcher + ?Sized,
    {
        let site = self
            .sites
            .get_mut(&offset)
            .ok_or(TraplineError::NoBreakpointSite(offset))?;
        if site.trap_installed == enabled {
            tracing::trace!(offset = %offset, enabled, "breakpoint trap already in requested state");
            return Ok(());
        }
        if !stepping.is_enabled(site.func) {
            if enabled {
                patcher.install_trap(offset)?;
            } else {
                patcher.remove_trap(offset)?;
            }
        }
        site.trap_installed = enabled;
        Ok(())
    }

    /// Remove the site at `offset`, uninstalling its trap first. No-op if absent.
    ///
    /// Returns the destroyed site.
    ///
    /// ## Errors
    ///
    /// Any patch error; the site is kept.
    pub fn destroy<P>(
        &mut self,
        offset: BytecodeOffset,
        patcher: &mut P,
        stepping: &StepModeCounters,
    ) -> Result<Option<BreakpointSite>>
    where
        P: CodePatcher + ?Sized,
    {
        if !self.exists(offset) {
            return Ok(None);
        }
        self.install_or_remove_trap(offset, false, patcher, stepping)?;
        let site = self.sites.remove(&offset);
        if let Some(site) = &site {
            tracing::debug!(offset = %offset, site = %site.id, "destroyed breakpoint site");
        }
        Ok(site)
    }

    /// Remove every owner matching the scope and destroy the sites left
    /// without owners. `None` for `debugger` or `handler` matches all.
    ///
    /// Sites whose every owner matches are destroyed first. Owners are
    /// stripped from the remaining sites only once every trap is removed, so
    /// a site never outlives its last owner.
    ///
    /// Returns the functions whose sites were destroyed, ascending and deduplicated.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: the work list could not be allocated; nothing changed
    /// - any patch error; sites destroyed before the failure stay destroyed,
    ///   every other site keeps all of its owners
    pub fn clear_breakpoints_in<P>(
        &mut self,
        instance: InstanceId,
        debugger: Option<DebuggerId>,
        handler: Option<HandlerId>,
        patcher: &mut P,
        stepping: &StepModeCounters,
    ) -> Result<Vec<FuncIndex>>
    where
        P: CodePatcher + ?Sized,
    {
        let mut emptied = Vec::new();
        emptied
            .try_reserve(self.sites.len())
            .map_err(TraplineError::oom("clearing breakpoints"))?;
        emptied.extend(
            self.sites
                .values()
                .filter(|site| {
                    !site.owners.is_empty() && site.owners.iter().all(|o| o.matches(instance, debugger, handler))
                })
                .map(|site| site.offset),
        );
        emptied.sort_unstable();
        let funcs = self.destroy_all_of(&emptied, patcher, stepping)?;

        for site in self.sites.values_mut() {
            site.owners.retain(|o| !o.matches(instance, debugger, handler));
        }
        Ok(funcs)
    }

    /// Destroy every site.
    ///
    /// ## Errors
    ///
    /// Same as [`BreakpointSiteTable::clear_breakpoints_in`].
    pub fn clear_all<P>(&mut self, patcher: &mut P, stepping: &StepModeCounters) -> Result<Vec<FuncIndex>>
    where
        P: CodePatcher + ?Sized,
    {
        let mut offsets = Vec::new();
        offsets
            .try_reserve(self.sites.len())
            .map_err(TraplineError::oom("clearing breakpoints"))?;
        offsets.extend(self.sites.keys().copied());
        offsets.sort_unstable();
        self.destroy_all_of(&offsets, patcher, stepping)
    }

    fn destroy_all_of<P>(
        &mut self,
        offsets: &[BytecodeOffset],
        patcher: &mut P,
        stepping: &StepModeCounters,
    ) -> Result<Vec<FuncIndex>>
    where
        P: CodePatcher + ?Sized,
    {
        let mut funcs = Vec::new();
        funcs
            .try_reserve(offsets.len())
            .map_err(TraplineError::oom("clearing breakpoints"))?;
        for &offset in offsets {
            if let Some(site) = self.destroy(offset, patcher, stepping)? {
                funcs.push(site.func);
            }
        }
        funcs.sort_unstable();
        funcs.dedup();
        Ok(funcs)
    }

    pub(crate) fn size_of_excluding_this(&self) -> usize
    {
        let spilled: usize = self
            .sites
            .values()
            .filter(|site| site.owners.spilled())
            .map(|site| site.owners.capacity() * std::mem::size_of::<BreakpointOwner>())
            .sum();
        self.sites.capacity() * std::mem::size_of::<(BytecodeOffset, BreakpointSite)>() + spilled
    }
}
