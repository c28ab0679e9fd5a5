//! # Code Builder
//!
//! Builder pattern for laying out compiled code from a description of the
//! module's functions.
//!
//! The builder is the stand-in for the compiler backend: it lays out each
//! requested tier, emits trap slots in the Debug tier, and records code
//! ranges and call sites exactly as the patching machinery expects them.
//!
//! ## Debug tier layout
//!
//! ```text
//! [debug trap handler] [far jump] [func 0] .. [func 3] [far jump] [func 4] ..
//!
//! func:  push | enter-frame slot | (filler | trap slot)* | leave-frame slot | pop ret
//! ```
//!
//! ## Example
//!
//! ```rust
//! use trapline_core::code::{CodeBuilder, FunctionSpec, Tier};
//! use trapline_core::types::{BytecodeOffset, ExprType, ValType};
//!
//! let code = CodeBuilder::new()
//!     .function(
//!         FunctionSpec::new(BytecodeOffset::new(0x20))
//!             .with_args([ValType::I32])
//!             .with_result(ExprType::Value(ValType::I32))
//!             .with_trap_offsets([0x22, 0x24].map(BytecodeOffset::new)),
//!     )
//!     .build()?;
//! assert!(code.tier(Tier::Debug).is_some());
//! # Ok::<(), trapline_core::error::TraplineError>(())
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use super::patch::{self, FAR_JUMP_LEN, JMP_REL32, NOP5};
use super::{CallSite, CallSiteKind, CodeRange, CodeRangeKind, CodeTier, CompiledCode, GlobalDesc, Metadata, MetadataTier, Tier};
use crate::error::{Result, TraplineError};
use crate::source_map::ExprLoc;
use crate::types::{BytecodeOffset, ExprType, FuncIndex, ValType};

/// Number of functions between two far-jump islands in the Debug tier.
pub const FAR_JUMP_INTERVAL: usize = 4;

const DEBUG_TRAP_HANDLER: [u8; 8] = [0xcc; 8];
const PROLOGUE: [u8; 1] = [0x55];
const EPILOGUE: [u8; 2] = [0x5d, 0xc3];
const FILLER: u8 = 0x90;

/// Description of one defined function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec
{
    args: Vec<ValType>,
    result: ExprType,
    body_offset: BytecodeOffset,
    trap_offsets: Vec<BytecodeOffset>,
}

impl FunctionSpec
{
    /// A function whose body starts at `body_offset` in the module bytes.
    #[must_use]
    pub fn new(body_offset: BytecodeOffset) -> Self
    {
        Self {
            args: Vec::new(),
            result: ExprType::Void,
            body_offset,
            trap_offsets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = ValType>) -> Self
    {
        self.args = args.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: ExprType) -> Self
    {
        self.result = result;
        self
    }

    /// Instruction boundaries that get a trap slot in the Debug tier.
    #[must_use]
    pub fn with_trap_offsets(mut self, offsets: impl IntoIterator<Item = BytecodeOffset>) -> Self
    {
        self.trap_offsets = offsets.into_iter().collect();
        self
    }
}

/// Builder for [`CompiledCode`].
#[derive(Debug, Clone)]
pub struct CodeBuilder
{
    imports: Vec<(Vec<ValType>, ExprType)>,
    functions: Vec<FunctionSpec>,
    globals: Vec<GlobalDesc>,
    source_locations: Vec<ExprLoc>,
    tiers: Vec<Tier>,
}

impl Default for CodeBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl CodeBuilder
{
    /// A builder producing Baseline and Debug tiers.
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            imports: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            source_locations: Vec::new(),
            tiers: vec![Tier::Baseline, Tier::Debug],
        }
    }

    /// Add an imported function. Imports come first in the function index space.
    #[must_use]
    pub fn import(mut self, args: impl IntoIterator<Item = ValType>, result: ExprType) -> Self
    {
        self.imports.push((args.into_iter().collect(), result));
        self
    }

    #[must_use]
    pub fn function(mut self, spec: FunctionSpec) -> Self
    {
        self.functions.push(spec);
        self
    }

    #[must_use]
    pub fn global(mut self, desc: GlobalDesc) -> Self
    {
        self.globals.push(desc);
        self
    }

    /// Source locations from the module's debug section.
    #[must_use]
    pub fn source_locations(mut self, locations: impl IntoIterator<Item = ExprLoc>) -> Self
    {
        self.source_locations = locations.into_iter().collect();
        self
    }

    /// Tiers to compile. Duplicates are ignored.
    #[must_use]
    pub fn tiers(mut self, tiers: impl IntoIterator<Item = Tier>) -> Self
    {
        let unique: BTreeSet<Tier> = tiers.into_iter().collect();
        self.tiers = unique.into_iter().collect();
        self
    }

    /// Lay out every requested tier.
    ///
    /// ## Errors
    ///
    /// - `InvalidModule`: no tier requested, or a trap offset is claimed twice
    /// - `CorruptCode`: the layout does not fit 32-bit code offsets
    pub fn build(self) -> Result<CompiledCode>
    {
        if self.tiers.is_empty() {
            return Err(TraplineError::InvalidModule("no tier requested".into()));
        }
        let mut claimed = BTreeSet::new();
        for offset in self.functions.iter().flat_map(|f| &f.trap_offsets) {
            if !claimed.insert(*offset) {
                return Err(TraplineError::InvalidModule(format!("trap offset {offset} claimed twice")));
            }
        }

        let import_count = self.imports.len();
        let func_count = import_count + self.functions.len();
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for &tier in &self.tiers {
            let code_tier = if tier == Tier::Debug {
                self.layout_debug(import_count, func_count)?
            } else {
                self.layout_plain(tier, import_count, func_count)?
            };
            tiers.push(code_tier);
        }

        let default_tier = [Tier::Optimized, Tier::Baseline]
            .into_iter()
            .find(|tier| self.tiers.contains(tier))
            .unwrap_or(Tier::Debug);
        let selected = (0..func_count)
            .map(|idx| (idx >= import_count).then_some(default_tier))
            .collect();

        let (mut func_arg_types, mut func_result_types): (Vec<_>, Vec<_>) = self.imports.into_iter().unzip();
        for spec in self.functions {
            func_arg_types.push(spec.args);
            func_result_types.push(spec.result);
        }
        let metadata = Metadata {
            func_arg_types,
            func_result_types,
            globals: self.globals,
            source_locations: self.source_locations,
            debug_enabled: self.tiers.contains(&Tier::Debug),
        };
        tracing::debug!(functions = func_count, tiers = tiers.len(), "laid out compiled code");
        Ok(CompiledCode::from_parts(Arc::new(metadata), tiers, selected))
    }

    fn layout_plain(&self, tier: Tier, import_count: usize, func_count: usize) -> Result<CodeTier>
    {
        let mut segment = Vec::new();
        let mut code_ranges = Vec::new();
        let mut func_to_code_range = vec![None; func_count];
        for (i, spec) in self.functions.iter().enumerate() {
            let func = func_index(import_count + i)?;
            let begin = code_offset(segment.len())?;
            segment.extend_from_slice(&PROLOGUE);
            segment.resize(segment.len() + spec.trap_offsets.len().max(1), FILLER);
            segment.extend_from_slice(&EPILOGUE);
            func_to_code_range[func.as_usize()] = Some(code_ranges.len());
            code_ranges.push(function_range(func, spec, begin, code_offset(segment.len())?));
        }
        Ok(CodeTier {
            metadata: MetadataTier {
                tier,
                code_ranges,
                call_sites: Vec::new(),
                func_to_code_range,
                debug_trap_far_jump_offsets: Vec::new(),
            },
            segment,
            writable: false,
        })
    }

    fn layout_debug(&self, import_count: usize, func_count: usize) -> Result<CodeTier>
    {
        let mut segment = DEBUG_TRAP_HANDLER.to_vec();
        let mut code_ranges = vec![CodeRange {
            kind: CodeRangeKind::DebugTrap,
            begin: 0,
            end: code_offset(segment.len())?,
            func_index: None,
            func_line_or_bytecode: BytecodeOffset::default(),
        }];
        let mut call_sites = Vec::new();
        let mut far_jumps = Vec::new();
        let mut func_to_code_range = vec![None; func_count];

        let mut trap_slot = |segment: &mut Vec<u8>, kind: CallSiteKind, at: BytecodeOffset| -> Result<()> {
            segment.extend_from_slice(&NOP5);
            call_sites.push(CallSite {
                kind,
                line_or_bytecode: at,
                return_address_offset: code_offset(segment.len())?,
            });
            Ok(())
        };

        for (i, spec) in self.functions.iter().enumerate() {
            if i % FAR_JUMP_INTERVAL == 0 {
                let island = segment.len();
                let disp = patch::rel32(island + FAR_JUMP_LEN, 0)?;
                segment.push(JMP_REL32);
                segment.extend_from_slice(&disp.to_le_bytes());
                far_jumps.push(code_offset(island)?);
                code_ranges.push(CodeRange {
                    kind: CodeRangeKind::FarJumpIsland,
                    begin: code_offset(island)?,
                    end: code_offset(segment.len())?,
                    func_index: None,
                    func_line_or_bytecode: BytecodeOffset::default(),
                });
            }

            let func = func_index(import_count + i)?;
            let begin = code_offset(segment.len())?;
            segment.extend_from_slice(&PROLOGUE);
            trap_slot(&mut segment, CallSiteKind::EnterFrame, spec.body_offset)?;
            for &offset in &spec.trap_offsets {
                segment.push(FILLER);
                trap_slot(&mut segment, CallSiteKind::Breakpoint, offset)?;
            }
            trap_slot(&mut segment, CallSiteKind::LeaveFrame, spec.body_offset)?;
            segment.extend_from_slice(&EPILOGUE);
            func_to_code_range[func.as_usize()] = Some(code_ranges.len());
            code_ranges.push(function_range(func, spec, begin, code_offset(segment.len())?));
        }

        Ok(CodeTier {
            metadata: MetadataTier {
                tier: Tier::Debug,
                code_ranges,
                call_sites,
                func_to_code_range,
                debug_trap_far_jump_offsets: far_jumps,
            },
            segment,
            writable: false,
        })
    }
}

fn function_range(func: FuncIndex, spec: &FunctionSpec, begin: u32, end: u32) -> CodeRange
{
    CodeRange {
        kind: CodeRangeKind::Function,
        begin,
        end,
        func_index: Some(func),
        func_line_or_bytecode: spec.body_offset,
    }
}

fn code_offset(len: usize) -> Result<u32>
{
    u32::try_from(len).map_err(|_| TraplineError::CorruptCode(format!("code offset {len} exceeds 32 bits")))
}

fn func_index(idx: usize) -> Result<FuncIndex>
{
    u32::try_from(idx)
        .map(FuncIndex)
        .map_err(|_| TraplineError::InvalidModule(format!("function index {idx} exceeds 32 bits")))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::code::CodeStore;

    fn off(value: u32) -> BytecodeOffset
    {
        BytecodeOffset::new(value)
    }

    #[test]
    fn test_debug_tier_has_trap_slot_per_offset()
    {
        let code = CodeBuilder::new()
            .import([], ExprType::Void)
            .function(FunctionSpec::new(off(8)).with_trap_offsets([off(10), off(20)]))
            .build()
            .unwrap();

        let debug = code.metadata_tier(Tier::Debug).unwrap();
        assert_eq!(code.trap_offsets(FuncIndex(1)), vec![off(10), off(20)]);
        assert!(code.trap_offsets(FuncIndex(0)).is_empty());
        assert_eq!(code.func_of_trap(off(20)), Some(FuncIndex(1)));
        assert_eq!(code.func_of_trap(off(21)), None);
        assert_eq!(debug.debug_trap_far_jump_offsets.len(), 1);
        assert_eq!(
            debug.call_sites.iter().filter(|s| s.kind == CallSiteKind::EnterFrame).count(),
            1
        );
    }

    #[test]
    fn test_far_jump_islands_are_spread()
    {
        let mut builder = CodeBuilder::new();
        for i in 0..9u32 {
            builder = builder.function(FunctionSpec::new(off(100 * i)).with_trap_offsets([off(100 * i + 1)]));
        }
        let code = builder.build().unwrap();
        let debug = code.metadata_tier(Tier::Debug).unwrap();
        assert_eq!(debug.debug_trap_far_jump_offsets.len(), 3);
    }

    #[test]
    fn test_duplicate_trap_offset_is_rejected()
    {
        let result = CodeBuilder::new()
            .function(FunctionSpec::new(off(0)).with_trap_offsets([off(5)]))
            .function(FunctionSpec::new(off(10)).with_trap_offsets([off(5)]))
            .build();
        assert!(matches!(result, Err(TraplineError::InvalidModule(_))));
    }

    #[test]
    fn test_default_tier_selection()
    {
        let code = CodeBuilder::new()
            .tiers([Tier::Debug, Tier::Optimized, Tier::Baseline])
            .import([], ExprType::Void)
            .function(FunctionSpec::new(off(0)))
            .build()
            .unwrap();
        assert_eq!(code.default_tier(), Tier::Optimized);
        assert_eq!(code.selected_tier(FuncIndex(0)), None);
        assert_eq!(code.selected_tier(FuncIndex(1)), Some(Tier::Optimized));
    }

    #[test]
    fn test_debug_only_code_runs_debug_tier()
    {
        let code = CodeBuilder::new()
            .tiers([Tier::Debug])
            .function(FunctionSpec::new(off(0)))
            .build()
            .unwrap();
        assert_eq!(code.default_tier(), Tier::Debug);
        assert_eq!(code.selected_tier(FuncIndex(0)), Some(Tier::Debug));
    }
}
