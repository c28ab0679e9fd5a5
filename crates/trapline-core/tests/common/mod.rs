//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use trapline_core::code::{CodeBuilder, CompiledCode, FunctionSpec, GlobalDesc, GlobalKind};
use trapline_core::debug_state::DebugState;
use trapline_core::module::{Module, MODULE_MAGIC, MODULE_VERSION, SOURCE_MAPPING_URL_SECTION};
use trapline_core::source_map::ExprLoc;
use trapline_core::types::{BytecodeOffset, ExprType, FuncIndex, InstanceId, Val, ValType};

pub const CODE_SECTION_ID: u8 = 10;
pub const SOURCE_MAP_URL: &str = "https://example.test/app.wasm.map";

pub const INSTANCE: InstanceId = InstanceId(7);
pub const IMPORT: FuncIndex = FuncIndex(0);
pub const MAIN: FuncIndex = FuncIndex(1);
pub const HELPER: FuncIndex = FuncIndex(2);

/// Bytes of the code section payload. The payload starts at module offset 10.
const CODE_PAYLOAD_START: u32 = 10;
const CODE_PAYLOAD_LEN: usize = 40;

pub fn off(value: u32) -> BytecodeOffset
{
    BytecodeOffset::new(value)
}

/// Module bytes with one code section and, optionally, a `sourceMappingURL` section.
///
/// `MAIN`'s body at offset 10 declares two `i64` locals; `HELPER`'s body at
/// offset 34 declares none.
pub fn module_bytes(with_source_map: bool) -> Vec<u8>
{
    let mut payload = vec![0x01; CODE_PAYLOAD_LEN];
    payload[..3].copy_from_slice(&[0x01, 0x02, ValType::I64.code()]);
    payload[(34 - CODE_PAYLOAD_START) as usize] = 0x00;

    let mut bytes = MODULE_MAGIC.to_vec();
    bytes.extend_from_slice(&MODULE_VERSION.to_le_bytes());
    bytes.push(CODE_SECTION_ID);
    bytes.push(u8::try_from(payload.len()).unwrap());
    assert_eq!(bytes.len(), CODE_PAYLOAD_START as usize);
    bytes.extend_from_slice(&payload);

    if with_source_map {
        let mut section = Vec::new();
        section.push(u8::try_from(SOURCE_MAPPING_URL_SECTION.len()).unwrap());
        section.extend_from_slice(SOURCE_MAPPING_URL_SECTION.as_bytes());
        section.push(u8::try_from(SOURCE_MAP_URL.len()).unwrap());
        section.extend_from_slice(SOURCE_MAP_URL.as_bytes());
        bytes.push(0);
        bytes.push(u8::try_from(section.len()).unwrap());
        bytes.extend_from_slice(&section);
    }
    bytes
}

pub fn module(with_source_map: bool) -> Arc<Module>
{
    Arc::new(Module::from_bytes(module_bytes(with_source_map)).unwrap())
}

pub fn globals() -> Vec<GlobalDesc>
{
    vec![
        GlobalDesc {
            ty: ValType::I32,
            mutable: false,
            kind: GlobalKind::Constant(Val::I32(42)),
        },
        GlobalDesc {
            ty: ValType::F32,
            mutable: true,
            kind: GlobalKind::Variable {
                offset: 0,
                indirect: false,
            },
        },
        GlobalDesc {
            ty: ValType::I64,
            mutable: true,
            kind: GlobalKind::Variable {
                offset: 4,
                indirect: true,
            },
        },
    ]
}

/// One import and two defined functions.
///
/// `MAIN` has trap slots at 10, 20 and 30 on lines 1, 2 and 2; `HELPER` has
/// slots at 36 and 38 on lines 3 and 4.
pub fn builder() -> CodeBuilder
{
    let mut builder = CodeBuilder::new()
        .import([ValType::I32], ExprType::Void)
        .function(
            FunctionSpec::new(off(10))
                .with_args([ValType::I32, ValType::F64])
                .with_result(ExprType::Value(ValType::I32))
                .with_trap_offsets([off(10), off(20), off(30)]),
        )
        .function(FunctionSpec::new(off(34)).with_trap_offsets([off(36), off(38)]));
    for desc in globals() {
        builder = builder.global(desc);
    }
    builder
}

pub fn source_locations() -> Vec<ExprLoc>
{
    vec![
        ExprLoc::new(2, 8, off(30)),
        ExprLoc::new(1, 1, off(10)),
        ExprLoc::new(2, 4, off(20)),
        ExprLoc::new(3, 1, off(36)),
        ExprLoc::new(4, 1, off(38)),
    ]
}

pub fn code() -> Arc<CompiledCode>
{
    Arc::new(builder().source_locations(source_locations()).build().unwrap())
}

pub fn debug_state() -> DebugState
{
    DebugState::new(INSTANCE, code(), module(true)).unwrap()
}
