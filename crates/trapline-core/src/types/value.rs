//! Value types, raw values and their debugger-facing representation.

use std::fmt;

/// Static type of a local, argument or global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType
{
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValType
{
    /// Decode a value type from its binary-format type code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self>
    {
        match code {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            0x7b => Some(ValType::V128),
            0x70 => Some(ValType::FuncRef),
            0x6f => Some(ValType::ExternRef),
            _ => None,
        }
    }

    /// Binary-format type code.
    #[must_use]
    pub const fn code(self) -> u8
    {
        match self {
            ValType::I32 => 0x7f,
            ValType::I64 => 0x7e,
            ValType::F32 => 0x7d,
            ValType::F64 => 0x7c,
            ValType::V128 => 0x7b,
            ValType::FuncRef => 0x70,
            ValType::ExternRef => 0x6f,
        }
    }

    /// Size in bytes of a slot holding a value of this type.
    #[must_use]
    pub const fn size(self) -> usize
    {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 | ValType::FuncRef | ValType::ExternRef => 8,
            ValType::V128 => 16,
        }
    }
}

impl fmt::Display for ValType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        };
        f.write_str(name)
    }
}

/// Result type of a function: nothing, or a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprType
{
    Void,
    Value(ValType),
}

impl fmt::Display for ExprType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ExprType::Void => f.write_str("void"),
            ExprType::Value(ty) => ty.fmt(f),
        }
    }
}

/// A raw numeric value as stored by compiled code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val
{
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val
{
    #[must_use]
    pub const fn ty(self) -> ValType
    {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Decode a value of type `ty` from little-endian slot bytes.
    ///
    /// Returns `None` for types that have no numeric representation or when
    /// `bytes` is too short.
    #[must_use]
    pub fn from_le_bytes(ty: ValType, bytes: &[u8]) -> Option<Self>
    {
        match ty {
            ValType::I32 => Some(Val::I32(i32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))),
            ValType::I64 => Some(Val::I64(i64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))),
            ValType::F32 => Some(Val::F32(f32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))),
            ValType::F64 => Some(Val::F64(f64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))),
            ValType::V128 | ValType::FuncRef | ValType::ExternRef => None,
        }
    }
}

/// Value as presented to an external debugger.
///
/// 32-bit integers stay integers; floats are widened to `f64` with NaN
/// payloads canonicalized; 64-bit integers keep full precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostValue
{
    Int32(i32),
    Double(f64),
    BigInt(i64),
}

impl From<Val> for HostValue
{
    fn from(value: Val) -> Self
    {
        match value {
            Val::I32(v) => HostValue::Int32(v),
            Val::I64(v) => HostValue::BigInt(v),
            Val::F32(v) => HostValue::Double(canonicalize_nan(f64::from(v))),
            Val::F64(v) => HostValue::Double(canonicalize_nan(v)),
        }
    }
}

fn canonicalize_nan(value: f64) -> f64
{
    if value.is_nan() {
        f64::NAN
    } else {
        value
    }
}
