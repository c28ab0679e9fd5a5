//! Live instance storage read by the debugger.
//!
//! Only the pieces the debug layer inspects are modelled: the instance's
//! identity and its global data. Mutable globals live inline in the global
//! data area; indirect globals keep a cell index there instead, and the value
//! itself lives in a separately allocated cell.

use crate::code::{GlobalDesc, GlobalKind};
use crate::error::{Result, TraplineError};
use crate::types::{InstanceId, Val};

/// Size of an indirect global cell.
pub const GLOBAL_CELL_LEN: usize = 8;

const CELL_INDEX_LEN: usize = 4;

/// A running instance of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance
{
    id: InstanceId,
    global_data: Vec<u8>,
    cells: Vec<[u8; GLOBAL_CELL_LEN]>,
}

impl Instance
{
    /// Instantiate storage for `globals`.
    ///
    /// The global data area is sized to hold every variable global, and
    /// each indirect global gets its own zeroed cell.
    ///
    /// ## Errors
    ///
    /// - `OutOfMemory`: the global data or cells could not be allocated
    /// - `InvalidModule`: two globals overlap in the global data area
    pub fn new(id: InstanceId, globals: &[GlobalDesc]) -> Result<Self>
    {
        let mut len = 0usize;
        for desc in globals {
            if let GlobalKind::Variable { offset, indirect } = desc.kind {
                let size = if indirect { CELL_INDEX_LEN } else { desc.ty.size() };
                len = len.max(offset as usize + size);
            }
        }
        let mut global_data = Vec::new();
        global_data
            .try_reserve_exact(len)
            .map_err(TraplineError::oom("allocating global data"))?;
        global_data.resize(len, 0);

        let mut claimed = vec![false; len];
        let mut cells = Vec::new();
        for desc in globals {
            let GlobalKind::Variable { offset, indirect } = desc.kind else {
                continue;
            };
            let size = if indirect { CELL_INDEX_LEN } else { desc.ty.size() };
            let slot = &mut claimed[offset as usize..offset as usize + size];
            if slot.iter().any(|&taken| taken) {
                return Err(TraplineError::InvalidModule(format!("global slot {offset:#x} overlaps another global")));
            }
            slot.fill(true);
            if indirect {
                let index = u32::try_from(cells.len())
                    .map_err(|_| TraplineError::InvalidModule("too many indirect globals".into()))?;
                write_slot(&mut global_data, offset, &index.to_le_bytes())?;
                cells.try_reserve(1).map_err(TraplineError::oom("allocating global cells"))?;
                cells.push([0; GLOBAL_CELL_LEN]);
            }
        }
        tracing::debug!(instance = %id, global_bytes = len, cells = cells.len(), "instantiated globals");
        Ok(Self { id, global_data, cells })
    }

    #[must_use]
    pub fn id(&self) -> InstanceId
    {
        self.id
    }

    #[must_use]
    pub fn global_data(&self) -> &[u8]
    {
        &self.global_data
    }

    /// Store `value` as the global described by `desc`.
    ///
    /// ## Errors
    ///
    /// - `InvalidModule`: `value` does not match the global's type, or the
    ///   global is a constant
    /// - `CorruptCode`: the global's slot lies outside the global data
    pub fn write_global(&mut self, desc: &GlobalDesc, value: Val) -> Result<()>
    {
        if value.ty() != desc.ty {
            return Err(TraplineError::InvalidModule(format!(
                "cannot store {} into a {} global",
                value.ty(),
                desc.ty
            )));
        }
        let GlobalKind::Variable { offset, indirect } = desc.kind else {
            return Err(TraplineError::InvalidModule("constant globals cannot be written".into()));
        };
        let bytes = value_bytes(value);
        if indirect {
            let cell = read_cell_index(&self.global_data, offset)?;
            let cell = self
                .cells
                .get_mut(cell)
                .ok_or_else(|| TraplineError::CorruptCode(format!("global cell {cell} does not exist")))?;
            cell[..bytes.len()].copy_from_slice(&bytes);
            Ok(())
        } else {
            write_slot(&mut self.global_data, offset, &bytes)
        }
    }

    /// Read the global described by `desc`.
    ///
    /// ## Errors
    ///
    /// - `CorruptCode`: the slot or cell lies outside the instance's storage
    /// - `InvalidModule`: the global's type has no scalar representation
    pub fn read_global(&self, desc: &GlobalDesc) -> Result<Val>
    {
        let (bytes, what) = match desc.kind {
            GlobalKind::Constant(value) => return Ok(value),
            GlobalKind::Variable { offset, indirect: false } => (read_slot(&self.global_data, offset, desc.ty.size())?, "global"),
            GlobalKind::Variable { offset, indirect: true } => {
                let cell = read_cell_index(&self.global_data, offset)?;
                let cell = self
                    .cells
                    .get(cell)
                    .ok_or_else(|| TraplineError::CorruptCode(format!("global cell {cell} does not exist")))?;
                let bytes = cell.get(..desc.ty.size()).ok_or_else(|| {
                    TraplineError::CorruptCode(format!("{} global does not fit a cell", desc.ty))
                })?;
                (bytes, "global cell")
            }
        };
        Val::from_le_bytes(desc.ty, bytes)
            .ok_or_else(|| TraplineError::InvalidModule(format!("{what} of type {} cannot be read as a scalar", desc.ty)))
    }

    /// Heap bytes owned by the instance's global storage.
    #[must_use]
    pub fn size_of_excluding_this(&self) -> usize
    {
        self.global_data.capacity() + self.cells.capacity() * GLOBAL_CELL_LEN
    }
}

fn value_bytes(value: Val) -> Vec<u8>
{
    match value {
        Val::I32(v) => v.to_le_bytes().to_vec(),
        Val::I64(v) => v.to_le_bytes().to_vec(),
        Val::F32(v) => v.to_le_bytes().to_vec(),
        Val::F64(v) => v.to_le_bytes().to_vec(),
    }
}

fn slot_range(data_len: usize, offset: u32, len: usize) -> Result<std::ops::Range<usize>>
{
    let start = offset as usize;
    start
        .checked_add(len)
        .filter(|&end| end <= data_len)
        .map(|end| start..end)
        .ok_or_else(|| {
            TraplineError::CorruptCode(format!(
                "global slot {offset:#x}+{len} lies outside {data_len} bytes of global data"
            ))
        })
}

fn read_slot(data: &[u8], offset: u32, len: usize) -> Result<&[u8]>
{
    Ok(&data[slot_range(data.len(), offset, len)?])
}

fn write_slot(data: &mut [u8], offset: u32, bytes: &[u8]) -> Result<()>
{
    let range = slot_range(data.len(), offset, bytes.len())?;
    data[range].copy_from_slice(bytes);
    Ok(())
}

fn read_cell_index(data: &[u8], offset: u32) -> Result<usize>
{
    let raw = read_slot(data, offset, CELL_INDEX_LEN)?;
    let index = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Ok(index as usize)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::ValType;

    fn variable(ty: ValType, offset: u32, indirect: bool) -> GlobalDesc
    {
        GlobalDesc {
            ty,
            mutable: true,
            kind: GlobalKind::Variable { offset, indirect },
        }
    }

    #[test]
    fn test_inline_global_round_trips()
    {
        let desc = variable(ValType::I64, 8, false);
        let mut instance = Instance::new(InstanceId(1), &[desc]).unwrap();
        assert_eq!(instance.global_data().len(), 16);
        instance.write_global(&desc, Val::I64(-5)).unwrap();
        assert_eq!(instance.read_global(&desc).unwrap(), Val::I64(-5));
    }

    #[test]
    fn test_indirect_globals_get_separate_cells()
    {
        let first = variable(ValType::F64, 0, true);
        let second = variable(ValType::I32, 4, true);
        let mut instance = Instance::new(InstanceId(1), &[first, second]).unwrap();
        instance.write_global(&first, Val::F64(2.5)).unwrap();
        instance.write_global(&second, Val::I32(9)).unwrap();
        assert_eq!(instance.read_global(&first).unwrap(), Val::F64(2.5));
        assert_eq!(instance.read_global(&second).unwrap(), Val::I32(9));
        assert_eq!(instance.cells.len(), 2);
    }

    #[test]
    fn test_constant_global_is_read_without_storage()
    {
        let desc = GlobalDesc {
            ty: ValType::I32,
            mutable: false,
            kind: GlobalKind::Constant(Val::I32(7)),
        };
        let instance = Instance::new(InstanceId(1), &[desc]).unwrap();
        assert!(instance.global_data().is_empty());
        assert_eq!(instance.read_global(&desc).unwrap(), Val::I32(7));
    }

    #[test]
    fn test_slot_outside_global_data_is_corrupt()
    {
        let instance = Instance::new(InstanceId(1), &[variable(ValType::I32, 0, false)]).unwrap();
        let desc = variable(ValType::I64, 0, false);
        assert!(matches!(instance.read_global(&desc), Err(TraplineError::CorruptCode(_))));
    }

    #[test]
    fn test_overlapping_globals_are_rejected()
    {
        let result = Instance::new(
            InstanceId(1),
            &[variable(ValType::I64, 0, false), variable(ValType::I32, 4, false)],
        );
        assert!(matches!(result, Err(TraplineError::InvalidModule(_))));
    }

    #[test]
    fn test_type_mismatch_is_rejected()
    {
        let desc = variable(ValType::I32, 0, false);
        let mut instance = Instance::new(InstanceId(1), &[desc]).unwrap();
        assert!(instance.write_global(&desc, Val::F32(1.0)).is_err());
    }
}
