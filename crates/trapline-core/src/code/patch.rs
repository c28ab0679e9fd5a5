//! # Trap Slot Patching
//!
//! Encoding of the patchable trap slots in Debug-tier code, and the scoped
//! writable-code guard every patch goes through.
//!
//! A trap slot is five bytes ending at a call site's return address. Disarmed,
//! it holds a five-byte NOP; armed, it holds a relative CALL to the nearest
//! far-jump island, which in turn jumps to the shared debug-trap handler.

use crate::error::{Result, TraplineError};

/// Length of a patchable trap slot.
pub const TRAP_SLOT_LEN: usize = 5;

/// Five-byte NOP (`nop dword [rax + rax*1 + 0]`).
pub const NOP5: [u8; TRAP_SLOT_LEN] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

/// `call rel32` opcode.
pub const CALL_REL32: u8 = 0xe8;

/// `jmp rel32` opcode, used by far-jump islands.
pub const JMP_REL32: u8 = 0xe9;

/// Length of a far-jump island.
pub const FAR_JUMP_LEN: usize = 5;

/// Byte range of the slot ending at `return_address`, checked against the segment.
fn slot_range(segment_len: usize, return_address: usize) -> Result<std::ops::Range<usize>>
{
    let start = return_address
        .checked_sub(TRAP_SLOT_LEN)
        .filter(|_| return_address <= segment_len)
        .ok_or_else(|| {
            TraplineError::CorruptCode(format!(
                "trap slot ending at {return_address:#x} lies outside a {segment_len}-byte segment"
            ))
        })?;
    Ok(start..return_address)
}

/// Displacement of a rel32 branch whose next instruction is at `next` and whose target is `target`.
pub(crate) fn rel32(next: usize, target: usize) -> Result<i32>
{
    let next = i64::try_from(next).map_err(|_| TraplineError::CorruptCode("branch origin overflows".into()))?;
    let target = i64::try_from(target).map_err(|_| TraplineError::CorruptCode("branch target overflows".into()))?;
    i32::try_from(target - next).map_err(|_| TraplineError::CorruptCode(format!("branch displacement {} out of range", target - next)))
}

/// Scoped write access to one tier's machine code.
///
/// The segment is flagged writable for the lifetime of the guard. Dropping a
/// guard that patched anything counts one instruction-cache flush.
pub struct WritableCode<'a>
{
    segment: &'a mut [u8],
    writable: &'a mut bool,
    flushes: &'a mut u64,
    dirty: bool,
}

impl<'a> WritableCode<'a>
{
    pub(crate) fn new(segment: &'a mut [u8], writable: &'a mut bool, flushes: &'a mut u64) -> Self
    {
        *writable = true;
        Self {
            segment,
            writable,
            flushes,
            dirty: false,
        }
    }

    /// Arm the slot ending at `return_address` with a call to `target`.
    pub fn patch_nop_to_call(&mut self, return_address: usize, target: usize) -> Result<()>
    {
        let range = slot_range(self.segment.len(), return_address)?;
        let disp = rel32(return_address, target)?;
        let slot = &mut self.segment[range];
        slot[0] = CALL_REL32;
        slot[1..].copy_from_slice(&disp.to_le_bytes());
        self.dirty = true;
        Ok(())
    }

    /// Disarm the slot ending at `return_address`.
    pub fn patch_call_to_nop(&mut self, return_address: usize) -> Result<()>
    {
        let range = slot_range(self.segment.len(), return_address)?;
        self.segment[range].copy_from_slice(&NOP5);
        self.dirty = true;
        Ok(())
    }
}

impl Drop for WritableCode<'_>
{
    fn drop(&mut self)
    {
        *self.writable = false;
        if self.dirty {
            *self.flushes = self.flushes.saturating_add(1);
            tracing::trace!("flushed instruction cache after patching");
        }
    }
}

/// True if the slot ending at `return_address` currently holds a call.
#[must_use]
pub fn is_call_slot(segment: &[u8], return_address: usize) -> bool
{
    return_address
        .checked_sub(TRAP_SLOT_LEN)
        .and_then(|start| segment.get(start))
        .is_some_and(|&op| op == CALL_REL32)
}

/// Pick the far-jump island closest to `return_address`.
///
/// `islands` must be sorted ascending.
#[must_use]
pub fn nearest_far_jump(islands: &[u32], return_address: u32) -> Option<u32>
{
    let idx = islands.partition_point(|&island| island < return_address);
    let after = islands.get(idx).copied();
    let before = idx.checked_sub(1).and_then(|i| islands.get(i)).copied();
    match (before, after) {
        (Some(b), Some(a)) => Some(if return_address - b <= a - return_address { b } else { a }),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}
