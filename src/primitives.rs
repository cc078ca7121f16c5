//! Little-endian field readers and the small arithmetic the on-flash formats lean on.

use crate::error::{FmmtError, Result};

/// Value a 3-byte size field holds when the real size lives in an extended field.
pub const SIZE_SENTINEL: u32 = 0x00FF_FFFF;

/// Decodes a 3-byte little-endian length.
pub fn read_u24(bytes: &[u8; 3]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 8-bit wrapping sum of `bytes`.
pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// 16-bit wrapping sum over little-endian words; a trailing odd byte is ignored.
pub fn sum16(bytes: &[u8]) -> u16 {
    bytes
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
}

/// Borrows `len` bytes at `offset`, or reports what was being read.
pub fn slice_at<'a>(bytes: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| {
            FmmtError::Aborted(format!(
                "{} at offset {:#x} (+{:#x}) runs past the end of a {:#x}-byte buffer",
                what,
                offset,
                len,
                bytes.len()
            ))
        })
}

pub fn le_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let b = slice_at(bytes, offset, 2, "u16 field")?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn le_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let b = slice_at(bytes, offset, 4, "u32 field")?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn le_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let b = slice_at(bytes, offset, 8, "u64 field")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}
