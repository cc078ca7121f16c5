//! # Firmware Volume Header
//!
//! ```text
//! offset  size  field
//! 0x00    16    zero vector
//! 0x10    16    file system GUID (FFS2 or FFS3)
//! 0x20     8    volume length
//! 0x28     4    signature "_FVH"
//! 0x2C     4    attributes
//! 0x30     2    header length
//! 0x32     2    header checksum
//! 0x34     2    extended header offset (0 = none)
//! 0x36     1    reserved
//! 0x37     1    revision
//! 0x38     8*n  block map {num_blocks u32, length u32}, terminated by {0, 0}
//! ```
//!
//! The extended header, when present, starts with the volume name GUID followed by its own
//! `u32` size.

use serde::Serialize;
use tracing::warn;

use crate::error::{FmmtError, Result};
use crate::guid::{self, Guid};
use crate::primitives::{le_u16, le_u32, le_u64, slice_at, sum16};

pub const SIGNATURE: &[u8; 4] = b"_FVH";
pub const SIGNATURE_OFFSET: usize = 0x28;
pub const FILE_SYSTEM_GUID_OFFSET: usize = 0x10;
pub const LENGTH_OFFSET: usize = 0x20;
const BLOCK_MAP_OFFSET: usize = 0x38;

/// Fixed part of the header plus one block-map entry.
pub const HEADER_SIZE: usize = 0x40;

/// Block-map sums at or above this are treated as garbage.
pub const MAX_VOLUME_SIZE: u64 = 0x4000_0000;

pub const ERASE_POLARITY: u32 = 0x0000_0800;
const ALIGNMENT_SHIFT: u32 = 16;
const ALIGNMENT_MASK: u32 = 0x001F_0000;

/// Capability and status bits in the order GenFv expects to see them.
const ATTRIBUTE_NAMES: &[(u32, &str)] = &[
    (0x0000_0001, "EFI_READ_DISABLED_CAP"),
    (0x0000_0002, "EFI_READ_ENABLED_CAP"),
    (0x0000_0004, "EFI_READ_STATUS"),
    (0x0000_0008, "EFI_WRITE_DISABLED_CAP"),
    (0x0000_0010, "EFI_WRITE_ENABLED_CAP"),
    (0x0000_0020, "EFI_WRITE_STATUS"),
    (0x0000_0040, "EFI_LOCK_CAP"),
    (0x0000_0080, "EFI_LOCK_STATUS"),
    (0x0000_0200, "EFI_STICKY_WRITE"),
    (0x0000_0400, "EFI_MEMORY_MAPPED"),
    (0x0000_1000, "EFI_READ_LOCK_CAP"),
    (0x0000_2000, "EFI_READ_LOCK_STATUS"),
    (0x0000_4000, "EFI_WRITE_LOCK_CAP"),
    (0x0000_8000, "EFI_WRITE_LOCK_STATUS"),
];

const ALIGNMENT_NAMES: [&str; 32] = [
    "1", "2", "4", "8", "16", "32", "64", "128", "256", "512", "1K", "2K", "4K", "8K", "16K",
    "32K", "64K", "128K", "256K", "512K", "1M", "2M", "4M", "8M", "16M", "32M", "64M", "128M",
    "256M", "512M", "1G", "2G",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

/// A parsed copy of a volume header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FvHeader {
    pub file_system: Guid,
    pub length: u64,
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub revision: u8,
    /// Entries before the `{0, 0}` terminator.
    pub block_map: Vec<BlockMapEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FvExtHeader {
    pub name: Guid,
    pub size: u32,
}

impl FvHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(FmmtError::VolumeCorrupted(format!(
                "{} bytes cannot hold a volume header",
                bytes.len()
            )));
        }
        if &bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4] != SIGNATURE {
            return Err(FmmtError::VolumeCorrupted("missing _FVH signature".into()));
        }

        let mut block_map = Vec::new();
        let mut offset = BLOCK_MAP_OFFSET;
        loop {
            let num_blocks = le_u32(bytes, offset)
                .map_err(|_| FmmtError::VolumeCorrupted("unterminated block map".into()))?;
            let length = le_u32(bytes, offset + 4)
                .map_err(|_| FmmtError::VolumeCorrupted("unterminated block map".into()))?;
            if num_blocks == 0 && length == 0 {
                break;
            }
            block_map.push(BlockMapEntry { num_blocks, length });
            offset += 8;
        }

        Ok(FvHeader {
            file_system: Guid::from_slice(&bytes[FILE_SYSTEM_GUID_OFFSET..])
                .unwrap_or(Guid::ZERO),
            length: le_u64(bytes, LENGTH_OFFSET)?,
            attributes: le_u32(bytes, 0x2C)?,
            header_length: le_u16(bytes, 0x30)?,
            checksum: le_u16(bytes, 0x32)?,
            ext_header_offset: le_u16(bytes, 0x34)?,
            revision: bytes[0x37],
            block_map,
        })
    }

    pub fn erase_polarity(&self) -> bool {
        self.attributes & ERASE_POLARITY != 0
    }

    pub fn is_known_file_system(&self) -> bool {
        self.file_system == guid::FFS2 || self.file_system == guid::FFS3
    }

    /// Σ(num_blocks × length) over the block map.
    pub fn size(&self) -> Result<u64> {
        let mut size: u64 = 0;
        for entry in &self.block_map {
            size += u64::from(entry.num_blocks) * u64::from(entry.length);
            if size >= MAX_VOLUME_SIZE {
                return Err(FmmtError::VolumeCorrupted(format!(
                    "block map sums to {:#x}, over the 1 GiB limit",
                    size
                )));
            }
        }
        if size == 0 {
            return Err(FmmtError::VolumeCorrupted("block map sums to zero".into()));
        }
        Ok(size)
    }

    /// Reads the extended header the header points at, if any.
    pub fn ext_header(&self, bytes: &[u8]) -> Result<Option<FvExtHeader>> {
        if self.ext_header_offset == 0 {
            return Ok(None);
        }
        let offset = usize::from(self.ext_header_offset);
        let raw = slice_at(bytes, offset, 20, "volume extended header")?;
        Ok(Some(FvExtHeader {
            name: Guid::from_slice(raw).unwrap_or(Guid::ZERO),
            size: le_u32(raw, 16)?,
        }))
    }

    /// True when the 16-bit sum over the header is zero.
    pub fn checksum_ok(&self, bytes: &[u8]) -> bool {
        bytes
            .get(..usize::from(self.header_length))
            .map(|h| sum16(h) == 0)
            .unwrap_or(false)
    }

    /// The first block-map entry, which GenFv takes as the block geometry.
    pub fn primary_block(&self) -> Option<BlockMapEntry> {
        self.block_map.first().copied()
    }
}

/// Sizes the volume at the start of `bytes` from its block map.
pub fn volume_size(bytes: &[u8]) -> Result<u64> {
    FvHeader::parse(bytes)?.size()
}

/// The `[attributes]` lines GenFv needs to reproduce `attributes`.
pub fn attribute_lines(attributes: u32) -> Vec<String> {
    let mut lines: Vec<String> = ATTRIBUTE_NAMES
        .iter()
        .filter(|(bit, _)| attributes & bit != 0)
        .map(|(_, name)| format!("{} = TRUE", name))
        .collect();
    if attributes & ERASE_POLARITY != 0 {
        lines.push("EFI_ERASE_POLARITY = 1".to_string());
    }
    let align = ((attributes & ALIGNMENT_MASK) >> ALIGNMENT_SHIFT) as usize;
    lines.push(format!("EFI_FVB2_ALIGNMENT_{} = TRUE", ALIGNMENT_NAMES[align]));
    lines
}

/// Logs (without failing) when a header does not checksum to zero.
pub(crate) fn warn_on_bad_checksum(name: &str, header: &FvHeader, bytes: &[u8]) {
    if !header.checksum_ok(bytes) {
        warn!(volume = name, "volume header checksum does not sum to zero");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_map(map: &[(u32, u32)]) -> Vec<u8> {
        let mut h = vec![0u8; BLOCK_MAP_OFFSET];
        h[FILE_SYSTEM_GUID_OFFSET..FILE_SYSTEM_GUID_OFFSET + 16].copy_from_slice(&guid::FFS2.0);
        h[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4].copy_from_slice(SIGNATURE);
        h[0x2C..0x30].copy_from_slice(&(ERASE_POLARITY | 0x0003_0000).to_le_bytes());
        for (n, len) in map {
            h.extend_from_slice(&n.to_le_bytes());
            h.extend_from_slice(&len.to_le_bytes());
        }
        h.extend_from_slice(&[0u8; 8]);
        let hlen = h.len() as u16;
        h[0x30..0x32].copy_from_slice(&hlen.to_le_bytes());
        h
    }

    #[test]
    fn size_is_sum_of_block_map() {
        let h = header_with_map(&[(4, 0x1000), (2, 0x200)]);
        assert_eq!(volume_size(&h).unwrap(), 4 * 0x1000 + 2 * 0x200);
    }

    #[test]
    fn empty_or_huge_block_maps_are_corrupt() {
        let empty = header_with_map(&[]);
        let mut padded = empty.clone();
        padded.resize(HEADER_SIZE, 0);
        assert!(matches!(
            volume_size(&padded),
            Err(FmmtError::VolumeCorrupted(_))
        ));

        let huge = header_with_map(&[(0x4000, 0x10000)]);
        assert!(matches!(volume_size(&huge), Err(FmmtError::VolumeCorrupted(_))));
    }

    #[test]
    fn unterminated_block_map_is_corrupt() {
        let mut h = header_with_map(&[(1, 0x1000)]);
        h.truncate(h.len() - 8);
        h.extend_from_slice(&[1, 0, 0, 0]);
        assert!(FvHeader::parse(&h).is_err());
    }

    #[test]
    fn attribute_lines_cover_polarity_and_alignment() {
        let lines = attribute_lines(0x0003_0802);
        assert!(lines.contains(&"EFI_READ_ENABLED_CAP = TRUE".to_string()));
        assert!(lines.contains(&"EFI_ERASE_POLARITY = 1".to_string()));
        assert_eq!(lines.last().unwrap(), "EFI_FVB2_ALIGNMENT_8 = TRUE");
    }
}
