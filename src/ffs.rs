//! Firmware file headers and the walk over the files of one volume.

use serde::Serialize;

use crate::error::{FmmtError, Result};
use crate::guid::Guid;
use crate::primitives::{align_up, le_u64, read_u24, slice_at, SIZE_SENTINEL};
use crate::volume::FvHeader;

pub const HEADER_SIZE: usize = 24;
pub const LARGE_HEADER_SIZE: usize = 32;

pub const ATTRIB_LARGE_FILE: u8 = 0x01;
pub const ATTRIB_FIXED: u8 = 0x04;
pub const ATTRIB_CHECKSUM: u8 = 0x40;

/// Stored in the file checksum byte when the body is not checksummed.
pub const FIXED_CHECKSUM: u8 = 0xAA;

pub const STATE_HEADER_CONSTRUCTION: u8 = 0x01;
pub const STATE_HEADER_VALID: u8 = 0x02;
pub const STATE_DATA_VALID: u8 = 0x04;
pub const STATE_MARKED_FOR_UPDATE: u8 = 0x08;
pub const STATE_DELETED: u8 = 0x10;
pub const STATE_HEADER_INVALID: u8 = 0x20;

pub const TYPE_ALL: u8 = 0x00;
pub const TYPE_RAW: u8 = 0x01;
pub const TYPE_FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
pub const TYPE_FFS_PAD: u8 = 0xF0;

const TYPE_NAMES: [&str; 14] = [
    "EFI_FV_FILETYPE_ALL",
    "EFI_FV_FILETYPE_RAW",
    "EFI_FV_FILETYPE_FREEFORM",
    "EFI_FV_FILETYPE_SECURITY_CORE",
    "EFI_FV_FILETYPE_PEI_CORE",
    "EFI_FV_FILETYPE_DXE_CORE",
    "EFI_FV_FILETYPE_PEIM",
    "EFI_FV_FILETYPE_DRIVER",
    "EFI_FV_FILETYPE_COMBINED_PEIM_DRIVER",
    "EFI_FV_FILETYPE_APPLICATION",
    "EFI_FV_FILETYPE_SMM",
    "EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE",
    "EFI_FV_FILETYPE_COMBINED_SMM_DXE",
    "EFI_FV_FILETYPE_SMM_CORE",
];

/// Name GenFfs uses for a file type, if it has one.
pub fn file_type_name(file_type: u8) -> Option<&'static str> {
    match file_type {
        TYPE_FFS_PAD => Some("EFI_FV_FILETYPE_FFS_PAD"),
        t => TYPE_NAMES.get(usize::from(t)).copied(),
    }
}

/// A copy of a file header. `size` is the whole file, header included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub name: Guid,
    pub header_checksum: u8,
    pub file_checksum: u8,
    pub file_type: u8,
    pub attributes: u8,
    pub state: u8,
    pub size: u64,
    pub header_size: usize,
}

impl FileHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = slice_at(bytes, 0, HEADER_SIZE, "file header")?;
        let attributes = raw[19];
        let short = read_u24(&[raw[20], raw[21], raw[22]]);
        // The attribute bit alone selects the extended field, as GenFfs writes it; a bare
        // sentinel is read the same way.
        let (size, header_size) = if attributes & ATTRIB_LARGE_FILE != 0 || short == SIZE_SENTINEL
        {
            (le_u64(bytes, HEADER_SIZE)?, LARGE_HEADER_SIZE)
        } else {
            (u64::from(short), HEADER_SIZE)
        };
        Ok(FileHeader {
            name: Guid::from_slice(raw).unwrap_or(Guid::ZERO),
            header_checksum: raw[16],
            file_checksum: raw[17],
            file_type: raw[18],
            attributes,
            state: raw[23],
            size,
            header_size,
        })
    }

    pub fn is_large(&self) -> bool {
        self.header_size == LARGE_HEADER_SIZE
    }

    pub fn type_name(&self) -> Option<&'static str> {
        file_type_name(self.file_type)
    }
}

/// Tests one state bit the way the volume's erase polarity says to read it.
pub fn state_bit(erase_polarity: bool, state: u8, bit: u8) -> bool {
    let state = if erase_polarity { !state } else { state };
    state & bit == bit
}

/// The file state is the highest bit set once polarity is applied; 0 when none is.
pub fn file_state(erase_polarity: bool, state: u8) -> u8 {
    let state = if erase_polarity { !state } else { state };
    match state {
        0 => 0,
        s => 0x80 >> s.leading_zeros(),
    }
}

/// One data-valid file found by [`FileIter`].
#[derive(Debug, Clone, Copy)]
pub struct FoundFile<'a> {
    /// Offset of the header from the start of the volume.
    pub offset: usize,
    /// Header and body, exactly `size` bytes.
    pub bytes: &'a [u8],
}

/// Walks the data-valid files of one volume image.
///
/// The cursor starts at the header length and every candidate is 8-byte aligned. The walk
/// ends once no header can fit before the end of the volume.
pub struct FileIter<'a> {
    volume: &'a [u8],
    volume_size: usize,
    erase_polarity: bool,
    key: usize,
}

impl<'a> FileIter<'a> {
    pub fn new(volume: &'a [u8], header: &FvHeader) -> Result<Self> {
        let volume_size = usize::try_from(header.size()?)
            .map_err(|_| FmmtError::VolumeCorrupted("volume size overflows".into()))?;
        if volume_size > volume.len() {
            return Err(FmmtError::VolumeCorrupted(format!(
                "block map claims {:#x} bytes but only {:#x} are present",
                volume_size,
                volume.len()
            )));
        }
        Ok(FileIter {
            volume,
            volume_size,
            erase_polarity: header.erase_polarity(),
            key: usize::from(header.header_length),
        })
    }

    fn next_file(&mut self) -> Result<Option<FoundFile<'a>>> {
        let polarity = self.erase_polarity;
        loop {
            self.key = align_up(self.key, 8);
            match self.key.checked_add(HEADER_SIZE) {
                Some(end) if end < self.volume_size => {}
                _ => return Ok(None),
            }
            let key = self.key;
            let window = &self.volume[key..self.volume_size];
            let state = window[23];

            if !state_bit(polarity, state, STATE_HEADER_VALID)
                || state_bit(polarity, state, STATE_HEADER_INVALID)
            {
                self.key += 1;
                continue;
            }

            let header = FileHeader::parse(window)?;
            let size = usize::try_from(header.size).unwrap_or(usize::MAX);

            if state_bit(polarity, state, STATE_MARKED_FOR_UPDATE)
                || state_bit(polarity, state, STATE_DELETED)
            {
                // A skipped length past the volume end leaves nothing more to walk.
                match key.checked_add(size.max(1)) {
                    Some(next) if next < self.volume_size => self.key = next,
                    _ => return Ok(None),
                }
                continue;
            }

            if state_bit(polarity, state, STATE_DATA_VALID) {
                if size < header.header_size || size > window.len() {
                    return Err(FmmtError::Aborted(format!(
                        "file {} at {:#x} declares {:#x} bytes, volume has {:#x} left",
                        header.name,
                        key,
                        header.size,
                        window.len()
                    )));
                }
                self.key = key + size;
                return Ok(Some(FoundFile {
                    offset: key,
                    bytes: &window[..size],
                }));
            }

            self.key += 1;
        }
    }
}

impl<'a> Iterator for FileIter<'a> {
    type Item = Result<FoundFile<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_file().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_respects_polarity() {
        // Polarity 1: bits are cleared to set them.
        let state = !(STATE_HEADER_CONSTRUCTION | STATE_HEADER_VALID | STATE_DATA_VALID);
        assert!(state_bit(true, state, STATE_DATA_VALID));
        assert!(!state_bit(true, state, STATE_DELETED));
        assert_eq!(file_state(true, state), STATE_DATA_VALID);
        assert_eq!(file_state(false, 0x07), STATE_DATA_VALID);
        assert_eq!(file_state(false, 0x00), 0);
    }

    #[test]
    fn large_attribute_selects_extended_size() {
        let mut h = vec![0u8; LARGE_HEADER_SIZE];
        h[19] = ATTRIB_LARGE_FILE;
        h[24..32].copy_from_slice(&0x0100_0000u64.to_le_bytes());
        let parsed = FileHeader::parse(&h).unwrap();
        assert!(parsed.is_large());
        assert_eq!(parsed.size, 0x0100_0000);
    }

    #[test]
    fn sentinel_size_selects_extended_size_without_attribute() {
        let mut h = vec![0u8; LARGE_HEADER_SIZE];
        h[20..23].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        h[24..32].copy_from_slice(&0x40u64.to_le_bytes());
        let parsed = FileHeader::parse(&h).unwrap();
        assert!(parsed.is_large());
        assert_eq!(parsed.size, 0x40);

        h[20..23].copy_from_slice(&[0x40, 0, 0]);
        let parsed = FileHeader::parse(&h).unwrap();
        assert!(!parsed.is_large());
        assert_eq!(parsed.size, 0x40);
    }

    #[test]
    fn type_names_match_genffs() {
        assert_eq!(file_type_name(TYPE_RAW), Some("EFI_FV_FILETYPE_RAW"));
        assert_eq!(
            file_type_name(TYPE_FIRMWARE_VOLUME_IMAGE),
            Some("EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE")
        );
        assert_eq!(file_type_name(0x42), None);
    }
}
