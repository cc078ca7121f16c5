//! Common section header and the headers of the encapsulating section kinds.
//!
//! All headers are byte-packed. A section whose 3-byte size is `0xFFFFFF` carries its real
//! size in a `u32` right after the type byte, which pushes every following field 4 bytes on.

use crate::error::{FmmtError, Result};
use crate::guid::Guid;
use crate::primitives::{le_u16, le_u32, read_u24, slice_at, SIZE_SENTINEL};

pub const COMMON_HEADER_SIZE: usize = 4;
pub const EXTENDED_HEADER_DELTA: usize = 4;

/// Common header + `u32` uncompressed length + `u8` compression type.
pub const COMPRESSION_HEADER_SIZE: usize = 9;
/// Common header + GUID + `u16` data offset + `u16` attributes.
pub const GUID_DEFINED_HEADER_SIZE: usize = 24;

/// Reserved type byte that, together with the size sentinel, marks 4 bytes of padding.
pub const PADDING_TYPE: u8 = 0xFF;

pub const COMPRESSION_NONE: u8 = 0x00;
pub const COMPRESSION_STANDARD: u8 = 0x01;

pub const GUIDED_PROCESSING_REQUIRED: u16 = 0x01;
pub const GUIDED_AUTH_STATUS_VALID: u16 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Compression,
    GuidDefined,
    Disposable,
    Pe32,
    Pic,
    Te,
    DxeDepex,
    Version,
    UserInterface,
    Compatibility16,
    FirmwareVolumeImage,
    FreeformSubtypeGuid,
    Raw,
    PeiDepex,
    SmmDepex,
    Unknown(u8),
}

impl SectionType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => SectionType::Compression,
            0x02 => SectionType::GuidDefined,
            0x03 => SectionType::Disposable,
            0x10 => SectionType::Pe32,
            0x11 => SectionType::Pic,
            0x12 => SectionType::Te,
            0x13 => SectionType::DxeDepex,
            0x14 => SectionType::Version,
            0x15 => SectionType::UserInterface,
            0x16 => SectionType::Compatibility16,
            0x17 => SectionType::FirmwareVolumeImage,
            0x18 => SectionType::FreeformSubtypeGuid,
            0x19 => SectionType::Raw,
            0x1B => SectionType::PeiDepex,
            0x1C => SectionType::SmmDepex,
            other => SectionType::Unknown(other),
        }
    }

    /// The `-s` argument GenSec understands for this kind.
    pub fn gensec_name(&self) -> Option<&'static str> {
        Some(match self {
            SectionType::Compression => "EFI_SECTION_COMPRESSION",
            SectionType::GuidDefined => "EFI_SECTION_GUID_DEFINED",
            SectionType::Pe32 => "EFI_SECTION_PE32",
            SectionType::Pic => "EFI_SECTION_PIC",
            SectionType::Te => "EFI_SECTION_TE",
            SectionType::DxeDepex => "EFI_SECTION_DXE_DEPEX",
            SectionType::Version => "EFI_SECTION_VERSION",
            SectionType::UserInterface => "EFI_SECTION_USER_INTERFACE",
            SectionType::Compatibility16 => "EFI_SECTION_COMPATIBILITY16",
            SectionType::FirmwareVolumeImage => "EFI_SECTION_FIRMWARE_VOLUME_IMAGE",
            SectionType::FreeformSubtypeGuid => "EFI_SECTION_FREEFORM_SUBTYPE_GUID",
            SectionType::Raw => "EFI_SECTION_RAW",
            SectionType::PeiDepex => "EFI_SECTION_PEI_DEPEX",
            SectionType::SmmDepex => "EFI_SECTION_SMM_DEPEX",
            SectionType::Disposable | SectionType::Unknown(_) => return None,
        })
    }
}

/// What the common header at the start of a buffer says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFrame {
    /// Four bytes of 0xFF filler.
    Padding,
    Section {
        kind: SectionType,
        /// Whole section including its header.
        length: usize,
        /// 0, or 4 when the extended size field is present.
        delta: usize,
    },
}

impl SectionFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = slice_at(bytes, 0, COMMON_HEADER_SIZE, "section header")
            .map_err(|e| FmmtError::SectionError(e.to_string()))?;
        let size = read_u24(&[raw[0], raw[1], raw[2]]);
        let type_byte = raw[3];
        if size == SIZE_SENTINEL && type_byte == PADDING_TYPE {
            return Ok(SectionFrame::Padding);
        }
        let (length, delta) = if size == SIZE_SENTINEL {
            let ext = le_u32(bytes, COMMON_HEADER_SIZE)
                .map_err(|e| FmmtError::SectionError(e.to_string()))?;
            (ext as usize, EXTENDED_HEADER_DELTA)
        } else {
            (size as usize, 0)
        };
        Ok(SectionFrame::Section {
            kind: SectionType::from_byte(type_byte),
            length,
            delta,
        })
    }
}

/// Size of the common header for a frame with `delta`.
pub fn header_len(delta: usize) -> usize {
    COMMON_HEADER_SIZE + delta
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHeader {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

impl CompressionHeader {
    pub fn parse(section: &[u8], delta: usize) -> Result<Self> {
        let base = delta;
        let raw = slice_at(section, base, COMPRESSION_HEADER_SIZE, "compression header")
            .map_err(|e| FmmtError::SectionError(e.to_string()))?;
        Ok(CompressionHeader {
            uncompressed_length: le_u32(raw, 4)?,
            compression_type: raw[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidDefinedHeader {
    pub guid: Guid,
    /// Offset of the payload from the start of the section.
    pub data_offset: u16,
    pub attributes: u16,
}

impl GuidDefinedHeader {
    pub fn parse(section: &[u8], delta: usize) -> Result<Self> {
        let raw = slice_at(section, delta, GUID_DEFINED_HEADER_SIZE, "GUID-defined header")
            .map_err(|e| FmmtError::SectionError(e.to_string()))?;
        Ok(GuidDefinedHeader {
            guid: Guid::from_slice(&raw[4..]).unwrap_or(Guid::ZERO),
            data_offset: le_u16(raw, 20)?,
            attributes: le_u16(raw, 22)?,
        })
    }
}

/// Decodes the UTF-16LE name of a user-interface section body, stopping at the first NUL.
pub fn decode_ui_name(body: &[u8]) -> String {
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
