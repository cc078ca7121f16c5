//! EFI GUIDs as they appear on flash: 16 bytes, with the first three fields little-endian.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::FmmtError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub [u8; 16]);

/// Firmware file system, revision 2.
pub const FFS2: Guid = Guid([
    0x78, 0xE5, 0x8C, 0x8C, 0x3D, 0x8A, 0x1C, 0x4F, 0x99, 0x35, 0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3,
]);

/// Firmware file system, revision 3.
pub const FFS3: Guid = Guid([
    0x7A, 0xC0, 0x73, 0x54, 0xCB, 0x3D, 0xCA, 0x4D, 0xBD, 0x6F, 0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A,
]);

/// `a31280ad-481e-41b6-95e8-127f4c984779`
pub const TIANO_COMPRESS: Guid = Guid::from_fields(
    0xa31280ad,
    0x481e,
    0x41b6,
    [0x95, 0xe8, 0x12, 0x7f, 0x4c, 0x98, 0x47, 0x79],
);

/// `ee4e5898-3914-4259-9d6e-dc7bd79403cf`
pub const LZMA_COMPRESS: Guid = Guid::from_fields(
    0xee4e5898,
    0x3914,
    0x4259,
    [0x9d, 0x6e, 0xdc, 0x7b, 0xd7, 0x94, 0x03, 0xcf],
);

/// `fc1bcdb0-7d31-49aa-936a-a4600d9dd083`, the CRC32 guided section.
pub const CRC32_SECTION: Guid = Guid::from_fields(
    0xfc1bcdb0,
    0x7d31,
    0x49aa,
    [0x93, 0x6a, 0xa4, 0x60, 0x0d, 0x9d, 0xd0, 0x83],
);

impl Guid {
    pub const ZERO: Guid = Guid([0; 16]);

    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let a = data1.to_le_bytes();
        let b = data2.to_le_bytes();
        let c = data3.to_le_bytes();
        Guid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], data4[0], data4[1], data4[2],
            data4[3], data4[4], data4[5], data4[6], data4[7],
        ])
    }

    /// Reads a GUID from the first 16 bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Guid(raw))
    }

    pub fn data1(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn data2(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    pub fn data3(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    pub fn data4(&self) -> &[u8] {
        &self.0[8..]
    }

    /// Upper-case form used in leaf file names and for `--FvNameGuid`.
    pub fn to_upper(&self) -> String {
        self.to_string().to_uppercase()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d4 = self.data4();
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1(),
            self.data2(),
            self.data3(),
            d4[0],
            d4[1],
            d4[2],
            d4[3],
            d4[4],
            d4[5],
            d4[6],
            d4[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

impl FromStr for Guid {
    type Err = FmmtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FmmtError::InvalidParameter(format!("malformed GUID '{}'", s));
        let parts: Vec<&str> = s.trim().split('-').collect();
        let widths = [8, 4, 4, 4, 12];
        if parts.len() != widths.len()
            || parts
                .iter()
                .zip(widths)
                .any(|(p, w)| p.len() != w || !p.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(bad());
        }

        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| bad())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| bad())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| bad())?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| bad())?;
        }
        Ok(Guid::from_fields(data1, data2, data3, data4))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
