//! # Device Model and Volume Scanner
//!
//! A device is the flat blob read from disk. Scanning slides over it looking for the `_FVH`
//! signature; a hit only counts as a volume when the file-system GUID next to it is one of
//! the two known ones and the declared length stays inside the blob. Everything else is
//! treated as a coincidental match and the cursor moves on by one byte.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{FmmtError, Result};
use crate::guid::{self, Guid};
use crate::primitives::le_u64;
use crate::tree::{NodeId, Tree};
use crate::volume::{
    FvExtHeader, FvHeader, FILE_SYSTEM_GUID_OFFSET, HEADER_SIZE, LENGTH_OFFSET, SIGNATURE,
    SIGNATURE_OFFSET,
};

/// Capacity of one volume's attribute table, nested volumes included.
pub const MAX_FILES_PER_VOLUME: usize = 1000;

/// What decomposition learned about one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    pub name: Guid,
    pub file_type: u8,
    /// Where the materialized copy was written (extraction mode only).
    pub leaf_path: Option<PathBuf>,
    /// Decoded user-interface section, if the file has one.
    pub ui_name: Option<String>,
    /// Depth of the file node in the decomposition tree.
    pub level: u8,
    pub is_leaf: bool,
    /// Leaf sections recorded against the file.
    pub section_count: usize,
    pub has_depex: bool,
    pub version: Option<u16>,
    pub freeform_guid: Option<Guid>,
    /// The volume node the file sits in.
    pub owner: NodeId,
}

impl FileAttributes {
    pub fn new(name: Guid, file_type: u8, level: u8, owner: NodeId) -> Self {
        FileAttributes {
            name,
            file_type,
            leaf_path: None,
            ui_name: None,
            level,
            is_leaf: false,
            section_count: 0,
            has_depex: false,
            version: None,
            freeform_guid: None,
            owner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    /// Byte offset of the header inside the device.
    pub offset: usize,
    /// Length declared in the header.
    pub length: usize,
    pub depth: u8,
    /// Filled in by decomposition.
    pub header: Option<FvHeader>,
    pub ext_header: Option<FvExtHeader>,
    pub tree: Tree,
    pub files: Vec<FileAttributes>,
    /// Number of leaf files written so far; also the next leaf sequence number.
    pub leaf_count: u32,
}

impl Volume {
    fn new(name: String, offset: usize, length: usize) -> Self {
        Volume {
            name,
            offset,
            length,
            depth: 0,
            header: None,
            ext_header: None,
            tree: Tree::new(),
            files: Vec::new(),
            leaf_count: 0,
        }
    }

    /// Drops anything a previous decomposition recorded.
    pub fn reset(&mut self) {
        self.header = None;
        self.ext_header = None;
        self.tree = Tree::new();
        self.files.clear();
        self.leaf_count = 0;
    }

    /// Adds a file record and returns its slot.
    pub fn push_file(&mut self, attributes: FileAttributes) -> Result<usize> {
        if self.files.len() >= MAX_FILES_PER_VOLUME {
            return Err(FmmtError::OutOfResources(format!(
                "volume {} holds more than {} files",
                self.name, MAX_FILES_PER_VOLUME
            )));
        }
        self.files.push(attributes);
        Ok(self.files.len() - 1)
    }

    /// Root node of the decomposition tree, once one exists.
    pub fn root(&self) -> Option<NodeId> {
        if self.tree.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub size: usize,
    image: Vec<u8>,
    pub volumes: Vec<Volume>,
}

impl Device {
    /// Reads `path` into memory and scans it.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| FmmtError::io(e, path))?;
        let expected = file
            .metadata()
            .map_err(|e| FmmtError::io(e, path))?
            .len();
        let mut image = Vec::new();
        let capacity = usize::try_from(expected)
            .map_err(|_| FmmtError::OutOfResources(format!("{} is too large", path.display())))?;
        image.try_reserve_exact(capacity).map_err(|_| {
            FmmtError::OutOfResources(format!("cannot buffer {} bytes", capacity))
        })?;
        file.read_to_end(&mut image)
            .map_err(|e| FmmtError::io(e, path))?;
        Self::from_bytes(image)
    }

    /// Reads a whole stream and scans it.
    pub fn scan<R: Read>(mut reader: R) -> Result<Self> {
        let mut image = Vec::new();
        reader.read_to_end(&mut image)?;
        Self::from_bytes(image)
    }

    pub fn from_bytes(image: Vec<u8>) -> Result<Self> {
        if image.is_empty() {
            return Err(FmmtError::Aborted("input image is empty".into()));
        }
        let volumes = find_volumes(&image)
            .into_iter()
            .enumerate()
            .map(|(i, (offset, length))| Volume::new(format!("FV{}", i), offset, length))
            .collect::<Vec<_>>();
        info!(size = image.len(), volumes = volumes.len(), "scanned device");
        Ok(Device {
            size: image.len(),
            image,
            volumes,
        })
    }

    /// The image bytes of volume `index` together with its mutable record.
    pub fn volume_parts_mut(&mut self, index: usize) -> Result<(&[u8], &mut Volume)> {
        let v = self
            .volumes
            .get_mut(index)
            .ok_or_else(|| FmmtError::NotFound(format!("volume #{}", index)))?;
        let bytes = &self.image[v.offset..v.offset + v.length];
        Ok((bytes, v))
    }

    pub fn volume_index(&self, name: &str) -> Result<usize> {
        self.volumes
            .iter()
            .position(|v| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| FmmtError::NotFound(format!("no volume named {}", name)))
    }

    pub fn volume(&self, name: &str) -> Result<&Volume> {
        Ok(&self.volumes[self.volume_index(name)?])
    }

    /// A copy of the device with volume `index` replaced by `rebuilt`.
    pub fn splice_volume(&self, index: usize, rebuilt: &[u8]) -> Result<Vec<u8>> {
        let v = self
            .volumes
            .get(index)
            .ok_or_else(|| FmmtError::NotFound(format!("volume #{}", index)))?;
        if rebuilt.len() != v.length {
            return Err(FmmtError::InvalidParameter(format!(
                "rebuilt {} is {:#x} bytes, the original is {:#x}",
                v.name,
                rebuilt.len(),
                v.length
            )));
        }
        let mut out = self.image.clone();
        out[v.offset..v.offset + v.length].copy_from_slice(rebuilt);
        Ok(out)
    }
}

/// Offsets and lengths of every well-formed volume header in `image`, in order.
pub fn find_volumes(image: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut cursor = 0usize;
    while cursor + HEADER_SIZE <= image.len() {
        match accept_volume(image, cursor) {
            Some(length) => {
                debug!(offset = cursor, length, "found volume");
                found.push((cursor, length));
                cursor += length;
            }
            None => cursor += 1,
        }
    }
    found
}

fn accept_volume(image: &[u8], offset: usize) -> Option<usize> {
    let window = &image[offset..];
    if &window[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4] != SIGNATURE {
        return None;
    }
    let fs = Guid::from_slice(&window[FILE_SYSTEM_GUID_OFFSET..])?;
    if fs != guid::FFS2 && fs != guid::FFS3 {
        debug!(offset, "signature with unknown file system GUID, skipping");
        return None;
    }
    let length = usize::try_from(le_u64(window, LENGTH_OFFSET).ok()?).ok()?;
    if length < HEADER_SIZE || length > window.len() {
        debug!(offset, length, "signature with out-of-range length, skipping");
        return None;
    }
    Some(length)
}
