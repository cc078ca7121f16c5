//! Writes leaf files into the extraction directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::device::Volume;
use crate::error::{FmmtError, Result};
use crate::ffs::HEADER_SIZE;

/// Offset of the state byte inside a file header.
const STATE_OFFSET: usize = HEADER_SIZE - 1;

/// `Num<seq>-<GUID>-Level<depth>`, unique within one volume's extraction.
pub fn leaf_file_name(seq: u32, volume: &Volume, slot: usize) -> String {
    let attrs = &volume.files[slot];
    format!("Num{}-{}-Level{}", seq, attrs.name.to_upper(), attrs.level)
}

/// Writes `file` (header and body, exactly its declared size) as the leaf for `slot`.
///
/// The written copy always carries the state byte as it reads with polarity 0.
pub fn materialize(
    volume: &mut Volume,
    slot: usize,
    file: &[u8],
    erase_polarity: bool,
    work_dir: &Path,
) -> Result<PathBuf> {
    if slot >= volume.files.len() {
        return Err(FmmtError::InvalidParameter(format!(
            "no attribute slot {} in {}",
            slot, volume.name
        )));
    }
    if volume.files[slot].leaf_path.is_some() {
        return Err(FmmtError::InvalidParameter(format!(
            "file {} was already materialized",
            volume.files[slot].name
        )));
    }

    let path = work_dir.join(leaf_file_name(volume.leaf_count, volume, slot));
    let mut copy = file.to_vec();
    if erase_polarity {
        if let Some(state) = copy.get_mut(STATE_OFFSET) {
            *state = !*state;
        }
    }
    fs::write(&path, &copy).map_err(|e| FmmtError::io(e, &path))?;
    debug!(path = %path.display(), bytes = copy.len(), "wrote leaf");

    volume.leaf_count += 1;
    let attrs = &mut volume.files[slot];
    attrs.leaf_path = Some(path.clone());
    attrs.is_leaf = true;
    Ok(path)
}
