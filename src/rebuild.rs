//! # Reconstruction
//!
//! Replays a volume's decomposition tree from the deepest level up to the root, turning each
//! node back into bytes with the EDK II encoder tools:
//!
//! | node               | step                                                        |
//! |--------------------|-------------------------------------------------------------|
//! | volume             | `GenFv` over a generated `.inf` listing the child files     |
//! | file               | leaf copy, or `GenFfs` around the rebuilt nested volume     |
//! | guided section     | `<tool> -e`, then `GenSec -s EFI_SECTION_GUID_DEFINED`      |
//! | compressed section | `GenSec -s EFI_SECTION_COMPRESSION -c PI_STD/PI_NONE`       |
//! | volume section     | `GenSec -s EFI_SECTION_FIRMWARE_VOLUME_IMAGE`, then a 16-byte alignment pass |
//!
//! Only the encapsulation chain that leads to a nested volume is replayed. A file without a
//! nested volume is taken verbatim from the leaf written during extraction.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::device::{Device, Volume, MAX_FILES_PER_VOLUME};
use crate::error::{FmmtError, Result};
use crate::ffs::{self, FileHeader, ATTRIB_FIXED};
use crate::guid::Guid;
use crate::primitives::align_up;
use crate::section::{
    SectionType, COMPRESSION_NONE, COMPRESSION_STANDARD, GUIDED_AUTH_STATUS_VALID,
    GUIDED_PROCESSING_REQUIRED, GUID_DEFINED_HEADER_SIZE,
};
use crate::tools::{run_checked, CommandRunner, ToolRegistry, Toolchain};
use crate::tree::{NodeId, NodeKind};
use crate::volume::{attribute_lines, FvHeader};

/// Argument vector under construction.
#[derive(Debug, Default)]
struct Args(Vec<OsString>);

impl Args {
    fn arg(mut self, a: impl AsRef<OsStr>) -> Self {
        self.0.push(a.as_ref().to_owned());
        self
    }

    fn args<I: IntoIterator<Item = P>, P: AsRef<OsStr>>(mut self, items: I) -> Self {
        self.0.extend(items.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }
}

fn guided_attribute_name(bit: u16) -> &'static str {
    match bit {
        GUIDED_PROCESSING_REQUIRED => "PROCESSING_REQUIRED",
        GUIDED_AUTH_STATUS_VALID => "AUTH_STATUS_VALID",
        _ => "NONE",
    }
}

/// A fresh, persisted file name inside `scratch`.
fn scratch_file(scratch: &Path, suffix: &str) -> Result<PathBuf> {
    tempfile::Builder::new()
        .prefix("fmmt-")
        .suffix(suffix)
        .tempfile_in(scratch)
        .map_err(|e| FmmtError::io(e, scratch))?
        .into_temp_path()
        .keep()
        .map_err(|e| FmmtError::io(e.error, scratch))
}

/// The GenFv descriptor for one volume.
pub fn volume_inf(header: &FvHeader, is_root: bool, files: &[PathBuf]) -> Result<String> {
    let block = header
        .primary_block()
        .ok_or_else(|| FmmtError::VolumeCorrupted("volume has an empty block map".into()))?;
    let mut inf = String::from("[options]\n");
    inf.push_str(&format!("EFI_BLOCK_SIZE  = 0x{:x}\n", block.length));
    if is_root {
        inf.push_str(&format!("EFI_NUM_BLOCKS  = 0x{:x}\n", block.num_blocks));
    }
    inf.push_str("[attributes]\n");
    for line in attribute_lines(header.attributes) {
        inf.push_str(&line);
        inf.push('\n');
    }
    if !files.is_empty() {
        inf.push_str("[files]\n");
        for f in files {
            inf.push_str(&format!("EFI_FILE_NAME = {}\n", f.display()));
        }
    }
    Ok(inf)
}

pub struct Rebuilder<'a> {
    registry: &'a ToolRegistry,
    runner: &'a dyn CommandRunner,
    toolchain: Toolchain,
}

impl<'a> Rebuilder<'a> {
    pub fn new(registry: &'a ToolRegistry, runner: &'a dyn CommandRunner) -> Self {
        Rebuilder {
            registry,
            runner,
            toolchain: Toolchain::default(),
        }
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Rebuilds a decomposed volume and returns the path of the image in `scratch`.
    ///
    /// Consumes the wrapper GUIDs recorded on file nodes, so a volume is rebuilt once per
    /// decomposition.
    pub fn rebuild(&self, volume: &mut Volume, scratch: &Path) -> Result<PathBuf> {
        let root = volume.root().ok_or_else(|| {
            FmmtError::InvalidParameter(format!("{} has not been decomposed", volume.name))
        })?;
        fs::create_dir_all(scratch).map_err(|e| FmmtError::io(e, scratch))?;

        let mut outputs: BTreeMap<NodeId, PathBuf> = BTreeMap::new();
        for depth in (0..=volume.tree.max_depth()).rev() {
            let level: Vec<NodeId> = volume.tree.at_depth(depth).collect();
            for id in level {
                if let Some(path) = self.replay(volume, id, &outputs, scratch)? {
                    outputs.insert(id, path);
                }
            }
            debug!(volume = %volume.name, depth, "replayed level");
        }

        let image = outputs.remove(&root).ok_or_else(|| {
            FmmtError::Aborted(format!("no image was produced for {}", volume.name))
        })?;
        info!(volume = %volume.name, image = %image.display(), "rebuilt volume");
        Ok(image)
    }

    fn replay(
        &self,
        volume: &mut Volume,
        id: NodeId,
        outputs: &BTreeMap<NodeId, PathBuf>,
        scratch: &Path,
    ) -> Result<Option<PathBuf>> {
        let inputs: Vec<PathBuf> = volume
            .tree
            .children(id)
            .filter_map(|c| outputs.get(&c).cloned())
            .collect();
        let node = volume.tree.node(id);
        let is_root = node.parent.is_none();
        let name_guid = node.name_guid;
        let kind = node.kind.clone();

        match kind {
            NodeKind::Volume { header, .. } => self
                .encode_volume(&header, is_root, name_guid, &inputs, scratch)
                .map(Some),
            NodeKind::File { header, slot } => {
                if !volume.tree.contains_volume(id) {
                    let attrs = &volume.files[slot];
                    return attrs.leaf_path.clone().map(Some).ok_or_else(|| {
                        FmmtError::NotFound(format!("no leaf file was extracted for {}", attrs.name))
                    });
                }
                let guid = volume.tree.take_name(id).unwrap_or(header.name);
                self.encode_file(&header, guid, &inputs, scratch).map(Some)
            }
            _ if !volume.tree.contains_volume(id) => Ok(None),
            NodeKind::VolumeSection => self.encode_volume_section(&inputs, scratch).map(Some),
            NodeKind::CompressedSection { compression_type } => self
                .encode_compressed(compression_type, &inputs, scratch)
                .map(Some),
            NodeKind::GuidedSection {
                guid,
                data_offset,
                attributes,
            } => self
                .encode_guided(guid, data_offset, attributes, &inputs, scratch)
                .map(Some),
        }
    }

    fn encode_volume(
        &self,
        header: &FvHeader,
        is_root: bool,
        name_guid: Option<Guid>,
        files: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf> {
        if files.len() > MAX_FILES_PER_VOLUME {
            return Err(FmmtError::OutOfResources(format!(
                "{} files exceed the {}-file volume capacity",
                files.len(),
                MAX_FILES_PER_VOLUME
            )));
        }
        let inf_path = scratch_file(scratch, ".inf")?;
        let inf = volume_inf(header, is_root, files)?;
        fs::write(&inf_path, inf).map_err(|e| FmmtError::io(e, &inf_path))?;

        let out = scratch_file(scratch, ".fv")?;
        let mut args = Args::default().arg("-i").arg(&inf_path).arg("-o").arg(&out);
        if let Some(g) = name_guid {
            args = args.arg("--FvNameGuid").arg(g.to_upper());
        }
        run_checked(self.runner, &self.toolchain.gen_fv, &args.0)?;
        Ok(out)
    }

    fn encode_file(
        &self,
        header: &FileHeader,
        guid: Guid,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf> {
        let type_name = ffs::file_type_name(ffs::TYPE_FIRMWARE_VOLUME_IMAGE)
            .unwrap_or("EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE");
        let out = scratch_file(scratch, ".ffs")?;
        let mut args = Args::default().arg("-t").arg(type_name);
        for input in inputs {
            args = args.arg("-i").arg(input);
        }
        args = args.arg("-g").arg(guid.to_string());
        if header.attributes & ATTRIB_FIXED != 0 {
            args = args.arg("-x");
        }
        args = args.arg("-o").arg(&out);
        run_checked(self.runner, &self.toolchain.gen_ffs, &args.0)?;
        Ok(out)
    }

    fn encode_volume_section(&self, inputs: &[PathBuf], scratch: &Path) -> Result<PathBuf> {
        let [image] = inputs else {
            return Err(FmmtError::InvalidParameter(format!(
                "a volume section wraps exactly one volume, found {}",
                inputs.len()
            )));
        };
        let section = scratch_file(scratch, ".sec")?;
        let args = Args::default()
            .arg("-s")
            .arg(section_name(SectionType::FirmwareVolumeImage))
            .arg(image)
            .arg("-o")
            .arg(&section);
        run_checked(self.runner, &self.toolchain.gen_sec, &args.0)?;

        let aligned = scratch_file(scratch, ".sec")?;
        let args = Args::default()
            .arg("--sectionalign")
            .arg("16")
            .arg(&section)
            .arg("-o")
            .arg(&aligned);
        run_checked(self.runner, &self.toolchain.gen_sec, &args.0)?;
        Ok(aligned)
    }

    fn encode_compressed(
        &self,
        compression_type: u8,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf> {
        let mode = match compression_type {
            COMPRESSION_STANDARD => "PI_STD",
            COMPRESSION_NONE => "PI_NONE",
            other => {
                return Err(FmmtError::SectionError(format!(
                    "cannot recompress with compression type {:#04x}",
                    other
                )))
            }
        };
        let out = scratch_file(scratch, ".sec")?;
        let args = Args::default()
            .arg("-s")
            .arg(section_name(SectionType::Compression))
            .arg("-c")
            .arg(mode)
            .args(inputs)
            .arg("-o")
            .arg(&out);
        run_checked(self.runner, &self.toolchain.gen_sec, &args.0)?;
        Ok(out)
    }

    fn encode_guided(
        &self,
        guid: Guid,
        data_offset: u16,
        attributes: u16,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf> {
        let tool = self
            .registry
            .lookup(&guid)
            .ok_or(FmmtError::Unsupported { guid })?;
        let header_extra = usize::from(data_offset)
            .checked_sub(GUID_DEFINED_HEADER_SIZE)
            .ok_or_else(|| {
                FmmtError::SectionError(format!(
                    "GUID-defined section {} has data offset {:#x}, below its header",
                    guid, data_offset
                ))
            })?;

        let payload = match inputs {
            [single] => single.clone(),
            _ => concat_aligned(inputs, scratch)?,
        };
        let encoded = scratch_file(scratch, ".enc")?;
        let args = Args::default()
            .arg("-e")
            .arg(&payload)
            .arg("-o")
            .arg(&encoded);
        run_checked(self.runner, &tool.path, &args.0)?;

        let out = scratch_file(scratch, ".sec")?;
        let args = Args::default()
            .arg("-s")
            .arg(section_name(SectionType::GuidDefined))
            .arg("-g")
            .arg(guid.to_string())
            .arg(&encoded)
            .arg("-o")
            .arg(&out)
            .arg("-r")
            .arg(guided_attribute_name(attributes & GUIDED_PROCESSING_REQUIRED))
            .arg("-r")
            .arg(guided_attribute_name(attributes & GUIDED_AUTH_STATUS_VALID))
            .arg("-l")
            .arg(header_extra.to_string());
        run_checked(self.runner, &self.toolchain.gen_sec, &args.0)?;
        Ok(out)
    }
}

fn section_name(kind: SectionType) -> &'static str {
    kind.gensec_name().unwrap_or("EFI_SECTION_RAW")
}

/// Joins `inputs` into one file, each starting on a 4-byte boundary.
fn concat_aligned(inputs: &[PathBuf], scratch: &Path) -> Result<PathBuf> {
    let mut joined = Vec::new();
    for input in inputs {
        joined.resize(align_up(joined.len(), 4), 0);
        let bytes = fs::read(input).map_err(|e| FmmtError::io(e, input))?;
        joined.extend_from_slice(&bytes);
    }
    let path = scratch_file(scratch, ".bin")?;
    let mut file = fs::File::create(&path).map_err(|e| FmmtError::io(e, &path))?;
    file.write_all(&joined)
        .map_err(|e| FmmtError::io(e, &path))?;
    Ok(path)
}

/// Rebuilds top-level volume `index` and returns a copy of the device with it spliced in.
pub fn rebuild_device(
    rebuilder: &Rebuilder<'_>,
    device: &mut Device,
    index: usize,
    scratch: &Path,
) -> Result<Vec<u8>> {
    let (_, volume) = device.volume_parts_mut(index)?;
    let image_path = rebuilder.rebuild(volume, scratch)?;
    let image = fs::read(&image_path).map_err(|e| FmmtError::io(e, &image_path))?;
    device.splice_volume(index, &image)
}
