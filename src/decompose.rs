//! # Decomposition
//!
//! Walks a volume file by file, validates each file, and hands section-bearing bodies to the
//! recursive section parser. Every encapsulation level met on the way (nested volume,
//! compression, GUID-defined encoding) appends a node to the volume's tree, so that
//! [`crate::rebuild`] can later replay the same wrappings in reverse.
//!
//! In extraction mode each file that does not itself carry a nested volume is written out
//! once as a leaf, after its whole section list has been parsed.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::compress::{Decompress, EfiDecompressor};
use crate::device::{Device, FileAttributes, Volume};
use crate::error::{FmmtError, Result};
use crate::ffs::{
    self, FileHeader, FileIter, FoundFile, ATTRIB_CHECKSUM, FIXED_CHECKSUM, STATE_DATA_VALID,
};
use crate::guid::{self, Guid};
use crate::leaf;
use crate::primitives::{align_up, le_u16, le_u32, sum8};
use crate::section::{
    decode_ui_name, header_len, CompressionHeader, GuidDefinedHeader, SectionFrame, SectionType,
    COMMON_HEADER_SIZE, COMPRESSION_HEADER_SIZE, COMPRESSION_NONE, COMPRESSION_STANDARD,
    GUID_DEFINED_HEADER_SIZE,
};
use crate::tools::{run_checked, CommandRunner, ToolEntry, ToolRegistry};
use crate::tree::{NodeId, NodeKind};
use crate::volume::{warn_on_bad_checksum, FvHeader};

/// Encapsulation levels deeper than this are rejected instead of recursed into.
pub const MAX_NESTING: u8 = 64;

/// Where a section list sits: the tree node it hangs under and the file it belongs to.
///
/// Passed by value into each recursive call, so sibling sections always see their parent's
/// depth no matter how deep an earlier sibling went.
#[derive(Debug, Clone, Copy)]
struct ParseContext {
    parent: NodeId,
    depth: u8,
    file_node: NodeId,
    file_name: Guid,
    slot: usize,
}

pub struct Decomposer<'a> {
    registry: &'a ToolRegistry,
    runner: &'a dyn CommandRunner,
    decompressor: Box<dyn Decompress + 'a>,
    extract_to: Option<PathBuf>,
}

impl<'a> Decomposer<'a> {
    /// A view-mode decomposer using the built-in EFI decompressor.
    pub fn new(registry: &'a ToolRegistry, runner: &'a dyn CommandRunner) -> Self {
        Decomposer {
            registry,
            runner,
            decompressor: Box::new(EfiDecompressor::new()),
            extract_to: None,
        }
    }

    pub fn with_decompressor(mut self, decompressor: impl Decompress + 'a) -> Self {
        self.decompressor = Box::new(decompressor);
        self
    }

    /// Switches to extraction mode: leaf files are written into `dir`.
    pub fn extract_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_to = Some(dir.into());
        self
    }

    /// Decomposes every volume the scanner found.
    pub fn decompose_all(&self, device: &mut Device) -> Result<()> {
        for index in 0..device.volumes.len() {
            self.decompose_volume(device, index)?;
        }
        Ok(())
    }

    /// Decomposes top-level volume `index`, replacing anything recorded for it before.
    pub fn decompose_volume(&self, device: &mut Device, index: usize) -> Result<()> {
        if let Some(dir) = &self.extract_to {
            fs::create_dir_all(dir).map_err(|e| FmmtError::io(e, dir))?;
        }
        let (bytes, volume) = device.volume_parts_mut(index)?;
        volume.reset();
        self.parse_volume(volume, bytes, None)?;
        info!(
            volume = %volume.name,
            files = volume.files.len(),
            nodes = volume.tree.len(),
            leaves = volume.leaf_count,
            "decomposed volume"
        );
        Ok(())
    }

    fn parse_volume(
        &self,
        volume: &mut Volume,
        bytes: &[u8],
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let header = FvHeader::parse(bytes)?;
        if !header.is_known_file_system() {
            return Err(FmmtError::VolumeCorrupted(format!(
                "unknown file system {}",
                header.file_system
            )));
        }
        let ext_header = header.ext_header(bytes)?;
        warn_on_bad_checksum(&volume.name, &header, bytes);
        let files = FileIter::new(bytes, &header)?;
        let polarity = header.erase_polarity();

        if parent.is_none() {
            volume.header = Some(header.clone());
            volume.ext_header = ext_header;
        }
        let node = volume.tree.push(parent, NodeKind::Volume { header, ext_header });
        debug!(
            volume = %volume.name,
            depth = volume.tree.node(node).depth,
            nested = parent.is_some(),
            "parsing volume"
        );

        for file in files {
            self.parse_file(volume, file?, node, polarity)?;
        }
        Ok(node)
    }

    fn parse_file(
        &self,
        volume: &mut Volume,
        file: FoundFile<'_>,
        volume_node: NodeId,
        polarity: bool,
    ) -> Result<()> {
        let header = FileHeader::parse(file.bytes)?;
        let raw_header = &file.bytes[..header.header_size];

        let blank = if polarity { 0xFF } else { 0x00 };
        if raw_header.iter().all(|b| *b == blank) {
            return Ok(());
        }
        validate_file(&header, file.bytes, polarity)?;

        let depth = volume.tree.node(volume_node).depth + 1;
        let slot = volume.push_file(FileAttributes::new(
            header.name,
            header.file_type,
            depth,
            volume_node,
        ))?;
        debug!(
            file = %header.name,
            offset = file.offset,
            size = header.size,
            file_type = header.file_type,
            "file"
        );

        if header.file_type == ffs::TYPE_ALL || header.file_type == ffs::TYPE_FFS_PAD {
            return Ok(());
        }

        let file_type = header.file_type;
        let name = header.name;
        let header_size = header.header_size;
        let file_node = volume.tree.push(Some(volume_node), NodeKind::File { header, slot });

        if file_type != ffs::TYPE_RAW {
            let ctx = ParseContext {
                parent: file_node,
                depth,
                file_node,
                file_name: name,
                slot,
            };
            self.parse_sections(volume, &file.bytes[header_size..], ctx)?;
        }

        if let Some(dir) = &self.extract_to {
            if !volume.tree.contains_volume(file_node) {
                leaf::materialize(volume, slot, file.bytes, polarity, dir)?;
            }
        }
        Ok(())
    }

    /// Consumes `bytes` one section at a time, in 4-byte strides.
    fn parse_sections(&self, volume: &mut Volume, bytes: &[u8], ctx: ParseContext) -> Result<()> {
        let mut parsed = 0usize;
        while parsed < bytes.len() {
            let rest = &bytes[parsed..];
            if rest.len() < COMMON_HEADER_SIZE {
                return Err(FmmtError::SectionError(format!(
                    "sections do not fill the buffer: {} stray bytes at {:#x}",
                    rest.len(),
                    parsed
                )));
            }
            match SectionFrame::parse(rest)? {
                SectionFrame::Padding => parsed += COMMON_HEADER_SIZE,
                SectionFrame::Section {
                    kind,
                    length,
                    delta,
                } => {
                    if length < header_len(delta) || length > rest.len() {
                        return Err(FmmtError::SectionError(format!(
                            "section at {:#x} declares {:#x} bytes, {:#x} available",
                            parsed,
                            length,
                            rest.len()
                        )));
                    }
                    self.parse_section(volume, &rest[..length], kind, delta, ctx)?;
                    parsed = align_up(parsed + length, 4).min(bytes.len());
                }
            }
        }
        Ok(())
    }

    fn parse_section(
        &self,
        volume: &mut Volume,
        section: &[u8],
        kind: SectionType,
        delta: usize,
        ctx: ParseContext,
    ) -> Result<()> {
        let body = &section[header_len(delta)..];
        if !matches!(kind, SectionType::Disposable | SectionType::Unknown(_)) {
            volume.files[ctx.slot].section_count += 1;
        }

        match kind {
            SectionType::FirmwareVolumeImage => {
                let node = self.enter(volume, ctx, NodeKind::VolumeSection)?;
                volume.tree.attach_name(ctx.file_node, ctx.file_name);
                self.parse_volume(volume, body, Some(node))?;
            }
            SectionType::Compression => {
                let header = CompressionHeader::parse(section, delta)?;
                let node = self.enter(
                    volume,
                    ctx,
                    NodeKind::CompressedSection {
                        compression_type: header.compression_type,
                    },
                )?;
                let payload = &section[delta + COMPRESSION_HEADER_SIZE..];
                let inner = ctx.descend(node, volume);
                match header.compression_type {
                    COMPRESSION_NONE => {
                        if payload.len() != header.uncompressed_length as usize {
                            return Err(FmmtError::SectionError(format!(
                                "uncompressed section carries {:#x} bytes but declares {:#x}",
                                payload.len(),
                                header.uncompressed_length
                            )));
                        }
                        self.parse_sections(volume, payload, inner)?;
                    }
                    COMPRESSION_STANDARD => {
                        let decoded = self.expand(payload, header.uncompressed_length)?;
                        self.parse_sections(volume, &decoded, inner)?;
                    }
                    other => {
                        return Err(FmmtError::SectionError(format!(
                            "unknown compression type {:#04x}",
                            other
                        )))
                    }
                }
            }
            SectionType::GuidDefined => {
                let header = GuidDefinedHeader::parse(section, delta)?;
                let data_offset = usize::from(header.data_offset);
                if data_offset < delta + GUID_DEFINED_HEADER_SIZE || data_offset > section.len() {
                    return Err(FmmtError::SectionError(format!(
                        "GUID-defined section {} has data offset {:#x} in a {:#x}-byte section",
                        header.guid,
                        data_offset,
                        section.len()
                    )));
                }
                let node = self.enter(
                    volume,
                    ctx,
                    NodeKind::GuidedSection {
                        guid: header.guid,
                        data_offset: header.data_offset,
                        attributes: header.attributes,
                    },
                )?;
                let inner = ctx.descend(node, volume);
                let payload = &section[data_offset..];
                match self.registry.lookup(&header.guid) {
                    Some(tool) if !tool.is_verify_only() => {
                        let decoded = self.run_decoder(tool, payload)?;
                        self.parse_sections(volume, &decoded, inner)?;
                    }
                    _ if header.guid == guid::CRC32_SECTION => {
                        verify_crc32(section, delta, data_offset)?;
                        self.parse_sections(volume, payload, inner)?;
                    }
                    _ => return Err(FmmtError::Unsupported { guid: header.guid }),
                }
            }
            SectionType::UserInterface => {
                volume.files[ctx.slot].ui_name = Some(decode_ui_name(body));
            }
            SectionType::Version => {
                volume.files[ctx.slot].version = le_u16(body, 0).ok();
            }
            SectionType::FreeformSubtypeGuid => {
                volume.files[ctx.slot].freeform_guid = Guid::from_slice(body);
            }
            SectionType::DxeDepex | SectionType::PeiDepex | SectionType::SmmDepex => {
                volume.files[ctx.slot].has_depex = true;
            }
            SectionType::Pe32
            | SectionType::Pic
            | SectionType::Te
            | SectionType::Compatibility16
            | SectionType::Raw
            | SectionType::Disposable
            | SectionType::Unknown(_) => {}
        }
        Ok(())
    }

    /// Appends an encapsulation node under `ctx.parent`, bounding the nesting depth.
    fn enter(&self, volume: &mut Volume, ctx: ParseContext, kind: NodeKind) -> Result<NodeId> {
        if ctx.depth >= MAX_NESTING {
            return Err(FmmtError::SectionError(format!(
                "{} nested {} levels deep",
                kind.label(),
                ctx.depth
            )));
        }
        debug!(file = %ctx.file_name, depth = ctx.depth + 1, kind = kind.label(), "encapsulation");
        Ok(volume.tree.push(Some(ctx.parent), kind))
    }

    fn expand(&self, payload: &[u8], uncompressed_length: u32) -> Result<Vec<u8>> {
        let size = self.decompressor.decoded_size(payload)?;
        if size != uncompressed_length {
            return Err(FmmtError::SectionError(format!(
                "compressed stream decodes to {:#x} bytes, section declares {:#x}",
                size, uncompressed_length
            )));
        }
        let mut out = Vec::new();
        out.try_reserve_exact(size as usize).map_err(|_| {
            FmmtError::OutOfResources(format!("cannot allocate {:#x} bytes", size))
        })?;
        out.resize(size as usize, 0);
        self.decompressor.decompress(payload, &mut out)?;
        Ok(out)
    }

    /// `<tool> -d -o <out> <in>` in a scratch directory that is removed on return.
    fn run_decoder(&self, tool: &ToolEntry, payload: &[u8]) -> Result<Vec<u8>> {
        let scratch = tempfile::Builder::new().prefix("fmmt-decode").tempdir()?;
        let input = scratch.path().join("section.in");
        let output = scratch.path().join("section.out");
        fs::write(&input, payload).map_err(|e| FmmtError::io(e, &input))?;

        debug!(tool = %tool.name, bytes = payload.len(), "decoding GUID-defined section");
        let args: Vec<OsString> = vec![
            "-d".into(),
            "-o".into(),
            output.clone().into_os_string(),
            input.into_os_string(),
        ];
        run_checked(self.runner, &tool.path, &args)?;
        fs::read(&output).map_err(|e| FmmtError::io(e, &output))
    }
}

impl ParseContext {
    fn descend(self, node: NodeId, volume: &Volume) -> Self {
        ParseContext {
            parent: node,
            depth: volume.tree.node(node).depth,
            ..self
        }
    }
}

/// Header checksum, state and body checksum rules for one data-valid file.
pub fn validate_file(header: &FileHeader, bytes: &[u8], polarity: bool) -> Result<()> {
    if ffs::file_state(polarity, header.state) != STATE_DATA_VALID {
        return Err(FmmtError::Aborted(format!(
            "file {} has unrecognized state bits {:#04x}",
            header.name, header.state
        )));
    }

    let sum = sum8(&bytes[..header.header_size])
        .wrapping_sub(header.file_checksum)
        .wrapping_sub(header.state);
    if sum != 0 {
        return Err(FmmtError::Aborted(format!(
            "file {} has an invalid header checksum",
            header.name
        )));
    }

    if header.attributes & ATTRIB_CHECKSUM != 0 {
        let body = &bytes[header.header_size..];
        if sum8(body).wrapping_add(header.file_checksum) != 0 {
            return Err(FmmtError::Aborted(format!(
                "file {} has an invalid file checksum",
                header.name
            )));
        }
    } else if header.file_checksum != FIXED_CHECKSUM {
        return Err(FmmtError::Aborted(format!(
            "file {} is not checksummed but stores {:#04x} instead of {:#04x}",
            header.name, header.file_checksum, FIXED_CHECKSUM
        )));
    }
    Ok(())
}

/// Checks the CRC32 stored right after the GUID-defined header, when there is room for one.
fn verify_crc32(section: &[u8], delta: usize, data_offset: usize) -> Result<()> {
    let crc_offset = delta + GUID_DEFINED_HEADER_SIZE;
    if data_offset < crc_offset + 4 {
        return Ok(());
    }
    let stored = le_u32(section, crc_offset)?;
    let actual = crc32fast::hash(&section[data_offset..]);
    if stored != actual {
        return Err(FmmtError::Aborted(format!(
            "CRC32 section checksum {:#010x} does not match payload ({:#010x})",
            stored, actual
        )));
    }
    Ok(())
}
