//! View mode: what was found in each volume, as indented text or as JSON.

use std::fmt::Write;

use serde::Serialize;

use crate::device::{Device, FileAttributes, Volume};
use crate::error::{FmmtError, Result};
use crate::ffs;
use crate::guid::Guid;
use crate::tree::{NodeId, NodeKind, Tree};

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub name: Guid,
    pub file_type: Option<&'static str>,
    pub ui_name: Option<String>,
    pub level: u8,
    pub section_count: usize,
    pub has_depex: bool,
    pub version: Option<u16>,
    pub freeform_guid: Option<Guid>,
    pub leaf_path: Option<String>,
}

impl From<&FileAttributes> for FileReport {
    fn from(a: &FileAttributes) -> Self {
        FileReport {
            name: a.name,
            file_type: ffs::file_type_name(a.file_type),
            ui_name: a.ui_name.clone(),
            level: a.level,
            section_count: a.section_count,
            has_depex: a.has_depex,
            version: a.version,
            freeform_guid: a.freeform_guid,
            leaf_path: a.leaf_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeReport {
    pub name: String,
    /// Offset in the device; nested volumes have none.
    pub offset: Option<usize>,
    pub attributes: u32,
    pub size: u64,
    pub name_guid: Option<Guid>,
    pub files: Vec<FileReport>,
    pub children: Vec<VolumeReport>,
}

/// Builds the report for a decomposed top-level volume.
pub fn volume_report(volume: &Volume) -> Result<VolumeReport> {
    let root = volume.root().ok_or_else(|| {
        FmmtError::InvalidParameter(format!("{} has not been decomposed", volume.name))
    })?;
    let mut report = node_report(volume, root, volume.name.clone());
    report.offset = Some(volume.offset);
    Ok(report)
}

pub fn device_report(device: &Device) -> Result<Vec<VolumeReport>> {
    device.volumes.iter().map(volume_report).collect()
}

fn node_report(volume: &Volume, node: NodeId, name: String) -> VolumeReport {
    let tree = &volume.tree;
    let (attributes, size) = match &tree.node(node).kind {
        NodeKind::Volume { header, .. } => (header.attributes, header.length),
        _ => (0, 0),
    };
    let mut report = VolumeReport {
        name,
        offset: None,
        attributes,
        size,
        name_guid: tree.node(node).name_guid,
        files: Vec::new(),
        children: Vec::new(),
    };
    for file in tree.children(node) {
        if let NodeKind::File { slot, .. } = tree.node(file).kind {
            report.files.push(FileReport::from(&volume.files[slot]));
        }
        for nested in nested_volumes(tree, file) {
            let child_name = format!("{}-{}", report.name, report.children.len());
            report.children.push(node_report(volume, nested, child_name));
        }
    }
    report
}

/// Volume nodes reachable below `id` without passing through another volume.
fn nested_volumes(tree: &Tree, id: NodeId) -> Vec<NodeId> {
    let mut found = Vec::new();
    for child in tree.children(id) {
        match tree.node(child).kind {
            NodeKind::Volume { .. } => found.push(child),
            _ => found.extend(nested_volumes(tree, child)),
        }
    }
    found
}

/// The text report for every volume of `device`.
pub fn render_text(device: &Device) -> Result<String> {
    let mut out = String::new();
    for report in device_report(device)? {
        render_volume(&mut out, &report, None, 0);
    }
    Ok(out)
}

fn render_volume(out: &mut String, report: &VolumeReport, parent: Option<&str>, level: usize) {
    let indent = " ".repeat(level * 2);
    // Writing into a String cannot fail.
    let _ = match parent {
        None => writeln!(out, "\n{} :", report.name),
        Some(p) => writeln!(out, "{}Child FV named {} of {}", indent, report.name, p),
    };
    let _ = writeln!(out, "\n{}Attributes:            {:X}", indent, report.attributes);
    let _ = writeln!(out, "{}Total Volume Size:     0x{:08X}\n", indent, report.size);
    for file in &report.files {
        if let Some(ui) = &file.ui_name {
            let _ = writeln!(out, "{}File \"{}\"", indent, ui);
        }
    }
    for child in &report.children {
        render_volume(out, child, Some(&report.name), level + 1);
    }
}

pub fn render_json(device: &Device) -> Result<String> {
    let reports = device_report(device)?;
    serde_json::to_string_pretty(&reports)
        .map_err(|e| FmmtError::Aborted(format!("cannot encode report: {}", e)))
}
