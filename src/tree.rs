//! The decomposition tree.
//!
//! Nodes live in one growable arena and refer to each other by [`NodeId`]. Every node has a
//! `descend` link to its first child (the next, deeper level) and a `repeat` link to the next
//! node at the same level under the same parent. Appending is the only mutation during
//! decomposition; reconstruction consumes the per-file wrapper GUIDs and nothing else.

use serde::Serialize;

use crate::ffs::FileHeader;
use crate::guid::Guid;
use crate::volume::{FvExtHeader, FvHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Volume {
        header: FvHeader,
        ext_header: Option<FvExtHeader>,
    },
    File {
        header: FileHeader,
        /// Index into the owning volume's attribute table.
        slot: usize,
    },
    VolumeSection,
    CompressedSection {
        compression_type: u8,
    },
    GuidedSection {
        guid: Guid,
        data_offset: u16,
        attributes: u16,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Volume { .. } => "volume",
            NodeKind::File { .. } => "file",
            NodeKind::VolumeSection => "volume section",
            NodeKind::CompressedSection { .. } => "compressed section",
            NodeKind::GuidedSection { .. } => "guided section",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub depth: u8,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub descend: Option<NodeId>,
    pub repeat: Option<NodeId>,
    /// Volume nodes: the name from the extended header, handed to GenFv.
    /// File nodes: the file's own name, set once a nested volume is found inside it and
    /// taken by the reconstruction step that regenerates the file.
    pub name_guid: Option<Guid>,
    #[serde(skip)]
    last_child: Option<NodeId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node below `parent` (or as a root) at `parent.depth + 1`.
    pub fn push(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let depth = parent.map(|p| self.nodes[p.0].depth + 1).unwrap_or(0);
        let name_guid = match &kind {
            NodeKind::Volume {
                ext_header: Some(ext),
                ..
            } => Some(ext.name),
            _ => None,
        };
        self.nodes.push(Node {
            depth,
            kind,
            parent,
            descend: None,
            repeat: None,
            name_guid,
            last_child: None,
        });
        if let Some(p) = parent {
            match self.nodes[p.0].last_child {
                Some(prev) => self.nodes[prev.0].repeat = Some(id),
                None => self.nodes[p.0].descend = Some(id),
            }
            self.nodes[p.0].last_child = Some(id);
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Children of `id` in insertion order: the `descend` link, then its `repeat` chain.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.nodes[id.0].descend,
        }
    }

    pub fn max_depth(&self) -> u8 {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn at_depth(&self, depth: u8) -> impl Iterator<Item = NodeId> + '_ {
        self.ids().filter(move |id| self.nodes[id.0].depth == depth)
    }

    /// Sets the wrapper GUID on a file node unless one is already recorded.
    pub fn attach_name(&mut self, id: NodeId, guid: Guid) {
        let node = &mut self.nodes[id.0];
        if node.name_guid.is_none() {
            node.name_guid = Some(guid);
        }
    }

    /// Takes the recorded wrapper GUID; a second take yields `None`.
    pub fn take_name(&mut self, id: NodeId) -> Option<Guid> {
        self.nodes[id.0].name_guid.take()
    }

    /// True when `id` or anything below it is a nested volume section.
    pub fn contains_volume(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::VolumeSection)
            || self.children(id).any(|c| self.contains_volume(c))
    }
}

pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.nodes[id.0].repeat;
        Some(id)
    }
}
