//! Directory entries: the compiled form of schema nodes

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::{DefaultValue, SchemaKind, SchemaNode};
use crate::sem::NamedSemaphore;

use super::prefix::PrefixIndex;

/// Stored kind of a layout node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Unit,
    Array,
    Double,
    Int64,
    Int32,
    Int16,
    Int8,
    Bool,
    Char,
}

impl NodeKind {
    /// Whether this node holds children rather than a value.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Unit | Self::Array)
    }

    /// Byte width occupied in the payload. `None` for containers and for
    /// char arrays, whose width is declared per field.
    pub fn width(self) -> Option<u32> {
        match self {
            Self::Double | Self::Int64 => Some(8),
            Self::Int32 => Some(4),
            Self::Int16 => Some(2),
            Self::Int8 | Self::Bool => Some(1),
            Self::Unit | Self::Array | Self::Char => None,
        }
    }

    pub(crate) fn from_schema(node: &SchemaNode) -> Self {
        match node.kind {
            SchemaKind::Unit => Self::Unit,
            SchemaKind::Array => Self::Array,
            SchemaKind::Float => Self::Double,
            SchemaKind::Bool => Self::Bool,
            SchemaKind::String => Self::Char,
            SchemaKind::Int => match node.size {
                1 => Self::Int8,
                2 => Self::Int16,
                8 => Self::Int64,
                _ => Self::Int32,
            },
        }
    }
}

/// Compiled per-field metadata: kind, payload offset, timestamp offset,
/// children, and the semaphore guarding the enclosing container.
#[derive(Debug)]
pub struct LayoutNode {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) size: u32,
    pub(crate) offset: u32,
    pub(crate) time_offset: u32,
    pub(crate) precision: Option<u32>,
    pub(crate) hysteresis: u32,
    pub(crate) default: Option<DefaultValue>,
    pub(crate) children: Vec<LayoutNode>,
    pub(crate) index: PrefixIndex,
    pub(crate) sem: Option<Arc<NamedSemaphore>>,
}

impl LayoutNode {
    /// Declared identifier (decimal index for array children).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Byte width in the payload; for containers, the sum of descendant
    /// widths (informational).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Absolute byte offset of a scalar within the mapped segment.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Absolute offset of the scalar's 8-byte last-update timestamp.
    pub fn time_offset(&self) -> u32 {
        self.time_offset
    }

    /// Display precision hint from the schema, when declared.
    pub fn precision(&self) -> Option<u32> {
        self.precision
    }

    /// Change-detection band from the schema, 0 when absent.
    pub fn hysteresis(&self) -> u32 {
        self.hysteresis
    }

    /// Ordered children of a container (empty for scalars).
    pub fn children(&self) -> &[LayoutNode] {
        &self.children
    }

    /// Child by position: index order for arrays, alphabetical order for
    /// units.
    pub fn at(&self, idx: usize) -> Option<&LayoutNode> {
        self.children.get(idx)
    }

    /// Semaphore guarding this subtree. Containers own one; scalars
    /// reference their nearest container's.
    pub fn semaphore(&self) -> Option<&Arc<NamedSemaphore>> {
        self.sem.as_ref()
    }

    /// Resolve a `/`- or `.`-delimited path relative to this node.
    pub fn find(&self, path: &str) -> Option<&LayoutNode> {
        let mut node = self;
        for component in path.split(['/', '.']) {
            if component.is_empty() {
                return None;
            }
            let slot = node.index.lookup(component)?;
            node = node.children.get(slot)?;
        }
        Some(node)
    }

    /// Walk the subtree depth-first, containers before their children.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a LayoutNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}
