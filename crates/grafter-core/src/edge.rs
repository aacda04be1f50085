//! Edges of a model graph.
//!
//! Relation edges form a forest: every non-root node has exactly one, its
//! parent edge. Reference edges connect a referencing node to the node whose
//! `#id` it names, possibly across branches.

use crate::id::{EdgeId, NodeId};
use crate::record::PathSegment;
use crate::schema::RelationRef;

/// What a reference edge copies from the referenced node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `#ref`: every property of the referenced node.
    Object,
    /// `#ref{uid.path}` inside a string property of the owner.
    Property {
        /// Location of the string inside the owner's data.
        path: Vec<PathSegment>,
        /// The literal to substitute.
        matched: String,
        /// Dotted path into the referenced node's data.
        related_path: Vec<String>,
    },
}

/// Edge payload.
#[derive(Debug, Clone)]
pub enum EdgeKind {
    /// Owner reaches related through a declared relation. `index` is the
    /// position inside an array slot.
    Relation {
        relation: RelationRef,
        index: Option<usize>,
    },
    /// Owner refers to related by uid.
    Reference(ReferenceKind),
}

/// An edge in the arena.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub owner: NodeId,
    pub related: NodeId,
    /// Set when pruning removes the edge from consideration.
    pub detached: bool,
}

impl GraphEdge {
    /// Returns the relation of a relation edge.
    pub fn relation(&self) -> Option<&RelationRef> {
        match &self.kind {
            EdgeKind::Relation { relation, .. } => Some(relation),
            EdgeKind::Reference(_) => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, EdgeKind::Reference(_))
    }

    pub fn is_object_reference(&self) -> bool {
        matches!(self.kind, EdgeKind::Reference(ReferenceKind::Object))
    }

    /// The endpoint that is not `node`.
    pub fn other(&self, node: NodeId) -> NodeId {
        if self.owner == node {
            self.related
        } else {
            self.owner
        }
    }
}
