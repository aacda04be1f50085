//! The arena-backed model graph.
//!
//! [`ModelGraph`] stores nodes and edges in flat vectors indexed by
//! [`NodeId`] and [`EdgeId`]. Relation edges form a forest rooted at the input
//! records; reference edges link nodes across branches. The desired graph (built
//! from input) and the current graph (built from fetched rows) are correlated by
//! id path: the chain of relation names and identifiers from a root.
//!
//! Pruning never removes arena entries. It marks whole subtrees detached, which
//! hides them from traversal while keeping their data for result assembly.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use serde_json::Value;

use crate::edge::{EdgeKind, GraphEdge};
use crate::id::{EdgeId, NodeId};
use crate::node::{GraphNode, SlotShape};
use crate::record::{format_path, key_string, PathSegment, DB_REF_PROP, UID_REF_PROP};
use crate::schema::RelationRef;

/// A desired or current graph of records.
#[derive(Debug, Default)]
pub struct ModelGraph {
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) edges: Vec<GraphEdge>,
    pub(crate) roots: Vec<NodeId>,
    pub(crate) input_was_array: bool,
    pub(crate) uids: HashMap<String, NodeId>,
    by_id_path: OnceLock<HashMap<String, NodeId>>,
}

impl ModelGraph {
    /// A graph with no nodes, used as the current graph of pure inserts.
    pub fn empty() -> Self {
        ModelGraph::default()
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut GraphNode {
        &mut self.nodes[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &GraphEdge {
        &self.edges[id.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of arena slots, detached nodes included. Every `NodeId` of this
    /// graph is below it.
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of attached nodes, in construction (depth-first pre-) order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().filter(|n| !n.detached).map(|n| n.id)
    }

    /// Attached edges.
    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.edges.iter().filter(|e| !e.detached)
    }

    /// Attached edges touching `node`.
    pub fn edges_of(&self, node: NodeId) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.node(node)
            .edges
            .iter()
            .map(|e| self.edge(*e))
            .filter(|e| !e.detached)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn input_was_array(&self) -> bool {
        self.input_was_array
    }

    pub fn node_by_uid(&self, uid: &str) -> Option<NodeId> {
        self.uids.get(uid).copied()
    }

    pub fn parent_edge(&self, node: NodeId) -> Option<&GraphEdge> {
        self.node(node).parent_edge.map(|e| self.edge(e))
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parent_edge(node).map(|e| e.owner)
    }

    /// The relation through which `node` was reached from its parent.
    pub fn parent_relation(&self, node: NodeId) -> Option<&RelationRef> {
        self.parent_edge(node).and_then(|e| e.relation())
    }

    /// Attached children of `node` through its relation slots.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.node(node)
            .slots
            .iter()
            .flat_map(|slot| slot.edges.iter())
            .map(|e| self.edge(*e))
            .filter(|e| !e.detached)
            .map(|e| e.related)
            .collect()
    }

    /// Every descendant of `node`, attached or not.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.all_children(node).collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.all_children(next));
        }
        out
    }

    fn all_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(node)
            .slots
            .iter()
            .flat_map(|slot| slot.edges.iter())
            .map(|e| self.edge(*e).related)
    }

    /// Reference edges owned by `node` (what it refers to).
    pub fn references_from(&self, node: NodeId) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.edges_of(node)
            .filter(move |e| e.is_reference() && e.owner == node)
    }

    /// Reference edges pointing at `node` (who refers to it).
    pub fn references_to(&self, node: NodeId) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.edges_of(node)
            .filter(move |e| e.is_reference() && e.related == node)
    }

    /// Every reference edge, detached ones included.
    pub fn all_references(&self) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.edges.iter().filter(|e| e.is_reference())
    }

    /// `node` itself when attached, otherwise its nearest attached ancestor.
    pub fn attached_ancestor(&self, node: NodeId) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if !self.node(id).detached {
                return Some(id);
            }
            current = self.parent(id);
        }
        None
    }

    /// Keeps only the nodes of `set` that have no ancestor in `set`.
    pub fn branch_roots(&self, set: &[NodeId]) -> Vec<NodeId> {
        let members: HashSet<NodeId> = set.iter().copied().collect();
        set.iter()
            .copied()
            .filter(|node| {
                let mut current = self.parent(*node);
                while let Some(ancestor) = current {
                    if members.contains(&ancestor) {
                        return false;
                    }
                    current = self.parent(ancestor);
                }
                true
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    /// Relation names from the root, dotted. Empty for roots.
    pub fn relation_path(&self, node: NodeId) -> &str {
        self.node(node).relation_path.get_or_init(|| {
            let Some(edge) = self.parent_edge(node) else {
                return String::new();
            };
            let name = edge.relation().map_or("", |r| r.name.as_str());
            let parent = self.relation_path(edge.owner);
            if parent.is_empty() {
                name.to_string()
            } else {
                format!("{parent}.{name}")
            }
        })
    }

    /// Location of `node` in the input, e.g. `children[0].pets[1]`.
    pub fn data_path(&self, node: NodeId) -> &str {
        self.node(node)
            .data_path
            .get_or_init(|| format_path(&self.data_path_segments(node)))
    }

    fn data_path_segments(&self, node: NodeId) -> Vec<PathSegment> {
        let mut segments = Vec::new();
        let mut current = node;
        while let Some(edge) = self.parent_edge(current) {
            if let EdgeKind::Relation { relation, index } = &edge.kind {
                if let Some(i) = index {
                    segments.push(PathSegment::Index(*i));
                }
                segments.push(PathSegment::Key(relation.name.clone()));
            }
            current = edge.owner;
        }
        if self.input_was_array {
            if let Some(i) = self.roots.iter().position(|r| *r == current) {
                segments.push(PathSegment::Index(i));
            }
        }
        segments.reverse();
        segments
    }

    /// Correlation key of `node`, defined only when it and every ancestor
    /// carry an id.
    ///
    /// Computed once and cached; the first call must happen before any id is
    /// generated, which graph construction guarantees.
    pub fn id_path_key(&self, node: NodeId) -> Option<&str> {
        self.node(node)
            .id_path
            .get_or_init(|| {
                let this = self.node(node);
                let id = key_string(&this.id_key()?);
                match self.parent_edge(node) {
                    None => Some(format!("{}:{id}", this.record_type.table)),
                    Some(edge) => {
                        let parent = self.id_path_key(edge.owner)?;
                        let name = edge.relation().map_or("", |r| r.name.as_str());
                        Some(format!("{parent}/{name}:{id}"))
                    }
                }
            })
            .as_deref()
    }

    /// Attached node with the given id path key.
    pub fn node_by_id_path(&self, key: &str) -> Option<NodeId> {
        self.by_id_path
            .get_or_init(|| {
                self.nodes()
                    .filter_map(|n| self.id_path_key(n).map(|k| (k.to_string(), n)))
                    .collect()
            })
            .get(key)
            .copied()
    }

    /// The node of `self` that represents the same record as `node` of `other`.
    pub fn counterpart(&self, other: &ModelGraph, node: NodeId) -> Option<NodeId> {
        other
            .id_path_key(node)
            .and_then(|key| self.node_by_id_path(key))
    }

    pub(crate) fn warm_paths(&self) {
        for node in self.nodes.iter().map(|n| n.id) {
            self.relation_path(node);
            self.data_path(node);
            self.id_path_key(node);
        }
    }

    // -----------------------------------------------------------------------
    // Pruning
    // -----------------------------------------------------------------------

    /// Detaches the descendants of each of `roots`, keeping the roots.
    pub fn detach_descendants(&mut self, roots: &[NodeId]) {
        let doomed: Vec<NodeId> = roots.iter().flat_map(|r| self.descendants(*r)).collect();
        self.detach(&doomed);
    }

    /// Detaches each of `nodes` together with its descendants.
    pub fn detach_branches(&mut self, nodes: &[NodeId]) {
        let mut doomed: Vec<NodeId> = nodes.to_vec();
        for node in nodes {
            doomed.extend(self.descendants(*node));
        }
        self.detach(&doomed);
    }

    fn detach(&mut self, doomed: &[NodeId]) {
        if doomed.is_empty() {
            return;
        }
        for node in doomed {
            self.nodes[node.index()].detached = true;
        }
        for edge in &mut self.edges {
            if self.nodes[edge.owner.index()].detached || self.nodes[edge.related.index()].detached {
                edge.detached = true;
            }
        }
        self.by_id_path = OnceLock::new();
    }

    // -----------------------------------------------------------------------
    // Result assembly
    // -----------------------------------------------------------------------

    /// Reassembles `node` and all its descendants, markers included.
    pub fn to_value(&self, node: NodeId) -> Value {
        self.assemble(node, &HashMap::new(), false)
    }

    /// Reassembles the whole input in its original shape, replacing the
    /// subtrees named in `overrides` and dropping `#ref`/`#dbRef` markers.
    pub fn to_output(&self, overrides: &HashMap<NodeId, Value>) -> Value {
        let mut roots = self
            .roots
            .iter()
            .map(|r| self.assemble(*r, overrides, true));
        if self.input_was_array {
            Value::Array(roots.collect())
        } else {
            roots.next().unwrap_or(Value::Null)
        }
    }

    fn assemble(&self, node: NodeId, overrides: &HashMap<NodeId, Value>, strip: bool) -> Value {
        if let Some(value) = overrides.get(&node) {
            return value.clone();
        }
        let this = self.node(node);
        let mut out = this.data.clone();
        if strip {
            out.remove(UID_REF_PROP);
            out.remove(DB_REF_PROP);
        }
        for slot in &this.slots {
            let value = match slot.shape {
                SlotShape::Null => Value::Null,
                SlotShape::One => slot
                    .edges
                    .first()
                    .map(|e| self.assemble(self.edge(*e).related, overrides, strip))
                    .unwrap_or(Value::Null),
                SlotShape::Many => Value::Array(
                    slot.edges
                        .iter()
                        .map(|e| self.assemble(self.edge(*e).related, overrides, strip))
                        .collect(),
                ),
            };
            out.insert(slot.name.clone(), value);
        }
        Value::Object(out)
    }
}
