//! Nodes of a model graph.
//!
//! A [`GraphNode`] wraps one record of the desired or current state. Relation
//! values are not kept inside `data`; they live as child nodes reachable
//! through the node's [`RelationSlot`]s, which also remember the shape the
//! input used so the result can be reassembled faithfully.

use std::sync::{Arc, OnceLock};

use crate::id::{EdgeId, NodeId};
use crate::record::{key_of, KeyTuple, Record, DB_REF_PROP};
use crate::schema::RecordType;

/// The JSON shape a relation had in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotShape {
    /// `"relation": null`
    Null,
    /// `"relation": { ... }`
    One,
    /// `"relation": [ ... ]`
    Many,
}

/// One relation key of a node and the relation edges it produced.
#[derive(Debug, Clone)]
pub struct RelationSlot {
    pub name: String,
    pub shape: SlotShape,
    pub edges: Vec<EdgeId>,
}

/// One record in a model graph.
#[derive(Debug)]
pub struct GraphNode {
    pub id: NodeId,
    pub record_type: Arc<RecordType>,
    /// Own properties, relation keys removed, markers kept.
    pub data: Record,
    pub slots: Vec<RelationSlot>,
    pub parent_edge: Option<EdgeId>,
    /// Every edge touching this node, relation and reference alike.
    pub edges: Vec<EdgeId>,
    pub had_id_originally: bool,
    /// Value of `#id`.
    pub uid: Option<String>,
    /// Value of `#ref`.
    pub reference: Option<String>,
    pub detached: bool,
    pub(crate) relation_path: OnceLock<String>,
    pub(crate) data_path: OnceLock<String>,
    pub(crate) id_path: OnceLock<Option<String>>,
}

impl GraphNode {
    pub(crate) fn new(id: NodeId, record_type: Arc<RecordType>) -> Self {
        GraphNode {
            id,
            record_type,
            data: Record::new(),
            slots: Vec::new(),
            parent_edge: None,
            edges: Vec::new(),
            had_id_originally: false,
            uid: None,
            reference: None,
            detached: false,
            relation_path: OnceLock::new(),
            data_path: OnceLock::new(),
            id_path: OnceLock::new(),
        }
    }

    /// Current id tuple, if every id column is set.
    pub fn id_key(&self) -> Option<KeyTuple> {
        key_of(&self.data, &self.record_type.id_columns)
    }

    pub fn has_id(&self) -> bool {
        self.id_key().is_some()
    }

    /// Values of arbitrary columns of this node.
    pub fn key(&self, columns: &[String]) -> Option<KeyTuple> {
        key_of(&self.data, columns)
    }

    /// `true` for `#ref` nodes.
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// `true` for `#dbRef` nodes.
    pub fn is_db_reference(&self) -> bool {
        self.data.contains_key(DB_REF_PROP)
    }

    pub fn slot(&self, name: &str) -> Option<&RelationSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn type_name(&self) -> &str {
        &self.record_type.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_key_requires_all_columns() {
        let ty = Arc::new(RecordType::new("Pair", "pairs").with_id_columns(&["a", "b"]));
        let mut node = GraphNode::new(NodeId(0), ty);
        node.data.insert("a".into(), json!(1));
        assert!(!node.has_id());
        node.data.insert("b".into(), json!("x"));
        assert_eq!(node.id_key().unwrap().to_vec(), vec![json!(1), json!("x")]);
    }

    #[test]
    fn markers_classify_references() {
        let ty = Arc::new(RecordType::new("Person", "persons"));
        let mut node = GraphNode::new(NodeId(0), ty);
        assert!(!node.is_reference());
        assert!(!node.is_db_reference());
        node.data.insert(DB_REF_PROP.into(), json!(3));
        node.reference = Some("a".into());
        assert!(node.is_db_reference());
        assert!(node.is_reference());
        assert_eq!(node.type_name(), "Person");
    }
}
