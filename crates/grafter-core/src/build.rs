//! Graph construction from JSON input.
//!
//! Nodes are built depth-first in pre-order. Relation keys become child nodes
//! joined by relation edges; `#id`, `#ref` and `#dbRef` markers are read as the
//! nodes are created. Reference edges are added in a second pass once every
//! uid in the input is known, so a reference may point forward in the input.

use std::sync::Arc;

use serde_json::Value;

use crate::edge::{EdgeKind, GraphEdge, ReferenceKind};
use crate::error::CoreError;
use crate::graph::ModelGraph;
use crate::id::{EdgeId, NodeId};
use crate::node::{GraphNode, RelationSlot, SlotShape};
use crate::record::{
    format_path, has_key, property_refs, scalar_text, PathSegment, Record, DB_REF_PROP, UID_PROP,
    UID_REF_PROP,
};
use crate::schema::{RecordType, RelationRef, Schema};

impl ModelGraph {
    /// Builds a graph from one record or an array of records of `root_type`.
    pub fn build(schema: &Schema, root_type: &str, input: &Value) -> Result<ModelGraph, CoreError> {
        let ty = Arc::clone(schema.record_type(root_type)?);
        let mut builder = Builder {
            schema,
            graph: ModelGraph::default(),
        };

        match input {
            Value::Object(record) => {
                let root = builder.build_node(&ty, record, None, &mut Vec::new())?;
                builder.graph.roots.push(root);
            }
            Value::Array(items) => {
                builder.graph.input_was_array = true;
                for (i, item) in items.iter().enumerate() {
                    let mut path = vec![PathSegment::Index(i)];
                    let Value::Object(record) = item else {
                        return Err(CoreError::invalid_graph(
                            format_path(&path),
                            "expected an object",
                        ));
                    };
                    let root = builder.build_node(&ty, record, None, &mut path)?;
                    builder.graph.roots.push(root);
                }
            }
            _ => {
                return Err(CoreError::invalid_graph(
                    "",
                    "expected an object or an array of objects",
                ))
            }
        }

        builder.link_references()?;
        builder.graph.warm_paths();
        Ok(builder.graph)
    }
}

struct Builder<'a> {
    schema: &'a Schema,
    graph: ModelGraph,
}

impl Builder<'_> {
    fn build_node(
        &mut self,
        ty: &Arc<RecordType>,
        record: &Record,
        parent: Option<(NodeId, RelationRef, Option<usize>)>,
        path: &mut Vec<PathSegment>,
    ) -> Result<NodeId, CoreError> {
        let id = NodeId(self.graph.nodes.len() as u32);
        let mut node = GraphNode::new(id, Arc::clone(ty));

        for (key, value) in record {
            if !ty.is_relation(key) {
                node.data.insert(key.clone(), value.clone());
            }
        }
        self.read_markers(&mut node, path)?;
        node.had_id_originally = has_key(&node.data, &ty.id_columns);
        self.graph.nodes.push(node);

        if let Some((owner, relation, index)) = parent {
            let edge = self.push_edge(EdgeKind::Relation { relation, index }, owner, id);
            self.graph.nodes[id.index()].parent_edge = Some(edge);
        }

        for (key, value) in record {
            let Some(relation) = ty.relation(key) else {
                continue;
            };
            let related_ty = Arc::clone(self.schema.related_type(relation)?);
            let relation = RelationRef::find(ty, key)?;
            path.push(PathSegment::Key(key.clone()));

            let shape = match value {
                Value::Null => SlotShape::Null,
                Value::Object(_) => SlotShape::One,
                Value::Array(_) => SlotShape::Many,
                _ => {
                    return Err(CoreError::invalid_graph(
                        format_path(path),
                        format!("relation '{key}' must hold an object, an array of objects or null"),
                    ))
                }
            };
            let slot = self.graph.nodes[id.index()].slots.len();
            self.graph.nodes[id.index()].slots.push(RelationSlot {
                name: key.clone(),
                shape,
                edges: Vec::new(),
            });

            match value {
                Value::Object(nested) => {
                    let child = self.build_node(&related_ty, nested, Some((id, relation, None)), path)?;
                    self.record_slot_edge(id, slot, child);
                }
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        path.push(PathSegment::Index(i));
                        let Value::Object(nested) = item else {
                            return Err(CoreError::invalid_graph(
                                format_path(path),
                                "expected an object",
                            ));
                        };
                        let child = self.build_node(
                            &related_ty,
                            nested,
                            Some((id, relation.clone(), Some(i))),
                            path,
                        )?;
                        self.record_slot_edge(id, slot, child);
                        path.pop();
                    }
                }
                _ => {}
            }
            path.pop();
        }

        Ok(id)
    }

    fn read_markers(&mut self, node: &mut GraphNode, path: &[PathSegment]) -> Result<(), CoreError> {
        if let Some(uid) = node.data.get(UID_PROP) {
            let uid = marker_text(uid, UID_PROP, path)?;
            if self.graph.uids.insert(uid.clone(), node.id).is_some() {
                return Err(CoreError::invalid_graph(
                    format_path(path),
                    format!("duplicate {UID_PROP} '{uid}'"),
                ));
            }
            node.uid = Some(uid);
        }

        if let Some(uid) = node.data.get(UID_REF_PROP) {
            node.reference = Some(marker_text(uid, UID_REF_PROP, path)?);
        }

        if let Some(db_ref) = node.data.get(DB_REF_PROP).cloned() {
            let columns = node.record_type.id_columns.clone();
            let values = match db_ref {
                Value::Array(values) => values,
                Value::Null | Value::Object(_) => {
                    return Err(CoreError::invalid_graph(
                        format_path(path),
                        format!("{DB_REF_PROP} must be an id or an array of id values"),
                    ))
                }
                scalar => vec![scalar],
            };
            if values.len() != columns.len() {
                return Err(CoreError::invalid_graph(
                    format_path(path),
                    format!("{DB_REF_PROP} does not match the id columns {columns:?}"),
                ));
            }
            for (column, value) in columns.into_iter().zip(values) {
                node.data.insert(column, value);
            }
        }
        Ok(())
    }

    fn record_slot_edge(&mut self, owner: NodeId, slot: usize, child: NodeId) {
        if let Some(edge) = self.graph.nodes[child.index()].parent_edge {
            self.graph.nodes[owner.index()].slots[slot].edges.push(edge);
        }
    }

    fn push_edge(&mut self, kind: EdgeKind, owner: NodeId, related: NodeId) -> EdgeId {
        let id = EdgeId(self.graph.edges.len() as u32);
        self.graph.edges.push(GraphEdge {
            id,
            kind,
            owner,
            related,
            detached: false,
        });
        self.graph.nodes[owner.index()].edges.push(id);
        if owner != related {
            self.graph.nodes[related.index()].edges.push(id);
        }
        id
    }

    fn link_references(&mut self) -> Result<(), CoreError> {
        for index in 0..self.graph.nodes.len() {
            let id = NodeId(index as u32);

            if let Some(uid) = self.graph.nodes[index].reference.clone() {
                let target = self.resolve_uid(&uid, id)?;
                self.push_edge(EdgeKind::Reference(ReferenceKind::Object), id, target);
            }

            for found in property_refs(&self.graph.nodes[index].data) {
                let target = self.resolve_uid(&found.uid, id)?;
                let kind = ReferenceKind::Property {
                    path: found.path,
                    matched: found.matched,
                    related_path: found.related_path,
                };
                self.push_edge(EdgeKind::Reference(kind), id, target);
            }
        }
        Ok(())
    }

    fn resolve_uid(&self, uid: &str, from: NodeId) -> Result<NodeId, CoreError> {
        self.graph
            .node_by_uid(uid)
            .ok_or_else(|| CoreError::ReferenceNotFound {
                uid: uid.to_string(),
                data_path: self.graph.data_path(from).to_string(),
            })
    }
}

fn marker_text(value: &Value, marker: &str, path: &[PathSegment]) -> Result<String, CoreError> {
    match value {
        Value::String(_) | Value::Number(_) => Ok(scalar_text(value)),
        _ => Err(CoreError::invalid_graph(
            format_path(path),
            format!("{marker} must be a string or a number"),
        )),
    }
}
