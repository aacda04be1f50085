//! Nested upserts below related nodes.
//!
//! A node that is related rather than inserted had its subtree detached by
//! pruning. When it carries nested relation data, that subtree is upserted by
//! a separate engine call rooted at the related node. The nested call cannot
//! see the outer graph, so references leaving the subtree are resolved here
//! first.

use std::collections::{HashMap, HashSet};

use grafter_core::edge::{EdgeKind, ReferenceKind};
use grafter_core::record::{get_dotted, substitute_ref, DB_REF_PROP, UID_REF_PROP};
use grafter_core::{ModelGraph, NodeId, RelationExpression, Schema};
use grafter_storage::RecordStore;
use serde_json::Value;

use crate::batch::{concurrency_for, run_bounded};
use crate::config::EngineConfig;
use crate::data::GraphData;
use crate::error::Result;
use crate::upsert::UpsertGraph;

/// Upserts the nested data of every related node and returns each nested
/// result keyed by the related node.
///
/// The nested calls touch disjoint subtrees and run concurrently, bounded by
/// the related record types.
pub async fn recursive_phase(
    store: &dyn RecordStore,
    schema: &Schema,
    data: &mut GraphData,
    allowed: Option<&RelationExpression>,
    config: &EngineConfig,
) -> Result<HashMap<NodeId, Value>> {
    let nodes: Vec<NodeId> = data
        .graph
        .nodes()
        .filter(|node| {
            !data.graph.node(*node).slots.is_empty()
                && data.current_for(*node).is_none()
                && data.options.should_relate(*node, data)
        })
        .collect();
    if nodes.is_empty() {
        return Ok(HashMap::new());
    }

    for node in &nodes {
        resolve_outside_references(&mut data.graph, *node);
    }

    let graph = &data.graph;
    let mut calls = Vec::with_capacity(nodes.len());
    let mut inputs = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let mut value = graph.to_value(*node);
        if let Value::Object(root) = &mut value {
            root.remove(DB_REF_PROP);
            root.remove(UID_REF_PROP);
        }
        let path = graph.relation_path(*node);
        let root_type = graph.node(*node).type_name();
        tracing::debug!("recursive upsert of {} at '{}'", root_type, path);

        let mut nested = UpsertGraph::new(store, schema, root_type)
            .options(data.options.rebased(path))
            .config(config.clone());
        if let Some(allowed) = allowed {
            let scoped = path
                .split('.')
                .try_fold(allowed, |expr, name| expr.child(name))
                .cloned()
                .unwrap_or_default();
            nested = nested.allow_graph(scoped);
        }
        calls.push(nested);
        inputs.push(value);
    }

    let limit = concurrency_for(nodes.iter().map(|node| &*graph.node(*node).record_type), config);
    let tasks: Vec<_> = calls
        .iter()
        .zip(inputs)
        .map(|(call, input)| call.run(input))
        .collect();
    let results = run_bounded(tasks, limit).await?;
    Ok(nodes.into_iter().zip(results).collect())
}

/// Rewrites references from the subtree of `root` to nodes outside it: object
/// references become `#dbRef` markers and property references are substituted.
fn resolve_outside_references(graph: &mut ModelGraph, root: NodeId) {
    let mut subtree: HashSet<NodeId> = graph.descendants(root).into_iter().collect();
    subtree.insert(root);

    let mut object_refs = Vec::new();
    let mut property_refs = Vec::new();
    for member in &subtree {
        for edge in graph.node(*member).edges.iter().map(|e| graph.edge(*e)) {
            if edge.owner != *member || subtree.contains(&edge.related) {
                continue;
            }
            match &edge.kind {
                EdgeKind::Reference(ReferenceKind::Object) => {
                    if let Some(id) = graph.node(edge.related).id_key() {
                        let marker = match id.as_slice() {
                            [single] => single.clone(),
                            many => Value::Array(many.to_vec()),
                        };
                        object_refs.push((*member, marker));
                    }
                }
                EdgeKind::Reference(ReferenceKind::Property {
                    path,
                    matched,
                    related_path,
                }) => {
                    if let Some(value) = get_dotted(&graph.node(edge.related).data, related_path) {
                        property_refs.push((*member, path.clone(), matched.clone(), value.clone()));
                    }
                }
                EdgeKind::Relation { .. } => {}
            }
        }
    }

    for (member, marker) in object_refs {
        let data = &mut graph.node_mut(member).data;
        data.remove(UID_REF_PROP);
        data.insert(DB_REF_PROP.to_string(), marker);
    }
    for (member, path, matched, value) in property_refs {
        substitute_ref(&mut graph.node_mut(member).data, &path, &matched, &value);
    }
}
