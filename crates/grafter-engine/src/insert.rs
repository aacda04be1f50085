//! Insert planning and execution.
//!
//! The planner orders every attached desired node by its key dependencies:
//! the related side of a to-many relation needs the owner's key, the owner of
//! a to-one relation needs the related key, and a referencing node needs the
//! node it refers to. Nodes are emitted in waves; every node of a wave only
//! depends on nodes of earlier waves.
//!
//! The executor walks the waves in order. Entering a wave resolves each node's
//! inherited keys and references, which is safe because everything it depends
//! on has been written by then. The insertable nodes of the wave are then
//! grouped by record type, chunked and written concurrently. Join rows for new
//! or newly related many-to-many edges are written in a final pass.

use std::collections::HashMap;
use std::sync::Arc;

use grafter_core::edge::{EdgeKind, ReferenceKind};
use grafter_core::record::{
    get_dotted, is_internal_prop, key_of, set_key, storage_payload, substitute_ref,
};
use grafter_core::{KeyTuple, ModelGraph, NodeId, Record, RecordType, RelationKind, WriteKind};
use grafter_storage::RecordStore;
use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;

use crate::batch::{concurrency_for, run_bounded};
use crate::config::EngineConfig;
use crate::data::GraphData;
use crate::error::{Result, UpsertError};

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Dependency-ordered waves of attached desired nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub waves: Vec<Vec<NodeId>>,
}

impl InsertPlan {
    /// Index of the wave holding `node`.
    pub fn wave_of(&self, node: NodeId) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(&node))
    }
}

/// Orders the attached nodes of `graph` into dependency waves.
///
/// Fails with [`UpsertError::CyclicGraph`] when some nodes can never become
/// ready.
pub fn plan_inserts(graph: &ModelGraph) -> Result<InsertPlan> {
    // Arena-sized so that NodeIndex and NodeId coincide.
    let mut deps: DiGraph<NodeId, ()> = DiGraph::with_capacity(graph.arena_len(), 0);
    for slot in 0..graph.arena_len() {
        deps.add_node(NodeId(slot as u32));
    }
    for edge in graph.edges() {
        let (from, to) = match &edge.kind {
            EdgeKind::Relation { relation, .. } => match relation.kind {
                RelationKind::ToMany => (edge.owner, edge.related),
                RelationKind::ToOne => (edge.related, edge.owner),
                RelationKind::ManyToMany(_) => continue,
            },
            EdgeKind::Reference(_) => (edge.related, edge.owner),
        };
        deps.add_edge(from.into(), to.into(), ());
    }

    let mut pending: HashMap<NodeIndex, usize> = graph
        .nodes()
        .map(|node| {
            let index = NodeIndex::from(node);
            (index, deps.neighbors_directed(index, Direction::Incoming).count())
        })
        .collect();

    let mut ready: Vec<NodeIndex> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| *index)
        .collect();
    let mut waves = Vec::new();

    while !ready.is_empty() {
        ready.sort();
        for index in &ready {
            pending.remove(index);
        }
        let mut next = Vec::new();
        for index in &ready {
            for dependent in deps.neighbors_directed(*index, Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        waves.push(ready.iter().map(|index| NodeId::from(*index)).collect());
        ready = next;
    }

    if !pending.is_empty() {
        let mut cyclic: Vec<NodeIndex> = tarjan_scc(&deps)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || deps.contains_edge(component[0], component[0])
            })
            .flatten()
            .filter(|index| pending.contains_key(index))
            .collect();
        if cyclic.is_empty() {
            cyclic = pending.keys().copied().collect();
        }
        cyclic.sort();
        return Err(UpsertError::CyclicGraph {
            data_paths: cyclic
                .into_iter()
                .map(|index| graph.data_path(NodeId::from(index)).to_string())
                .collect(),
        });
    }

    Ok(InsertPlan { waves })
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Inserts every node the options mark for insertion, then the join rows of
/// new many-to-many edges.
pub async fn insert_phase(
    store: &dyn RecordStore,
    data: &mut GraphData,
    config: &EngineConfig,
) -> Result<()> {
    let plan = plan_inserts(&data.graph)?;
    tracing::debug!("insert plan has {} wave(s)", plan.waves.len());

    let batch_size = config.insert_batch_size(store);
    for wave in &plan.waves {
        for node in wave {
            resolve_node(data, *node);
        }
        let targets: Vec<NodeId> = wave
            .iter()
            .copied()
            .filter(|node| data.options.should_insert(*node, data))
            .collect();
        insert_nodes(store, data, &targets, batch_size, config).await?;
    }

    insert_join_rows(store, data, batch_size, config).await
}

/// Fills in everything `node` can learn from its dependencies and from its
/// current counterpart.
fn resolve_node(data: &mut GraphData, node: NodeId) {
    copy_forward(data, node);
    resolve_references(&mut data.graph, node);
    inherit_keys(&mut data.graph, node);
}

/// Every column of `node` that takes part in a relation.
pub(crate) fn relation_columns(graph: &ModelGraph, node: NodeId) -> Vec<String> {
    let this = graph.node(node);
    let mut columns = this.record_type.id_columns.clone();
    let mut push = |column: &String| {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    };
    for relation in &this.record_type.relations {
        relation.owner_key.iter().for_each(&mut push);
    }
    if let Some(relation) = graph.parent_relation(node) {
        relation.related_key.iter().for_each(&mut push);
    }
    columns
}

/// Copies relation columns the input left out from the current counterpart.
fn copy_forward(data: &mut GraphData, node: NodeId) {
    let Some(current) = data.current_for(node) else {
        return;
    };
    let known: Vec<(String, Value)> = relation_columns(&data.graph, node)
        .into_iter()
        .filter(|column| !data.graph.node(node).data.contains_key(column))
        .filter_map(|column| {
            let value = data.current.node(current).data.get(&column)?.clone();
            Some((column, value))
        })
        .collect();
    data.graph.node_mut(node).data.extend(known);
}

fn resolve_references(graph: &mut ModelGraph, node: NodeId) {
    let references: Vec<(ReferenceKind, NodeId)> = graph
        .references_from(node)
        .filter_map(|edge| match &edge.kind {
            EdgeKind::Reference(kind) => Some((kind.clone(), edge.related)),
            EdgeKind::Relation { .. } => None,
        })
        .collect();

    for (kind, target) in references {
        match kind {
            ReferenceKind::Object => {
                let props: Vec<(String, Value)> = graph
                    .node(target)
                    .data
                    .iter()
                    .filter(|(key, _)| !is_internal_prop(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                graph.node_mut(node).data.extend(props);
            }
            ReferenceKind::Property {
                path,
                matched,
                related_path,
            } => {
                let Some(value) = get_dotted(&graph.node(target).data, &related_path).cloned()
                else {
                    continue;
                };
                substitute_ref(&mut graph.node_mut(node).data, &path, &matched, &value);
            }
        }
    }
}

/// Foreign keys `node` holds toward nodes it depends on: the owner key of a
/// to-many parent and the related key of each to-one child.
pub(crate) fn inherited_keys(graph: &ModelGraph, node: NodeId) -> Vec<(Vec<String>, KeyTuple)> {
    let mut keys = Vec::new();

    if let Some(edge) = graph.parent_edge(node) {
        if let Some(relation) = edge.relation().filter(|r| r.is_to_many()) {
            if let Some(key) = graph.node(edge.owner).key(&relation.owner_key) {
                keys.push((relation.related_key.clone(), key));
            }
        }
    }

    for edge in graph.edges_of(node).filter(|e| e.owner == node) {
        let Some(relation) = edge.relation().filter(|r| r.is_to_one()) else {
            continue;
        };
        if let Some(key) = graph.node(edge.related).key(&relation.related_key) {
            keys.push((relation.owner_key.clone(), key));
        }
    }
    keys
}

fn inherit_keys(graph: &mut ModelGraph, node: NodeId) {
    for (columns, key) in inherited_keys(graph, node) {
        set_key(&mut graph.node_mut(node).data, &columns, &key);
    }
}

/// Runs the before-insert hook and the validator, and returns the row to write.
fn prepare_insert(graph: &mut ModelGraph, node: NodeId) -> Result<Record> {
    let omit = graph
        .parent_relation(node)
        .map(|relation| relation.extra_columns().to_vec())
        .unwrap_or_default();
    let this = graph.node_mut(node);
    let record_type = Arc::clone(&this.record_type);
    let rejected = |message| UpsertError::Validation {
        record_type: record_type.name.clone(),
        message,
    };

    if let Some(hook) = &record_type.hooks.before_insert {
        hook(&mut this.data).map_err(rejected)?;
    }
    let payload = storage_payload(&this.data, &omit);
    if let Some(validator) = &record_type.hooks.validator {
        validator(&payload, WriteKind::Insert).map_err(rejected)?;
    }
    Ok(payload)
}

async fn insert_nodes(
    store: &dyn RecordStore,
    data: &mut GraphData,
    nodes: &[NodeId],
    batch_size: usize,
    config: &EngineConfig,
) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }

    let mut by_type: IndexMap<String, Vec<NodeId>> = IndexMap::new();
    for node in nodes {
        by_type
            .entry(data.graph.node(*node).type_name().to_string())
            .or_default()
            .push(*node);
    }

    let mut batches: Vec<(Arc<RecordType>, Vec<NodeId>)> = Vec::new();
    let mut payloads: Vec<Vec<Record>> = Vec::new();
    for members in by_type.into_values() {
        for chunk in members.chunks(batch_size.max(1)) {
            let rows = chunk
                .iter()
                .map(|node| prepare_insert(&mut data.graph, *node))
                .collect::<Result<Vec<_>>>()?;
            let record_type = Arc::clone(&data.graph.node(chunk[0]).record_type);
            batches.push((record_type, chunk.to_vec()));
            payloads.push(rows);
        }
    }

    let limit = concurrency_for(batches.iter().map(|(ty, _)| &**ty), config);
    let tasks: Vec<_> = batches
        .iter()
        .zip(payloads)
        .map(|((ty, _), rows)| store.insert(&ty.table, &ty.id_columns, rows))
        .collect();
    let stored = run_bounded(tasks, limit).await?;

    for ((ty, chunk), rows) in batches.iter().zip(stored) {
        for (node, row) in chunk.iter().zip(rows) {
            if let Some(id) = key_of(&row, &ty.id_columns) {
                set_key(&mut data.graph.node_mut(*node).data, &ty.id_columns, &id);
            }
            data.inserted.insert(*node);
        }
        data.stats.inserted += chunk.len();
    }
    Ok(())
}

async fn insert_join_rows(
    store: &dyn RecordStore,
    data: &GraphData,
    batch_size: usize,
    config: &EngineConfig,
) -> Result<()> {
    // join table -> (key columns, rows)
    let mut tables: IndexMap<String, (Vec<String>, Vec<Record>)> = IndexMap::new();
    let mut owners: Vec<Arc<RecordType>> = Vec::new();

    for edge in data.graph.edges() {
        let Some(relation) = edge.relation() else {
            continue;
        };
        let Some(join) = relation.join_table() else {
            continue;
        };
        let related = edge.related;
        let is_new = data.was_inserted(related)
            || (data.current_for(related).is_none() && data.options.should_relate(related, data));
        if !is_new {
            continue;
        }
        let related_node = data.graph.node(related);
        let (Some(owner_key), Some(related_key)) = (
            data.graph.node(edge.owner).key(&relation.owner_key),
            related_node.key(&relation.related_key),
        ) else {
            continue;
        };

        let mut row = Record::new();
        set_key(&mut row, &join.owner_columns, &owner_key);
        set_key(&mut row, &join.related_columns, &related_key);
        for extra in &join.extra {
            if let Some(value) = related_node.data.get(extra) {
                row.insert(extra.clone(), value.clone());
            }
        }

        tables
            .entry(join.table.clone())
            .or_insert_with(|| {
                let columns = join
                    .owner_columns
                    .iter()
                    .chain(&join.related_columns)
                    .cloned()
                    .collect();
                (columns, Vec::new())
            })
            .1
            .push(row);
        owners.push(Arc::clone(relation.owner_type()));
    }

    if tables.is_empty() {
        return Ok(());
    }

    let limit = concurrency_for(owners.iter().map(|ty| &**ty), config);
    let mut tasks = Vec::new();
    for (table, (columns, rows)) in &tables {
        for chunk in rows.chunks(batch_size.max(1)) {
            tasks.push(store.insert(table, columns, chunk.to_vec()));
        }
    }
    let written: usize = run_bounded(tasks, limit).await?.iter().map(Vec::len).sum();
    tracing::debug!("inserted {} join row(s)", written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::existence::NodeDbExistence;
    use crate::options::GraphOptions;
    use grafter_core::{Relation, Schema};
    use grafter_storage::{InMemoryStore, OpKind};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .with_type(
                RecordType::new("Person", "persons")
                    .with_relation(Relation::to_many("children", "Person", &["id"], &["parentId"]))
                    .with_relation(Relation::to_one("parent", "Person", &["parentId"], &["id"]))
                    .with_relation(Relation::many_to_many(
                        "movies",
                        "Movie",
                        &["id"],
                        &["id"],
                        grafter_core::JoinTable {
                            table: "persons_movies".into(),
                            owner_columns: vec!["personId".into()],
                            related_columns: vec!["movieId".into()],
                            extra: vec!["role".into()],
                        },
                    )),
            )
            .with_type(RecordType::new("Movie", "movies"))
    }

    fn data(input: Value) -> GraphData {
        GraphData::new(
            ModelGraph::build(&schema(), "Person", &input).unwrap(),
            ModelGraph::empty(),
            GraphOptions {
                allow_refs: true,
                ..GraphOptions::default()
            },
            NodeDbExistence::assume_all(),
        )
    }

    #[test]
    fn to_one_before_owner_before_to_many() {
        let graph = ModelGraph::build(
            &schema(),
            "Person",
            &json!({"name": "A", "parent": {"name": "B"}, "children": [{"name": "C"}]}),
        )
        .unwrap();
        let plan = plan_inserts(&graph).unwrap();
        // relation keys are visited in map order: children before parent
        let (a, c, b) = (NodeId(0), NodeId(1), NodeId(2));
        assert!(plan.wave_of(b) < plan.wave_of(a));
        assert!(plan.wave_of(a) < plan.wave_of(c));
        assert_eq!(plan.waves, vec![vec![b], vec![a], vec![c]]);
    }

    #[test]
    fn many_to_many_adds_no_dependency() {
        let graph = ModelGraph::build(
            &schema(),
            "Person",
            &json!({"name": "A", "movies": [{"title": "M"}]}),
        )
        .unwrap();
        let plan = plan_inserts(&graph).unwrap();
        assert_eq!(plan.waves, vec![vec![NodeId(0), NodeId(1)]]);
    }

    #[test]
    fn reference_cycle_is_reported() {
        let graph = ModelGraph::build(
            &schema(),
            "Person",
            &json!({"#id": "a", "name": "A", "parent": {"name": "#ref{a.name}"}}),
        )
        .unwrap();
        match plan_inserts(&graph).unwrap_err() {
            UpsertError::CyclicGraph { data_paths } => {
                assert_eq!(data_paths, vec!["".to_string(), "parent".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn inserts_follow_key_dependencies() {
        let store = InMemoryStore::new();
        let mut data = data(json!({
            "name": "A",
            "parent": {"name": "P"},
            "children": [{"name": "C1"}, {"name": "C2"}]
        }));
        insert_phase(&store, &mut data, &EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(data.stats.inserted, 4);
        let rows = store.rows("persons").await;
        let find = |name: &str| {
            rows.iter()
                .find(|r| r.get("name") == Some(&json!(name)))
                .cloned()
                .unwrap()
        };
        assert_eq!(find("A").get("parentId"), find("P").get("id"));
        assert_eq!(find("C1").get("parentId"), find("A").get("id"));
        assert_eq!(find("C2").get("parentId"), find("A").get("id"));
        // one insert per wave
        assert_eq!(store.count(OpKind::Insert).await, 3);
    }

    #[tokio::test]
    async fn single_row_stores_get_one_call_per_row() {
        let store = InMemoryStore::without_multi_insert();
        let mut data = data(json!({"name": "A", "children": [{"name": "B"}, {"name": "C"}]}));
        insert_phase(&store, &mut data, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(store.count(OpKind::Insert).await, 3);
    }

    #[tokio::test]
    async fn references_resolve_after_their_target() {
        let store = InMemoryStore::new();
        let mut data = data(json!({
            "name": "A",
            "children": [
                {"#id": "first", "name": "Jenny"},
                {"name": "sister of #ref{first.name}", "note": "#ref{first.id}"}
            ]
        }));
        insert_phase(&store, &mut data, &EngineConfig::default())
            .await
            .unwrap();

        let sister = &data.graph.node(NodeId(2)).data;
        assert_eq!(sister.get("name"), Some(&json!("sister of Jenny")));
        assert_eq!(sister.get("note"), data.graph.node(NodeId(1)).data.get("id"));
    }

    #[tokio::test]
    async fn join_rows_carry_extras() {
        let store = InMemoryStore::new();
        let mut data = data(json!({"name": "A", "movies": [{"title": "M", "role": "lead"}]}));
        insert_phase(&store, &mut data, &EngineConfig::default())
            .await
            .unwrap();

        let movies = store.rows("movies").await;
        assert_eq!(movies.len(), 1);
        assert!(movies[0].get("role").is_none());
        let joins = store.rows("persons_movies").await;
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].get("personId"), Some(&json!(1)));
        assert_eq!(joins[0].get("movieId"), Some(&json!(1)));
        assert_eq!(joins[0].get("role"), Some(&json!("lead")));
    }

    #[tokio::test]
    async fn hooks_run_before_the_write() {
        let mut schema = Schema::new();
        schema.register(
            RecordType::new("Person", "persons")
                .with_before_insert(|record| {
                    record.insert("createdBy".into(), json!("hook"));
                    Ok(())
                })
                .with_validator(|record, _| {
                    if record.contains_key("name") {
                        Ok(())
                    } else {
                        Err("name is required".into())
                    }
                }),
        );
        let store = InMemoryStore::new();

        let mut ok = GraphData::new(
            ModelGraph::build(&schema, "Person", &json!({"name": "A"})).unwrap(),
            ModelGraph::empty(),
            GraphOptions::default(),
            NodeDbExistence::assume_all(),
        );
        insert_phase(&store, &mut ok, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(store.rows("persons").await[0].get("createdBy"), Some(&json!("hook")));

        let mut rejected = GraphData::new(
            ModelGraph::build(&schema, "Person", &json!({"age": 3})).unwrap(),
            ModelGraph::empty(),
            GraphOptions::default(),
            NodeDbExistence::assume_all(),
        );
        let err = insert_phase(&store, &mut rejected, &EngineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Validation { .. }));
        assert_eq!(store.rows("persons").await.len(), 1);
    }
}
